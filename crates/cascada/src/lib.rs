//! Cascada: a templating and scripting engine that parallelizes independent
//! work automatically while keeping observable semantics sequential where
//! the source demands them.
//!
//! Expressions with no data dependency run concurrently; dependencies are
//! enforced by per-variable write gates, and `!`-marked paths execute their
//! operations in strict source order. Failures never abort sibling work:
//! they become poison values whose errors collect into one deterministic,
//! source-ordered bundle.
//!
//! # Quickstart
//!
//! ```no_run
//! use cascada::{configure, context, Options};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let env = configure(Options::default().autoescape(true));
//!     env.add_filter("shout", |args| {
//!         Ok(cascada::Value::from(args.get(0).render().to_uppercase()))
//!     });
//!
//!     let out = env
//!         .render_template_string("Hello {{ name | shout }}!", context! { name: "world" })
//!         .await?;
//!     assert_eq!(out, "Hello WORLD!");
//!     Ok(())
//! }
//! ```
//!
//! Scripts produce structured data instead of text:
//!
//! ```no_run
//! # use cascada::{configure, Context, Options};
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let env = configure(Options::default());
//! let out = env
//!     .render_script_string(":data\n@data.items.push(1)", Context::new())
//!     .await?;
//! assert_eq!(out.data, serde_json::json!({"items": [1]}));
//! # Ok(())
//! # }
//! ```
//!
//! Render futures are `!Send`; drive them on one thread (the examples use a
//! current-thread runtime).

pub mod ast;
mod builtins;
mod context;
mod environment;
mod error;
mod exec;
mod output;
mod parse;
mod runtime;
mod script;
mod template;
mod transform;
mod value;

/// Tracing target for render and compile spans.
pub const TRACE_TARGET_RENDER: &str = "cascada::render";

pub use context::Context;
pub use environment::{
    configure, Environment, FileSystemLoader, Loader, LoaderSource, MemoryLoader, Options,
};
pub use error::{CompileError, Error, Pos, PoisonError, RenderError, RenderErrorKind, Result};
pub use parse::SyntaxConfig;
pub use runtime::call::MacroValue;
pub use runtime::iterate::stream_of;
pub use script::{CommandHandler, CommandRecord, DataMethod, PathValue, ScriptOutput};
pub use template::{Script, Template};
pub use value::{Args, Func, FuncReturn, IterError, IterResult, Lazy, Value, ValueMap, ValueStream};
