//! Environment configuration and registries.
//!
//! The environment owns everything shared across renders: options, filters,
//! tests, globals, extensions, command handlers, data methods, the loader
//! and the compiled-unit cache. Rendering itself is single-threaded; the
//! environment hands `Rc` clones of itself to each render.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use tracing::{debug, info_span, Instrument};

use crate::context::Context;
use crate::error::{Error, RenderError, Result};
use crate::exec::{compile, run_script, run_template, CompiledUnit, Mode};
use crate::parse::SyntaxConfig;
use crate::script::data::DataMethod;
use crate::script::{CommandHandler, HandlerRegistration, ScriptOutput};
use crate::template::{Script, Template};
use crate::transform::CompileHints;
use crate::value::{Args, Value};
use crate::TRACE_TARGET_RENDER;

/// Global engine options.
#[derive(Debug, Clone)]
pub struct Options {
    pub autoescape: bool,
    pub throw_on_undefined: bool,
    pub trim_blocks: bool,
    pub lstrip_blocks: bool,
    pub no_cache: bool,
    pub block_start: String,
    pub block_end: String,
    pub variable_start: String,
    pub variable_end: String,
    pub comment_start: String,
    pub comment_end: String,
}

impl Default for Options {
    fn default() -> Self {
        let syntax = SyntaxConfig::default();
        Self {
            autoescape: false,
            throw_on_undefined: false,
            trim_blocks: false,
            lstrip_blocks: false,
            no_cache: false,
            block_start: syntax.block_start,
            block_end: syntax.block_end,
            variable_start: syntax.variable_start,
            variable_end: syntax.variable_end,
            comment_start: syntax.comment_start,
            comment_end: syntax.comment_end,
        }
    }
}

impl Options {
    #[must_use]
    pub fn autoescape(mut self, on: bool) -> Self {
        self.autoescape = on;
        self
    }

    #[must_use]
    pub fn throw_on_undefined(mut self, on: bool) -> Self {
        self.throw_on_undefined = on;
        self
    }

    #[must_use]
    pub fn trim_blocks(mut self, on: bool) -> Self {
        self.trim_blocks = on;
        self
    }

    #[must_use]
    pub fn lstrip_blocks(mut self, on: bool) -> Self {
        self.lstrip_blocks = on;
        self
    }

    #[must_use]
    pub fn no_cache(mut self, on: bool) -> Self {
        self.no_cache = on;
        self
    }

    #[must_use]
    pub fn delimiters(
        mut self,
        block: (&str, &str),
        variable: (&str, &str),
        comment: (&str, &str),
    ) -> Self {
        self.block_start = block.0.to_string();
        self.block_end = block.1.to_string();
        self.variable_start = variable.0.to_string();
        self.variable_end = variable.1.to_string();
        self.comment_start = comment.0.to_string();
        self.comment_end = comment.1.to_string();
        self
    }

    fn syntax(&self) -> SyntaxConfig {
        SyntaxConfig {
            block_start: self.block_start.clone(),
            block_end: self.block_end.clone(),
            variable_start: self.variable_start.clone(),
            variable_end: self.variable_end.clone(),
            comment_start: self.comment_start.clone(),
            comment_end: self.comment_end.clone(),
            trim_blocks: self.trim_blocks,
            lstrip_blocks: self.lstrip_blocks,
        }
    }
}

/// A registered user callable; synchronous entries never suspend, which the
/// annotator exploits.
#[derive(Clone)]
pub(crate) enum Callable {
    Sync(Rc<dyn Fn(Args) -> core::result::Result<Value, RenderError>>),
    Async(Rc<dyn Fn(Args) -> LocalBoxFuture<'static, core::result::Result<Value, RenderError>>>),
}

/// Source returned by a loader.
pub struct LoaderSource {
    pub src: String,
    pub path: Option<String>,
    pub no_cache: bool,
}

/// Template source provider. Implementations may hit the filesystem or any
/// other backing store; returning `Ok(None)` means "no such template".
#[async_trait(?Send)]
pub trait Loader {
    /// # Errors
    /// Returns an error when the source exists but cannot be read.
    async fn get_source(&self, name: &str) -> anyhow::Result<Option<LoaderSource>>;
}

/// Name → source map; the loader tests and examples use.
#[derive(Default)]
pub struct MemoryLoader {
    sources: RefCell<HashMap<String, String>>,
}

impl MemoryLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: impl Into<String>, src: impl Into<String>) {
        self.sources.borrow_mut().insert(name.into(), src.into());
    }
}

#[async_trait(?Send)]
impl Loader for MemoryLoader {
    async fn get_source(&self, name: &str) -> anyhow::Result<Option<LoaderSource>> {
        Ok(self.sources.borrow().get(name).map(|src| LoaderSource {
            src: src.clone(),
            path: Some(name.to_string()),
            no_cache: false,
        }))
    }
}

/// Loads templates from files under a root directory.
pub struct FileSystemLoader {
    root: PathBuf,
    no_cache: bool,
}

impl FileSystemLoader {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            no_cache: false,
        }
    }

    #[must_use]
    pub const fn no_cache(mut self, on: bool) -> Self {
        self.no_cache = on;
        self
    }
}

#[async_trait(?Send)]
impl Loader for FileSystemLoader {
    async fn get_source(&self, name: &str) -> anyhow::Result<Option<LoaderSource>> {
        let path = self.root.join(name);
        if !path.starts_with(&self.root) {
            return Ok(None);
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(src) => Ok(Some(LoaderSource {
                src,
                path: Some(path.to_string_lossy().into_owned()),
                no_cache: self.no_cache,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

pub(crate) struct EnvInner {
    options: Options,
    syntax: SyntaxConfig,
    filters: RefCell<HashMap<String, Callable>>,
    tests: RefCell<HashMap<String, Callable>>,
    globals: RefCell<HashMap<String, Value>>,
    extensions: RefCell<HashMap<String, Callable>>,
    handlers: RefCell<HashMap<String, HandlerRegistration>>,
    data_methods: RefCell<HashMap<String, Rc<DataMethod>>>,
    loader: RefCell<Option<Rc<dyn Loader>>>,
    cache: RefCell<HashMap<(String, Mode), Rc<CompiledUnit>>>,
}

impl EnvInner {
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name).cloned()
    }

    pub fn filter(&self, name: &str) -> Option<Callable> {
        self.filters.borrow().get(name).cloned()
    }

    pub fn test(&self, name: &str) -> Option<Callable> {
        self.tests.borrow().get(name).cloned()
    }

    pub fn extension(&self, name: &str) -> Option<Callable> {
        self.extensions.borrow().get(name).cloned()
    }

    pub fn with_script_registries<R>(
        &self,
        f: impl FnOnce(
            &HashMap<String, Rc<DataMethod>>,
            &HashMap<String, HandlerRegistration>,
        ) -> R,
    ) -> R {
        let methods = self.data_methods.borrow();
        let handlers = self.handlers.borrow();
        f(&methods, &handlers)
    }

    fn hints(&self) -> CompileHints {
        let mut hints = CompileHints::default();
        for (name, callable) in self.filters.borrow().iter() {
            if matches!(callable, Callable::Sync(_)) {
                hints.sync_filters.insert(name.clone());
            }
        }
        for (name, callable) in self.tests.borrow().iter() {
            if matches!(callable, Callable::Sync(_)) {
                hints.sync_tests.insert(name.clone());
            }
        }
        hints
    }

    pub fn compile_unit(
        &self,
        src: &str,
        mode: Mode,
        path: Option<&str>,
    ) -> core::result::Result<Rc<CompiledUnit>, crate::error::CompileError> {
        compile(src, mode, &self.syntax, &self.hints(), path)
    }

    /// Load, compile and cache a named unit.
    pub async fn get_unit(&self, name: &str, mode: Mode) -> Result<Rc<CompiledUnit>> {
        let key = (name.to_string(), mode);
        if !self.options.no_cache {
            if let Some(unit) = self.cache.borrow().get(&key) {
                return Ok(Rc::clone(unit));
            }
        }

        let loader = self
            .loader
            .borrow()
            .clone()
            .ok_or_else(|| Error::TemplateNotFound {
                name: name.to_string(),
            })?;
        let source = loader
            .get_source(name)
            .await
            .map_err(Error::Loader)?
            .ok_or_else(|| Error::TemplateNotFound {
                name: name.to_string(),
            })?;

        debug!(target: TRACE_TARGET_RENDER, name, "compiling template");
        let unit = self.compile_unit(&source.src, mode, source.path.as_deref().or(Some(name)))?;
        if !self.options.no_cache && !source.no_cache {
            self.cache.borrow_mut().insert(key, Rc::clone(&unit));
        }
        Ok(unit)
    }
}

/// The embedding entry point; see [`configure`].
#[derive(Clone)]
pub struct Environment {
    inner: Rc<EnvInner>,
}

/// Build an environment from global options, with the default filter, test
/// and global library installed.
#[must_use]
pub fn configure(options: Options) -> Environment {
    let syntax = options.syntax();
    let env = Environment {
        inner: Rc::new(EnvInner {
            options,
            syntax,
            filters: RefCell::new(HashMap::new()),
            tests: RefCell::new(HashMap::new()),
            globals: RefCell::new(HashMap::new()),
            extensions: RefCell::new(HashMap::new()),
            handlers: RefCell::new(HashMap::new()),
            data_methods: RefCell::new(HashMap::new()),
            loader: RefCell::new(None),
            cache: RefCell::new(HashMap::new()),
        }),
    };
    crate::builtins::install(&env);
    env
}

impl Environment {
    pub fn add_filter<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Args) -> core::result::Result<Value, RenderError> + 'static,
    {
        self.inner
            .filters
            .borrow_mut()
            .insert(name.into(), Callable::Sync(Rc::new(f)));
    }

    pub fn add_filter_async<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Args) -> LocalBoxFuture<'static, core::result::Result<Value, RenderError>> + 'static,
    {
        self.inner
            .filters
            .borrow_mut()
            .insert(name.into(), Callable::Async(Rc::new(f)));
    }

    pub fn add_test<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Args) -> core::result::Result<Value, RenderError> + 'static,
    {
        self.inner
            .tests
            .borrow_mut()
            .insert(name.into(), Callable::Sync(Rc::new(f)));
    }

    pub fn add_global(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .globals
            .borrow_mut()
            .insert(name.into(), value.into());
    }

    pub fn add_extension<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Args) -> LocalBoxFuture<'static, core::result::Result<Value, RenderError>> + 'static,
    {
        self.inner
            .extensions
            .borrow_mut()
            .insert(name.into(), Callable::Async(Rc::new(f)));
    }

    /// Register one shared handler instance; it sees commands from every
    /// render.
    pub fn add_command_handler(&self, name: impl Into<String>, handler: impl CommandHandler + 'static) {
        self.inner.handlers.borrow_mut().insert(
            name.into(),
            HandlerRegistration::Shared(Rc::new(RefCell::new(handler))),
        );
    }

    /// Register a handler class; each render assembles with a fresh
    /// instance.
    pub fn add_command_handler_class<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn CommandHandler> + 'static,
    {
        self.inner
            .handlers
            .borrow_mut()
            .insert(name.into(), HandlerRegistration::Factory(Rc::new(factory)));
    }

    pub fn add_data_method<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut serde_json::Value, &[Value]) -> core::result::Result<(), RenderError> + 'static,
    {
        self.inner
            .data_methods
            .borrow_mut()
            .insert(name.into(), Rc::new(f));
    }

    pub fn add_data_methods(
        &self,
        methods: impl IntoIterator<Item = (String, Rc<DataMethod>)>,
    ) {
        self.inner.data_methods.borrow_mut().extend(methods);
    }

    pub fn set_loader(&self, loader: impl Loader + 'static) {
        *self.inner.loader.borrow_mut() = Some(Rc::new(loader));
    }

    /// Compile a template from source into a reusable handle.
    ///
    /// # Errors
    /// Returns a positioned compile error for malformed source.
    pub fn compile_template(&self, src: &str) -> Result<Template> {
        let unit = self.inner.compile_unit(src, Mode::Template, None)?;
        Ok(Template::new(Rc::clone(&self.inner), unit))
    }

    /// Compile a script from source into a reusable handle.
    ///
    /// # Errors
    /// Returns a positioned compile error for malformed source.
    pub fn compile_script(&self, src: &str) -> Result<Script> {
        let unit = self.inner.compile_unit(src, Mode::Script, None)?;
        Ok(Script::new(Rc::clone(&self.inner), unit))
    }

    /// Load a named template through the configured loader.
    ///
    /// # Errors
    /// Fails when the loader has no such template or compilation fails.
    pub async fn get_template(&self, name: &str) -> Result<Template> {
        let unit = self.inner.get_unit(name, Mode::Template).await?;
        Ok(Template::new(Rc::clone(&self.inner), unit))
    }

    /// Render a template source string.
    ///
    /// # Errors
    /// Compile errors surface immediately; render failures arrive as one
    /// ordered poison bundle.
    pub async fn render_template_string(&self, src: &str, context: Context) -> Result<String> {
        let unit = self.inner.compile_unit(src, Mode::Template, None)?;
        let span = info_span!(target: TRACE_TARGET_RENDER, "template.render");
        async { run_template(Rc::clone(&self.inner), unit, Rc::new(context)).await }
            .instrument(span)
            .await
            .map_err(Error::Render)
    }

    /// Render a named template.
    ///
    /// # Errors
    /// As [`Environment::render_template_string`], plus loader failures.
    pub async fn render_template(&self, name: &str, context: Context) -> Result<String> {
        let unit = self.inner.get_unit(name, Mode::Template).await?;
        let span = info_span!(target: TRACE_TARGET_RENDER, "template.render", name);
        async { run_template(Rc::clone(&self.inner), unit, Rc::new(context)).await }
            .instrument(span)
            .await
            .map_err(Error::Render)
    }

    /// Render a script source string into its synthesized output.
    ///
    /// # Errors
    /// As [`Environment::render_template_string`].
    pub async fn render_script_string(&self, src: &str, context: Context) -> Result<ScriptOutput> {
        let unit = self.inner.compile_unit(src, Mode::Script, None)?;
        let span = info_span!(target: TRACE_TARGET_RENDER, "script.render");
        async { run_script(Rc::clone(&self.inner), unit, Rc::new(context)).await }
            .instrument(span)
            .await
            .map_err(Error::Render)
    }

    /// Render a named script.
    ///
    /// # Errors
    /// As [`Environment::render_script_string`], plus loader failures.
    pub async fn render_script(&self, name: &str, context: Context) -> Result<ScriptOutput> {
        let unit = self.inner.get_unit(name, Mode::Script).await?;
        let span = info_span!(target: TRACE_TARGET_RENDER, "script.render", name);
        async { run_script(Rc::clone(&self.inner), unit, Rc::new(context)).await }
            .instrument(span)
            .await
            .map_err(Error::Render)
    }
}
