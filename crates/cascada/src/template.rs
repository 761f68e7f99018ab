//! Reusable compiled handles.

use std::rc::Rc;

use tracing::{info_span, Instrument};

use crate::context::Context;
use crate::environment::EnvInner;
use crate::error::{Error, Result};
use crate::exec::{run_script, run_template, CompiledUnit};
use crate::script::ScriptOutput;
use crate::TRACE_TARGET_RENDER;

/// A compiled template bound to its environment. Rendering is reentrant: a
/// handle can be rendered many times, each render fully isolated.
pub struct Template {
    env: Rc<EnvInner>,
    unit: Rc<CompiledUnit>,
}

impl Template {
    pub(crate) fn new(env: Rc<EnvInner>, unit: Rc<CompiledUnit>) -> Self {
        Self { env, unit }
    }

    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.unit.path.as_deref()
    }

    /// # Errors
    /// Render failures arrive as one ordered poison bundle.
    pub async fn render(&self, context: Context) -> Result<String> {
        let span = info_span!(target: TRACE_TARGET_RENDER, "template.render");
        async {
            run_template(
                Rc::clone(&self.env),
                Rc::clone(&self.unit),
                Rc::new(context),
            )
            .await
        }
        .instrument(span)
        .await
        .map_err(Error::Render)
    }
}

/// A compiled script bound to its environment.
pub struct Script {
    env: Rc<EnvInner>,
    unit: Rc<CompiledUnit>,
}

impl Script {
    pub(crate) fn new(env: Rc<EnvInner>, unit: Rc<CompiledUnit>) -> Self {
        Self { env, unit }
    }

    /// # Errors
    /// Render failures arrive as one ordered poison bundle.
    pub async fn render(&self, context: Context) -> Result<ScriptOutput> {
        let span = info_span!(target: TRACE_TARGET_RENDER, "script.render");
        async {
            run_script(
                Rc::clone(&self.env),
                Rc::clone(&self.unit),
                Rc::new(context),
            )
            .await
        }
        .instrument(span)
        .await
        .map_err(Error::Render)
    }
}
