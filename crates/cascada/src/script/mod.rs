//! Script-mode output: command records, the `data` handler, and the
//! assembled result.

pub(crate) mod command;
pub(crate) mod data;

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

pub use command::{CommandRecord, PathValue};
pub use data::DataMethod;

use crate::error::{Pos, RenderError};
use crate::value::Value;

/// Embedder-supplied command handler. One instance receives every buffered
/// command addressed to its name, in source order, during assembly.
pub trait CommandHandler {
    /// # Errors
    /// Returns a positioned error when the command cannot be applied.
    fn on_command(
        &mut self,
        command: &str,
        subpath: &[PathValue],
        args: &[Value],
        pos: Pos,
    ) -> Result<(), RenderError>;

    /// Value this handler contributes to the script result.
    fn output(&self) -> Value {
        Value::Undefined
    }
}

/// How a handler is provided: a fresh instance per render, or one shared
/// instance across renders.
#[derive(Clone)]
pub(crate) enum HandlerRegistration {
    Factory(Rc<dyn Fn() -> Box<dyn CommandHandler>>),
    Shared(Rc<RefCell<dyn CommandHandler>>),
}

/// Assembled result of a script render.
#[derive(Debug)]
pub struct ScriptOutput {
    /// The synthesized `data` object.
    pub data: serde_json::Value,
    /// Free text emitted by `print`.
    pub text: String,
    /// Per-handler outputs, in first-use order.
    pub handlers: IndexMap<String, Value>,
    pub(crate) focus: Option<String>,
}

impl ScriptOutput {
    /// The script result with the declared `:focus` (or the full bundle when
    /// none was declared). A dotted focus drills into the data object.
    #[must_use]
    pub fn result(&self) -> Value {
        let Some(focus) = &self.focus else {
            let mut map = crate::value::ValueMap::new();
            map.insert("data".to_string(), Value::from_json(self.data.clone()));
            map.insert("text".to_string(), Value::from(self.text.clone()));
            for (name, value) in &self.handlers {
                map.insert(name.clone(), value.clone());
            }
            return Value::Map(Rc::new(map));
        };

        let mut parts = focus.split('.');
        let head = parts.next().unwrap_or_default();
        let mut value = match head {
            "data" => Value::from_json(self.data.clone()),
            "text" => Value::from(self.text.clone()),
            name => self.handlers.get(name).cloned().unwrap_or(Value::Undefined),
        };
        for key in parts {
            value = crate::runtime::lookup::member_lookup(&value, &Value::from(key));
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::ScriptOutput;
    use crate::value::Value;

    #[test]
    fn focus_selects_a_subtree() {
        let out = ScriptOutput {
            data: serde_json::json!({"a": {"b": 7}}),
            text: String::new(),
            handlers: indexmap::IndexMap::new(),
            focus: Some("data.a.b".to_string()),
        };
        assert_eq!(out.result(), Value::from(7));
    }

    #[test]
    fn without_focus_everything_is_bundled() {
        let out = ScriptOutput {
            data: serde_json::json!(1),
            text: "t".to_string(),
            handlers: indexmap::IndexMap::new(),
            focus: None,
        };
        let Value::Map(map) = out.result() else {
            panic!("expected map");
        };
        assert_eq!(map.get("text"), Some(&Value::from("t")));
    }
}
