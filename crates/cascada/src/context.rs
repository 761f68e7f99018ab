use std::cell::RefCell;
use std::collections::HashMap;

use crate::value::{Value, ValueMap};

/// Render-time variables supplied by the embedder, plus the exports a
/// template publishes through top-level `set`.
#[derive(Default)]
pub struct Context {
    vars: RefCell<HashMap<String, Value>>,
    exports: RefCell<ValueMap>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            vars: RefCell::new(pairs.into_iter().collect()),
            exports: RefCell::new(ValueMap::new()),
        }
    }

    /// Build from a JSON object; non-objects become an empty context.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match Value::from_json(value) {
            Value::Map(map) => Self::from_pairs(map.iter().map(|(k, v)| (k.clone(), v.clone()))),
            _ => Self::new(),
        }
    }

    pub fn insert(&self, name: impl Into<String>, value: Value) {
        self.vars.borrow_mut().insert(name.into(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars.borrow().get(name).cloned()
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.vars.borrow().contains_key(name)
    }

    /// Child context for an include or parent-template render: it sees the
    /// same variables but keeps its own exports, so mutations do not leak
    /// back except through explicit export.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            vars: RefCell::new(self.vars.borrow().clone()),
            exports: RefCell::new(ValueMap::new()),
        }
    }

    pub(crate) fn export(&self, name: &str, value: Value) {
        self.vars.borrow_mut().insert(name.to_string(), value.clone());
        self.exports.borrow_mut().insert(name.to_string(), value);
    }

    #[must_use]
    pub fn exports(&self) -> ValueMap {
        self.exports.borrow().clone()
    }
}

/// Build a [`Context`] from `name: expr` pairs; values go through
/// [`Value::from`].
#[macro_export]
macro_rules! context {
    () => { $crate::Context::new() };
    ($($name:ident : $value:expr),+ $(,)?) => {{
        let ctx = $crate::Context::new();
        $(ctx.insert(stringify!($name), $crate::Value::from($value));)+
        ctx
    }};
}

#[cfg(test)]
mod tests {
    use crate::value::Value;

    #[test]
    fn fork_does_not_leak_mutations_back() {
        let parent = crate::context! { a: 1 };
        let child = parent.fork();
        child.insert("a", Value::from(2));
        child.insert("b", Value::from(3));
        assert_eq!(parent.get("a"), Some(Value::from(1)));
        assert_eq!(parent.get("b"), None);
    }

    #[test]
    fn export_mirrors_into_vars_and_exports() {
        let ctx = crate::Context::new();
        ctx.export("x", Value::from("v"));
        assert_eq!(ctx.get("x"), Some(Value::from("v")));
        assert_eq!(ctx.exports().get("x"), Some(&Value::from("v")));
    }
}
