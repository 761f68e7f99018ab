//! Callable invocation support: macro bundles and argument marshaling.

use std::fmt;
use std::rc::Rc;

use crate::ast::{Body, Param};
use crate::error::{RenderError, RenderErrorKind};
use crate::value::{Args, Value, ValueMap};

use super::frame::Frame;

/// A macro closed over its defining frame. Calling one re-renders its body
/// with the marshaled arguments bound in a fresh scope. The defining unit
/// rides along so the body's annotations resolve after an import.
pub struct MacroValue {
    name: Rc<str>,
    pub(crate) params: Rc<Vec<Param>>,
    pub(crate) body: Rc<Body>,
    pub(crate) closure: Rc<Frame>,
    pub(crate) unit: Rc<crate::exec::CompiledUnit>,
}

impl MacroValue {
    pub(crate) fn new(
        name: impl Into<Rc<str>>,
        params: Rc<Vec<Param>>,
        body: Rc<Body>,
        closure: Rc<Frame>,
        unit: Rc<crate::exec::CompiledUnit>,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            body,
            closure,
            unit,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for MacroValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacroValue")
            .field("name", &self.name)
            .field("params", &self.params.len())
            .finish()
    }
}

/// Marshaled macro arguments: declared parameters in declaration order,
/// overflow positionals, and unmatched keyword arguments.
#[derive(Debug)]
pub(crate) struct BoundArgs {
    /// `(param name, value)`; `None` means the declared default applies.
    pub bindings: Vec<(Rc<str>, Option<Value>)>,
    pub varargs: Vec<Value>,
    pub extra_kwargs: ValueMap,
}

/// Reshuffle mixed positional and keyword arguments into declaration order.
/// Positionals past the declared parameters spill into `varargs`; unknown
/// keywords into `extra_kwargs`.
pub(crate) fn bind_macro_args(
    macro_name: &str,
    params: &[Param],
    args: Args,
) -> Result<BoundArgs, RenderError> {
    let Args {
        mut positional,
        mut kwargs,
    } = args;

    let mut bindings: Vec<(Rc<str>, Option<Value>)> = Vec::with_capacity(params.len());
    let mut positionals = positional.drain(..);

    for param in params {
        let name: Rc<str> = param.name.as_str().into();
        let positional_value = positionals.next();
        let keyword_value = kwargs.shift_remove(param.name.as_str());
        let value = match (positional_value, keyword_value) {
            (Some(_), Some(_)) => {
                return Err(RenderError::new(
                    RenderErrorKind::Runtime,
                    format!(
                        "macro {macro_name:?} got multiple values for argument {:?}",
                        param.name
                    ),
                ));
            }
            (Some(v), None) | (None, Some(v)) => Some(v),
            (None, None) => None,
        };
        bindings.push((name, value));
    }

    Ok(BoundArgs {
        bindings,
        varargs: positionals.collect(),
        extra_kwargs: kwargs,
    })
}

pub(crate) fn not_callable_error(name: &str, value: &Value) -> RenderError {
    RenderError::new(
        RenderErrorKind::Runtime,
        format!("unable to call {name:?}: {} is not callable", value.type_name()),
    )
}

#[cfg(test)]
mod tests {
    use super::bind_macro_args;
    use crate::ast::Param;
    use crate::value::{Args, Value, ValueMap};

    fn params(names: &[&str]) -> Vec<Param> {
        names
            .iter()
            .map(|n| Param {
                name: (*n).to_string(),
                default: None,
            })
            .collect()
    }

    #[test]
    fn positionals_fill_in_declaration_order() {
        let bound = bind_macro_args(
            "m",
            &params(&["a", "b"]),
            Args::positional([Value::from(1), Value::from(2)]),
        )
        .expect("bind");
        assert_eq!(bound.bindings[0].1, Some(Value::from(1)));
        assert_eq!(bound.bindings[1].1, Some(Value::from(2)));
        assert!(bound.varargs.is_empty());
    }

    #[test]
    fn overflow_positionals_become_varargs() {
        let bound = bind_macro_args(
            "m",
            &params(&["a"]),
            Args::positional([Value::from(1), Value::from(2), Value::from(3)]),
        )
        .expect("bind");
        assert_eq!(bound.varargs, vec![Value::from(2), Value::from(3)]);
    }

    #[test]
    fn keywords_reshuffle_and_collect_extras() {
        let mut kwargs = ValueMap::new();
        kwargs.insert("b".to_string(), Value::from(2));
        kwargs.insert("z".to_string(), Value::from(9));
        let bound = bind_macro_args(
            "m",
            &params(&["a", "b"]),
            Args {
                positional: [Value::from(1)].into_iter().collect(),
                kwargs,
            },
        )
        .expect("bind");
        assert_eq!(bound.bindings[1].1, Some(Value::from(2)));
        assert_eq!(bound.extra_kwargs.get("z"), Some(&Value::from(9)));
    }

    #[test]
    fn double_assignment_is_an_error() {
        let mut kwargs = ValueMap::new();
        kwargs.insert("a".to_string(), Value::from(2));
        let err = bind_macro_args(
            "m",
            &params(&["a"]),
            Args {
                positional: [Value::from(1)].into_iter().collect(),
                kwargs,
            },
        )
        .expect_err("conflict");
        assert!(err.message().contains("multiple values"));
    }
}
