//! Name and member resolution.

use crate::context::Context;
use crate::error::{RenderError, RenderErrorKind};
use crate::value::Value;

use super::frame::{Binding, Frame};

/// Frame chain first (closest wins), then context variables, then
/// environment globals.
pub(crate) fn context_or_frame_lookup(
    frame: &Frame,
    context: &Context,
    global: impl FnOnce(&str) -> Option<Value>,
    name: &str,
) -> Option<Binding> {
    if let Some(binding) = frame.lookup_binding(name) {
        return Some(binding);
    }
    if let Some(value) = context.get(name) {
        return Some(Binding::Ready(value));
    }
    global(name).map(Binding::Ready)
}

pub(crate) fn missing_name_error(name: &str) -> RenderError {
    RenderError::new(
        RenderErrorKind::Lookup,
        format!("'{name}' is not defined"),
    )
}

/// Member access. Undefined and none targets are safe; callable properties
/// come back bound to their owner.
pub(crate) fn member_lookup(obj: &Value, key: &Value) -> Value {
    match obj {
        Value::Undefined | Value::None => Value::Undefined,
        Value::Map(map) => {
            let Some(name) = key.as_str() else {
                return Value::Undefined;
            };
            match map.get(name) {
                Some(Value::Func(f)) => Value::Func(f.bind(obj.clone())),
                Some(v) => v.clone(),
                None => Value::Undefined,
            }
        }
        Value::Array(items) => index_of(key, items.len())
            .and_then(|i| items.get(i).cloned())
            .unwrap_or(Value::Undefined),
        Value::Str(s) | Value::Safe(s) => {
            let chars: Vec<char> = s.chars().collect();
            index_of(key, chars.len())
                .and_then(|i| chars.get(i).copied())
                .map_or(Value::Undefined, |c| Value::from(c.to_string()))
        }
        _ => Value::Undefined,
    }
}

fn index_of(key: &Value, len: usize) -> Option<usize> {
    let idx = match key {
        Value::Int(i) => *i,
        Value::Float(f) if f.fract() == 0.0 => *f as i64,
        _ => return None,
    };
    let len = i64::try_from(len).ok()?;
    let idx = if idx < 0 { idx + len } else { idx };
    (0..len).contains(&idx).then(|| idx as usize)
}

#[cfg(test)]
mod tests {
    use super::{context_or_frame_lookup, member_lookup};
    use crate::context::Context;
    use crate::runtime::frame::{Binding, Frame};
    use crate::value::Value;

    #[test]
    fn frame_shadows_context_shadows_globals() {
        let frame = Frame::root();
        let ctx = Context::new();
        ctx.insert("x", Value::from("ctx"));
        let found = context_or_frame_lookup(&frame, &ctx, |_| Some(Value::from("global")), "x");
        assert!(matches!(found, Some(Binding::Ready(v)) if v == Value::from("ctx")));

        frame.declare_value("x", Value::from("frame"));
        let found = context_or_frame_lookup(&frame, &ctx, |_| None, "x");
        assert!(matches!(found, Some(Binding::Ready(v)) if v == Value::from("frame")));
    }

    #[test]
    fn undefined_targets_are_safe() {
        assert_eq!(
            member_lookup(&Value::Undefined, &Value::from("k")),
            Value::Undefined
        );
        assert_eq!(
            member_lookup(&Value::None, &Value::from(0)),
            Value::Undefined
        );
    }

    #[test]
    fn negative_indices_count_from_the_end() {
        let arr = Value::array([Value::from(1), Value::from(2), Value::from(3)]);
        assert_eq!(member_lookup(&arr, &Value::from(-1)), Value::from(3));
        assert_eq!(member_lookup(&arr, &Value::from(3)), Value::Undefined);
    }
}
