//! The built-in `data` handler: commands mutate one synthesized JSON value
//! at the path each command names.

use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value as Json;

use crate::error::{RenderError, RenderErrorKind};
use crate::value::Value;

use super::command::{path_display, CommandRecord, PathValue};

/// Embedder-registered data method: mutates the target slot with the
/// command's arguments.
pub type DataMethod = dyn Fn(&mut Json, &[Value]) -> Result<(), RenderError>;

fn wrong_kind(cmd: &CommandRecord, expected: &str, found: &Json) -> RenderError {
    let found = match found {
        Json::Null => "missing value",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    };
    RenderError::new(
        RenderErrorKind::DataCommand,
        format!(
            "@data.{}.{}: expected {expected}, found {found}",
            path_display(&cmd.subpath),
            cmd.command
        ),
    )
    .at(cmd.pos)
}

/// Walk to the slot the path names, materializing missing objects along the
/// way. Index segments require an existing array element.
fn navigate<'a>(
    root: &'a mut Json,
    cmd: &CommandRecord,
    path: &[PathValue],
) -> Result<&'a mut Json, RenderError> {
    let mut cur = root;
    for seg in path {
        match seg {
            PathValue::Key(key) => {
                if cur.is_null() {
                    *cur = Json::Object(serde_json::Map::new());
                }
                let Json::Object(map) = cur else {
                    return Err(wrong_kind(cmd, "object", cur));
                };
                cur = map.entry(key.to_string()).or_insert(Json::Null);
            }
            PathValue::Index(idx) => {
                let Json::Array(items) = cur else {
                    return Err(wrong_kind(cmd, "array", cur));
                };
                let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                let i = if *idx < 0 { idx + len } else { *idx };
                let slot = usize::try_from(i)
                    .ok()
                    .filter(|i| *i < items.len())
                    .ok_or_else(|| {
                        RenderError::new(
                            RenderErrorKind::DataCommand,
                            format!(
                                "@data.{}.{}: index {idx} out of bounds",
                                path_display(&cmd.subpath),
                                cmd.command
                            ),
                        )
                        .at(cmd.pos)
                    })?;
                cur = &mut items[slot];
            }
        }
    }
    Ok(cur)
}

fn arg_json(cmd: &CommandRecord, index: usize) -> Result<Json, RenderError> {
    cmd.args
        .get(index)
        .map_or(Ok(Json::Null), |v| v.to_json().map_err(|e| {
            e.ensure_context(cmd.pos, Some("@data"), None);
            e
        }))
}

fn as_number(cmd: &CommandRecord, target: &Json) -> Result<f64, RenderError> {
    match target {
        Json::Null => Ok(0.0),
        Json::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        other => Err(wrong_kind(cmd, "number", other)),
    }
}

fn as_int(cmd: &CommandRecord, target: &Json) -> Result<i64, RenderError> {
    match target {
        Json::Null => Ok(0),
        Json::Number(n) if n.as_i64().is_some() => Ok(n.as_i64().unwrap_or(0)),
        other => Err(wrong_kind(cmd, "integer", other)),
    }
}

fn store_number(target: &mut Json, value: f64) {
    *target = if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Json::from(value as i64)
    } else {
        Json::from(value)
    };
}

fn is_truthy(value: &Json) -> bool {
    match value {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Json::String(s) => !s.is_empty(),
        Json::Array(a) => !a.is_empty(),
        Json::Object(o) => !o.is_empty(),
    }
}

fn merge_shallow(cmd: &CommandRecord, target: &mut Json, value: Json) -> Result<(), RenderError> {
    if target.is_null() {
        *target = Json::Object(serde_json::Map::new());
    }
    let Json::Object(dst) = target else {
        return Err(wrong_kind(cmd, "object", target));
    };
    let Json::Object(src) = value else {
        return Err(RenderError::new(
            RenderErrorKind::DataCommand,
            format!("@data.{}.merge: argument must be an object", path_display(&cmd.subpath)),
        )
        .at(cmd.pos));
    };
    dst.extend(src);
    Ok(())
}

fn merge_deep(dst: &mut Json, src: Json) {
    match (dst, src) {
        (Json::Object(dst), Json::Object(src)) => {
            for (k, v) in src {
                match dst.get_mut(&k) {
                    Some(slot) if slot.is_object() && v.is_object() => merge_deep(slot, v),
                    _ => {
                        dst.insert(k, v);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Apply one `@data` command. Custom methods registered on the environment
/// take precedence over the built-in set.
pub(crate) fn apply_data_command(
    root: &mut Json,
    cmd: &CommandRecord,
    custom: &HashMap<String, Rc<DataMethod>>,
) -> Result<(), RenderError> {
    if let Some(method) = custom.get(cmd.command.as_ref()) {
        let target = navigate(root, cmd, &cmd.subpath)?;
        return method(target, &cmd.args).map_err(|e| {
            e.ensure_context(cmd.pos, Some("@data"), None);
            e
        });
    }

    // `delete` detaches the last segment from its parent.
    if cmd.command.as_ref() == "delete" {
        let Some((last, parents)) = cmd.subpath.split_last() else {
            *root = Json::Null;
            return Ok(());
        };
        let parent = navigate(root, cmd, parents)?;
        match (parent, last) {
            (Json::Object(map), PathValue::Key(key)) => {
                map.remove(key.as_ref());
                Ok(())
            }
            (Json::Array(items), PathValue::Index(idx)) => {
                let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                let i = if *idx < 0 { idx + len } else { *idx };
                if let Ok(i) = usize::try_from(i) {
                    if i < items.len() {
                        items.remove(i);
                    }
                }
                Ok(())
            }
            (parent, _) => Err(wrong_kind(cmd, "container", parent)),
        }
    } else {
        let target = navigate(root, cmd, &cmd.subpath)?;
        apply_builtin(target, cmd)
    }
}

#[allow(clippy::too_many_lines)]
fn apply_builtin(target: &mut Json, cmd: &CommandRecord) -> Result<(), RenderError> {
    match cmd.command.as_ref() {
        "push" => {
            let value = arg_json(cmd, 0)?;
            if target.is_null() {
                *target = Json::Array(vec![value]);
                return Ok(());
            }
            let Json::Array(items) = target else {
                return Err(wrong_kind(cmd, "array", target));
            };
            items.push(value);
            Ok(())
        }
        "pop" => {
            let Json::Array(items) = target else {
                return Err(wrong_kind(cmd, "array", target));
            };
            items.pop();
            Ok(())
        }
        "shift" => {
            let Json::Array(items) = target else {
                return Err(wrong_kind(cmd, "array", target));
            };
            if !items.is_empty() {
                items.remove(0);
            }
            Ok(())
        }
        "unshift" => {
            let value = arg_json(cmd, 0)?;
            if target.is_null() {
                *target = Json::Array(vec![value]);
                return Ok(());
            }
            let Json::Array(items) = target else {
                return Err(wrong_kind(cmd, "array", target));
            };
            items.insert(0, value);
            Ok(())
        }
        "reverse" => match target {
            Json::Array(items) => {
                items.reverse();
                Ok(())
            }
            Json::String(s) => {
                *s = s.chars().rev().collect();
                Ok(())
            }
            other => Err(wrong_kind(cmd, "array or string", other)),
        },
        "merge" => {
            let value = arg_json(cmd, 0)?;
            merge_shallow(cmd, target, value)
        }
        "deepMerge" => {
            let value = arg_json(cmd, 0)?;
            if target.is_null() {
                *target = Json::Object(serde_json::Map::new());
            }
            if !target.is_object() {
                return Err(wrong_kind(cmd, "object", target));
            }
            merge_deep(target, value);
            Ok(())
        }
        "set" | "put" => {
            *target = arg_json(cmd, 0)?;
            Ok(())
        }
        "text" | "print" => {
            let value = cmd.args.first().cloned().unwrap_or(Value::Undefined);
            match target {
                Json::Null => {
                    *target = Json::String(value.render());
                    Ok(())
                }
                Json::String(s) => {
                    s.push_str(&value.render());
                    Ok(())
                }
                Json::Array(items) => {
                    items.push(value.to_json().map_err(|e| {
                        e.ensure_context(cmd.pos, Some("@data"), None);
                        e
                    })?);
                    Ok(())
                }
                other => Err(wrong_kind(cmd, "string or array", other)),
            }
        }
        "append" => {
            let value = cmd.args.first().cloned().unwrap_or(Value::Undefined);
            match target {
                Json::Null => {
                    *target = Json::String(value.render());
                    Ok(())
                }
                Json::String(s) => {
                    s.push_str(&value.render());
                    Ok(())
                }
                other => Err(wrong_kind(cmd, "string", other)),
            }
        }
        "add" | "subtract" | "multiply" | "divide" => {
            let current = as_number(cmd, target)?;
            let operand = cmd
                .args
                .first()
                .and_then(Value::as_number)
                .ok_or_else(|| {
                    RenderError::new(
                        RenderErrorKind::DataCommand,
                        format!(
                            "@data.{}.{}: argument must be a number",
                            path_display(&cmd.subpath),
                            cmd.command
                        ),
                    )
                    .at(cmd.pos)
                })?;
            let result = match cmd.command.as_ref() {
                "add" => current + operand,
                "subtract" => current - operand,
                "multiply" => current * operand,
                _ => {
                    if operand == 0.0 {
                        return Err(RenderError::new(
                            RenderErrorKind::DataCommand,
                            format!(
                                "@data.{}.divide: division by zero",
                                path_display(&cmd.subpath)
                            ),
                        )
                        .at(cmd.pos));
                    }
                    current / operand
                }
            };
            store_number(target, result);
            Ok(())
        }
        "increment" => {
            let current = as_number(cmd, target)?;
            store_number(target, current + 1.0);
            Ok(())
        }
        "decrement" => {
            let current = as_number(cmd, target)?;
            store_number(target, current - 1.0);
            Ok(())
        }
        "and" => {
            let operand = cmd.args.first().is_some_and(Value::is_true);
            *target = Json::Bool(is_truthy(target) && operand);
            Ok(())
        }
        "or" => {
            let operand = cmd.args.first().is_some_and(Value::is_true);
            *target = Json::Bool(is_truthy(target) || operand);
            Ok(())
        }
        "not" => {
            *target = Json::Bool(!is_truthy(target));
            Ok(())
        }
        "bitAnd" => {
            let current = as_int(cmd, target)?;
            let operand = int_arg(cmd)?;
            *target = Json::from(current & operand);
            Ok(())
        }
        "bitOr" => {
            let current = as_int(cmd, target)?;
            let operand = int_arg(cmd)?;
            *target = Json::from(current | operand);
            Ok(())
        }
        "bitNot" => {
            let current = as_int(cmd, target)?;
            *target = Json::from(!current);
            Ok(())
        }
        other => Err(RenderError::new(
            RenderErrorKind::DataCommand,
            format!("unknown data method {other:?}"),
        )
        .at(cmd.pos)),
    }
}

fn int_arg(cmd: &CommandRecord) -> Result<i64, RenderError> {
    match cmd.args.first() {
        Some(Value::Int(i)) => Ok(*i),
        Some(Value::Float(f)) if f.fract() == 0.0 => Ok(*f as i64),
        _ => Err(RenderError::new(
            RenderErrorKind::DataCommand,
            format!(
                "@data.{}.{}: argument must be an integer",
                path_display(&cmd.subpath),
                cmd.command
            ),
        )
        .at(cmd.pos)),
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_data_command, CommandRecord};
    use crate::error::Pos;
    use crate::script::command::PathValue;
    use crate::value::Value;
    use std::collections::HashMap;

    fn cmd(path: &[&str], command: &str, args: Vec<Value>) -> CommandRecord {
        CommandRecord {
            handler: "data".into(),
            command: command.into(),
            subpath: path.iter().map(|s| PathValue::Key((*s).into())).collect(),
            args,
            pos: Pos::new(1, 1),
        }
    }

    #[test]
    fn push_materializes_missing_arrays() {
        let mut data = serde_json::Value::Null;
        let custom = HashMap::new();
        apply_data_command(&mut data, &cmd(&["list"], "push", vec![Value::from(1)]), &custom)
            .expect("push");
        apply_data_command(&mut data, &cmd(&["list"], "push", vec![Value::from(2)]), &custom)
            .expect("push");
        assert_eq!(data, serde_json::json!({"list": [1, 2]}));
    }

    #[test]
    fn push_on_non_array_is_a_positioned_error() {
        let mut data = serde_json::json!({"list": "nope"});
        let err = apply_data_command(
            &mut data,
            &cmd(&["list"], "push", vec![Value::from(1)]),
            &HashMap::new(),
        )
        .expect_err("wrong kind");
        assert!(err.message().contains("expected array"));
        assert_eq!(err.pos(), Some(Pos::new(1, 1)));
    }

    #[test]
    fn deep_merge_recurses_into_objects() {
        let mut data = serde_json::json!({"cfg": {"a": {"x": 1}, "keep": true}});
        apply_data_command(
            &mut data,
            &cmd(
                &["cfg"],
                "deepMerge",
                vec![Value::from_json(serde_json::json!({"a": {"y": 2}}))],
            ),
            &HashMap::new(),
        )
        .expect("merge");
        assert_eq!(
            data,
            serde_json::json!({"cfg": {"a": {"x": 1, "y": 2}, "keep": true}})
        );
    }

    #[test]
    fn numeric_methods_start_from_zero() {
        let mut data = serde_json::Value::Null;
        let custom = HashMap::new();
        apply_data_command(&mut data, &cmd(&["n"], "increment", vec![]), &custom).expect("inc");
        apply_data_command(&mut data, &cmd(&["n"], "add", vec![Value::from(4)]), &custom)
            .expect("add");
        assert_eq!(data, serde_json::json!({"n": 5}));
    }

    #[test]
    fn delete_removes_the_named_slot() {
        let mut data = serde_json::json!({"a": 1, "b": 2});
        apply_data_command(&mut data, &cmd(&["a"], "delete", vec![]), &HashMap::new())
            .expect("delete");
        assert_eq!(data, serde_json::json!({"b": 2}));
    }

    #[test]
    fn custom_methods_override_builtins() {
        let mut custom: HashMap<String, std::rc::Rc<super::DataMethod>> = HashMap::new();
        custom.insert(
            "push".to_string(),
            std::rc::Rc::new(|target, _args| {
                *target = serde_json::json!("custom");
                Ok(())
            }),
        );
        let mut data = serde_json::Value::Null;
        apply_data_command(&mut data, &cmd(&["x"], "push", vec![Value::from(1)]), &custom)
            .expect("custom");
        assert_eq!(data, serde_json::json!({"x": "custom"}));
    }
}
