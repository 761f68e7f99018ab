//! Operator semantics over runtime values.

use std::rc::Rc;

use crate::ast::{BinOp, CmpOp};
use crate::error::{RenderError, RenderErrorKind};
use crate::value::Value;

fn type_error(op: &str, a: &Value, b: &Value) -> RenderError {
    RenderError::new(
        RenderErrorKind::Runtime,
        format!("unsupported operands for {op}: {} and {}", a.type_name(), b.type_name()),
    )
}

fn float_int(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Value::Int(value as i64)
    } else {
        Value::Float(value)
    }
}

pub(crate) fn binop(op: BinOp, a: &Value, b: &Value) -> Result<Value, RenderError> {
    match op {
        BinOp::Add => add(a, b),
        BinOp::Sub => numeric("-", a, b, |x, y| x - y),
        BinOp::Mul => numeric("*", a, b, |x, y| x * y),
        BinOp::Div => {
            let (x, y) = pair("/", a, b)?;
            if y == 0.0 {
                return Err(RenderError::new(RenderErrorKind::Runtime, "division by zero"));
            }
            Ok(Value::Float(x / y))
        }
        BinOp::FloorDiv => {
            let (x, y) = pair("//", a, b)?;
            if y == 0.0 {
                return Err(RenderError::new(RenderErrorKind::Runtime, "division by zero"));
            }
            Ok(float_int((x / y).floor()))
        }
        BinOp::Mod => {
            let (x, y) = pair("%", a, b)?;
            if y == 0.0 {
                return Err(RenderError::new(RenderErrorKind::Runtime, "division by zero"));
            }
            Ok(float_int(x % y))
        }
        BinOp::Pow => {
            let (x, y) = pair("**", a, b)?;
            Ok(float_int(x.powf(y)))
        }
        BinOp::Concat => {
            let combined = format!("{}{}", a.render(), b.render());
            // Concatenation of two safe strings stays safe.
            if matches!(a, Value::Safe(_)) && matches!(b, Value::Safe(_)) {
                Ok(Value::Safe(combined.into()))
            } else {
                Ok(Value::Str(combined.into()))
            }
        }
    }
}

fn add(a: &Value, b: &Value) -> Result<Value, RenderError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x
            .checked_add(*y)
            .map_or_else(|| Value::Float(*x as f64 + *y as f64), Value::Int)),
        (Value::Str(x) | Value::Safe(x), Value::Str(y) | Value::Safe(y)) => {
            Ok(Value::Str(format!("{x}{y}").into()))
        }
        (Value::Array(x), Value::Array(y)) => {
            let mut items = x.as_ref().clone();
            items.extend(y.iter().cloned());
            Ok(Value::Array(Rc::new(items)))
        }
        _ => numeric("+", a, b, |x, y| x + y),
    }
}

fn pair(op: &str, a: &Value, b: &Value) -> Result<(f64, f64), RenderError> {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(type_error(op, a, b)),
    }
}

fn numeric(op: &str, a: &Value, b: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, RenderError> {
    let (x, y) = pair(op, a, b)?;
    match (a, b) {
        (Value::Int(_), Value::Int(_)) => Ok(float_int(f(x, y))),
        _ => Ok(Value::Float(f(x, y))),
    }
}

pub(crate) fn negate(v: &Value) -> Result<Value, RenderError> {
    match v {
        Value::Int(i) => Ok(Value::Int(-i)),
        Value::Float(f) => Ok(Value::Float(-f)),
        other => Err(RenderError::new(
            RenderErrorKind::Runtime,
            format!("cannot negate {}", other.type_name()),
        )),
    }
}

pub(crate) fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool, RenderError> {
    match op {
        CmpOp::Eq => Ok(a == b),
        CmpOp::Ne => Ok(a != b),
        _ => {
            let ord = a.try_cmp(b).ok_or_else(|| {
                RenderError::new(
                    RenderErrorKind::Runtime,
                    format!("cannot compare {} and {}", a.type_name(), b.type_name()),
                )
            })?;
            Ok(match op {
                CmpOp::Lt => ord.is_lt(),
                CmpOp::Le => ord.is_le(),
                CmpOp::Gt => ord.is_gt(),
                CmpOp::Ge => ord.is_ge(),
                CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
            })
        }
    }
}

pub(crate) fn contains(needle: &Value, haystack: &Value) -> Result<bool, RenderError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|v| v == needle)),
        Value::Map(map) => Ok(needle.as_str().is_some_and(|k| map.contains_key(k))),
        Value::Str(s) | Value::Safe(s) => {
            let sub = needle.as_str().ok_or_else(|| {
                RenderError::new(
                    RenderErrorKind::Runtime,
                    format!("cannot search for {} in a string", needle.type_name()),
                )
            })?;
            Ok(s.contains(sub))
        }
        other => Err(RenderError::new(
            RenderErrorKind::Runtime,
            format!("{} is not a container", other.type_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::{binop, compare, contains};
    use crate::ast::{BinOp, CmpOp};
    use crate::value::Value;

    #[test]
    fn integer_math_stays_integral() {
        assert_eq!(
            binop(BinOp::Add, &Value::Int(2), &Value::Int(3)).expect("add"),
            Value::Int(5)
        );
        assert_eq!(
            binop(BinOp::FloorDiv, &Value::Int(7), &Value::Int(2)).expect("floordiv"),
            Value::Int(3)
        );
        assert_eq!(
            binop(BinOp::Div, &Value::Int(7), &Value::Int(2)).expect("div"),
            Value::Float(3.5)
        );
    }

    #[test]
    fn concat_stringifies_both_sides() {
        assert_eq!(
            binop(BinOp::Concat, &Value::from("a"), &Value::Int(1)).expect("concat"),
            Value::from("a1")
        );
    }

    #[test]
    fn comparisons_cross_numeric_types() {
        assert!(compare(CmpOp::Lt, &Value::Int(1), &Value::Float(1.5)).expect("lt"));
        assert!(compare(CmpOp::Eq, &Value::Int(2), &Value::Float(2.0)).expect("eq"));
        assert!(compare(CmpOp::Lt, &Value::from("a"), &Value::Int(1)).is_err());
    }

    #[test]
    fn membership_covers_all_containers() {
        let arr = Value::array([Value::Int(1), Value::Int(2)]);
        assert!(contains(&Value::Int(2), &arr).expect("array"));
        assert!(contains(&Value::from("el"), &Value::from("hello")).expect("substr"));
        let map = Value::map([("k".to_string(), Value::Int(1))]);
        assert!(contains(&Value::from("k"), &map).expect("key"));
    }
}
