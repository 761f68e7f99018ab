//! Default filters, tests and globals. User registrations under the same
//! name shadow these.

use std::rc::Rc;

use crate::environment::Environment;
use crate::error::{RenderError, RenderErrorKind};
use crate::output::escape_html;
use crate::value::{Args, Value};

fn err(message: impl Into<String>) -> RenderError {
    RenderError::new(RenderErrorKind::Runtime, message)
}

fn need_len(v: &Value) -> Result<usize, RenderError> {
    v.len()
        .ok_or_else(|| err(format!("{} has no length", v.type_name())))
}

#[allow(clippy::too_many_lines)]
pub(crate) fn install(env: &Environment) {
    // Filters.
    env.add_filter("upper", |a: Args| Ok(Value::from(a.get(0).render().to_uppercase())));
    env.add_filter("lower", |a: Args| Ok(Value::from(a.get(0).render().to_lowercase())));
    env.add_filter("capitalize", |a: Args| {
        let s = a.get(0).render();
        let mut chars = s.chars();
        Ok(Value::from(chars.next().map_or_else(String::new, |c| {
            c.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
        })))
    });
    env.add_filter("title", |a: Args| {
        let s = a.get(0).render();
        let titled: Vec<String> = s
            .split(' ')
            .map(|w| {
                let mut chars = w.chars();
                chars.next().map_or_else(String::new, |c| {
                    c.to_uppercase().collect::<String>() + chars.as_str()
                })
            })
            .collect();
        Ok(Value::from(titled.join(" ")))
    });
    env.add_filter("trim", |a: Args| Ok(Value::from(a.get(0).render().trim().to_string())));
    env.add_filter("length", |a: Args| Ok(Value::from(need_len(&a.get(0))?)));
    env.add_filter("count", |a: Args| Ok(Value::from(need_len(&a.get(0))?)));
    env.add_filter("first", |a: Args| {
        Ok(match a.get(0) {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Undefined),
            v => v
                .as_str()
                .and_then(|s| s.chars().next())
                .map_or(Value::Undefined, |c| Value::from(c.to_string())),
        })
    });
    env.add_filter("last", |a: Args| {
        Ok(match a.get(0) {
            Value::Array(items) => items.last().cloned().unwrap_or(Value::Undefined),
            v => v
                .as_str()
                .and_then(|s| s.chars().last())
                .map_or(Value::Undefined, |c| Value::from(c.to_string())),
        })
    });
    env.add_filter("join", |a: Args| {
        let Value::Array(items) = a.get(0) else {
            return Err(err("join expects an array"));
        };
        let sep = match a.get(1) {
            Value::Undefined => String::new(),
            v => v.render(),
        };
        let parts: Vec<String> = items.iter().map(Value::render).collect();
        Ok(Value::from(parts.join(&sep)))
    });
    let default_filter = |a: Args| {
        let value = a.get(0);
        let fallback = a
            .kwarg("fallback")
            .unwrap_or_else(|| a.get(1));
        let falsy_counts = a.get(2).is_true();
        let missing = if falsy_counts {
            !value.is_true()
        } else {
            value.is_undefined()
        };
        Ok(if missing { fallback } else { value })
    };
    env.add_filter("default", default_filter);
    env.add_filter("d", default_filter);
    env.add_filter("abs", |a: Args| match a.get(0) {
        Value::Int(i) => Ok(Value::Int(i.abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        v => Err(err(format!("abs expects a number, got {}", v.type_name()))),
    });
    env.add_filter("round", |a: Args| {
        let v = a
            .get(0)
            .as_number()
            .ok_or_else(|| err("round expects a number"))?;
        let digits = match a.get(1) {
            Value::Undefined => 0,
            Value::Int(i) => i,
            other => return Err(err(format!("round digits must be an integer, got {}", other.type_name()))),
        };
        let factor = 10f64.powi(i32::try_from(digits).unwrap_or(0));
        Ok(Value::Float((v * factor).round() / factor))
    });
    env.add_filter("int", |a: Args| {
        let v = a.get(0);
        match &v {
            Value::Int(_) => Ok(v),
            Value::Float(f) => Ok(Value::Int(*f as i64)),
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::Str(s) | Value::Safe(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| err(format!("cannot convert {s:?} to an integer"))),
            other => Err(err(format!("cannot convert {} to an integer", other.type_name()))),
        }
    });
    env.add_filter("float", |a: Args| {
        let v = a.get(0);
        match &v {
            Value::Float(_) => Ok(v),
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::Str(s) | Value::Safe(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| err(format!("cannot convert {s:?} to a float"))),
            other => Err(err(format!("cannot convert {} to a float", other.type_name()))),
        }
    });
    env.add_filter("string", |a: Args| Ok(Value::from(a.get(0).render())));
    env.add_filter("safe", |a: Args| Ok(Value::safe(a.get(0).render())));
    let escape_filter = |a: Args| {
        Ok(match a.get(0) {
            // Already safe: escaping is a no-op.
            Value::Safe(s) => Value::Safe(s),
            v => Value::safe(escape_html(&v.render()).into_owned()),
        })
    };
    env.add_filter("escape", escape_filter);
    env.add_filter("e", escape_filter);
    env.add_filter("reverse", |a: Args| {
        Ok(match a.get(0) {
            Value::Array(items) => {
                let mut items = items.as_ref().clone();
                items.reverse();
                Value::Array(Rc::new(items))
            }
            v => Value::from(v.render().chars().rev().collect::<String>()),
        })
    });
    env.add_filter("sort", |a: Args| {
        let Value::Array(items) = a.get(0) else {
            return Err(err("sort expects an array"));
        };
        let mut items = items.as_ref().clone();
        items.sort_by(|x, y| x.try_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
        if a.kwarg("reverse").is_some_and(|v| v.is_true()) {
            items.reverse();
        }
        Ok(Value::Array(Rc::new(items)))
    });
    env.add_filter("sum", |a: Args| {
        let Value::Array(items) = a.get(0) else {
            return Err(err("sum expects an array"));
        };
        let mut total = 0.0;
        let mut integral = true;
        for item in items.iter() {
            let n = item
                .as_number()
                .ok_or_else(|| err(format!("cannot sum {}", item.type_name())))?;
            integral &= matches!(item, Value::Int(_) | Value::Bool(_));
            total += n;
        }
        Ok(if integral {
            Value::Int(total as i64)
        } else {
            Value::Float(total)
        })
    });

    // Tests.
    env.add_test("defined", |a: Args| Ok(Value::Bool(!a.get(0).is_undefined())));
    env.add_test("undefined", |a: Args| Ok(Value::Bool(a.get(0).is_undefined())));
    env.add_test("none", |a: Args| Ok(Value::Bool(a.get(0).is_none())));
    env.add_test("null", |a: Args| Ok(Value::Bool(a.get(0).is_none())));
    env.add_test("true", |a: Args| Ok(Value::Bool(matches!(a.get(0), Value::Bool(true)))));
    env.add_test("false", |a: Args| Ok(Value::Bool(matches!(a.get(0), Value::Bool(false)))));
    env.add_test("odd", |a: Args| match a.get(0) {
        Value::Int(i) => Ok(Value::Bool(i.rem_euclid(2) == 1)),
        v => Err(err(format!("odd expects an integer, got {}", v.type_name()))),
    });
    env.add_test("even", |a: Args| match a.get(0) {
        Value::Int(i) => Ok(Value::Bool(i.rem_euclid(2) == 0)),
        v => Err(err(format!("even expects an integer, got {}", v.type_name()))),
    });
    env.add_test("divisibleby", |a: Args| {
        let (Value::Int(v), Value::Int(by)) = (a.get(0), a.get(1)) else {
            return Err(err("divisibleby expects integers"));
        };
        if by == 0 {
            return Err(err("divisibleby zero"));
        }
        Ok(Value::Bool(v % by == 0))
    });
    env.add_test("string", |a: Args| Ok(Value::Bool(a.get(0).as_str().is_some())));
    env.add_test("number", |a: Args| {
        Ok(Value::Bool(matches!(a.get(0), Value::Int(_) | Value::Float(_))))
    });
    env.add_test("mapping", |a: Args| Ok(Value::Bool(matches!(a.get(0), Value::Map(_)))));
    env.add_test("iterable", |a: Args| {
        Ok(Value::Bool(matches!(
            a.get(0),
            Value::Array(_) | Value::Map(_) | Value::Str(_) | Value::Safe(_) | Value::Stream(_)
        )))
    });
    env.add_test("callable", |a: Args| {
        Ok(Value::Bool(matches!(a.get(0), Value::Func(_) | Value::Macro(_))))
    });
    env.add_test("sameas", |a: Args| Ok(Value::Bool(a.get(0) == a.get(1))));

    // Globals.
    env.add_global(
        "range",
        Value::Func(crate::value::Func::from_sync("range", |a: Args| {
            let (start, stop, step) = match (a.get(0), a.get(1), a.get(2)) {
                (Value::Int(stop), Value::Undefined, _) => (0, stop, 1),
                (Value::Int(start), Value::Int(stop), Value::Undefined) => (start, stop, 1),
                (Value::Int(start), Value::Int(stop), Value::Int(step)) => (start, stop, step),
                _ => return Err(err("range expects integer arguments")),
            };
            if step == 0 {
                return Err(err("range step must not be zero"));
            }
            let mut items = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                items.push(Value::Int(i));
                i += step;
            }
            Ok(Value::array(items))
        })),
    );
}
