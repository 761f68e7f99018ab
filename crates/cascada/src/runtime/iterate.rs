//! The loop driver: normalizes iterables, binds loop variables, and runs
//! bodies sequentially or as a bounded-concurrency window.

use futures::future::LocalBoxFuture;
use futures::stream::{FuturesUnordered, LocalBoxStream, StreamExt};
use smallvec::SmallVec;

use crate::error::{PoisonError, RenderError, RenderErrorKind};
use crate::value::{IterError, Value, ValueStream};

/// Values bound per iteration, before destructuring into loop targets.
pub(crate) type LoopItem = SmallVec<[Value; 2]>;

pub(crate) enum Iterable {
    Empty,
    Items(Vec<LoopItem>),
    Stream(LocalBoxStream<'static, crate::value::IterResult>),
}

/// Normalize a value into something the driver can walk. `n_targets` steers
/// map-entry and array destructuring.
pub(crate) fn normalize(value: Value, n_targets: usize) -> Result<Iterable, RenderError> {
    match value {
        Value::Undefined | Value::None => Ok(Iterable::Empty),
        Value::Array(items) => Ok(wrap_items(
            items.iter().map(|v| destructure(v.clone(), n_targets)),
        )),
        Value::Map(entries) => Ok(wrap_items(entries.iter().map(|(k, v)| {
            let mut item = LoopItem::new();
            item.push(Value::from(k.clone()));
            if n_targets > 1 {
                item.push(v.clone());
            }
            item
        }))),
        Value::Str(s) | Value::Safe(s) => Ok(wrap_items(s.chars().map(|c| {
            let mut item = LoopItem::new();
            item.push(Value::from(c.to_string()));
            item
        }))),
        Value::Stream(stream) => stream.take().map(Iterable::Stream).ok_or_else(|| {
            RenderError::new(
                RenderErrorKind::Runtime,
                "async iterator was already consumed",
            )
        }),
        other => Err(RenderError::new(
            RenderErrorKind::Runtime,
            format!("{} is not iterable", other.type_name()),
        )),
    }
}

fn wrap_items(items: impl Iterator<Item = LoopItem>) -> Iterable {
    let items: Vec<_> = items.collect();
    if items.is_empty() {
        Iterable::Empty
    } else {
        Iterable::Items(items)
    }
}

/// Split one yielded value across loop targets; missing positions become
/// undefined.
pub(crate) fn destructure(value: Value, n_targets: usize) -> LoopItem {
    let mut item = LoopItem::new();
    if n_targets <= 1 {
        item.push(value);
        return item;
    }
    match value {
        Value::Array(values) => {
            for i in 0..n_targets {
                item.push(values.get(i).cloned().unwrap_or(Value::Undefined));
            }
        }
        other => {
            item.push(other);
            for _ in 1..n_targets {
                item.push(Value::Undefined);
            }
        }
    }
    item
}

/// `None` means no limit. Zero, none and undefined also mean no limit;
/// anything else that is not a finite non-negative integer is an error.
pub(crate) fn validate_limit(limit: Option<Value>) -> Result<Option<usize>, RenderError> {
    let Some(limit) = limit else {
        return Ok(None);
    };
    let error = || {
        RenderError::new(
            RenderErrorKind::Runtime,
            format!(
                "concurrency limit must be a finite non-negative number, got {}",
                limit.render()
            ),
        )
    };
    let n = match &limit {
        Value::Undefined | Value::None => return Ok(None),
        Value::Int(i) if *i >= 0 => *i,
        Value::Float(f) if f.is_finite() && *f >= 0.0 && f.fract() == 0.0 => *f as i64,
        _ => return Err(error()),
    };
    if n == 0 {
        Ok(None)
    } else {
        Ok(Some(usize::try_from(n).map_err(|_| error())?))
    }
}

/// The `loop` variable for one iteration.
#[must_use]
pub(crate) fn loop_object(index0: usize, length: Option<usize>) -> Value {
    let idx = i64::try_from(index0).unwrap_or(i64::MAX);
    let mut map = crate::value::ValueMap::new();
    map.insert("index".to_string(), Value::Int(idx + 1));
    map.insert("index0".to_string(), Value::Int(idx));
    map.insert("first".to_string(), Value::Bool(index0 == 0));
    match length {
        Some(len) => {
            let len_i = i64::try_from(len).unwrap_or(i64::MAX);
            map.insert("length".to_string(), Value::Int(len_i));
            map.insert("revindex".to_string(), Value::Int(len_i - idx));
            map.insert("revindex0".to_string(), Value::Int(len_i - idx - 1));
            map.insert("last".to_string(), Value::Bool(index0 + 1 == len));
        }
        None => {
            // Unknown-length sources expose these only after completion.
            map.insert("length".to_string(), Value::Undefined);
            map.insert("revindex".to_string(), Value::Undefined);
            map.insert("revindex0".to_string(), Value::Undefined);
            map.insert("last".to_string(), Value::Undefined);
        }
    }
    Value::map(map)
}

type BodyFuture<'a> = LocalBoxFuture<'a, Result<(), PoisonError>>;

/// Drive the loop. `body` receives `(index0, item, known_length)` and is
/// awaited per-iteration in sequential mode or windowed in parallel mode.
/// Errors collect per iteration index and surface as one bundle; soft
/// iterator errors record and continue, hard ones record and stop.
pub(crate) async fn drive<'a, B>(
    iterable: Iterable,
    sequential: bool,
    limit: Option<usize>,
    mut body: B,
) -> LoopOutcome
where
    B: FnMut(usize, LoopItem, Option<usize>) -> BodyFuture<'a>,
{
    let mut errors: Vec<(usize, PoisonError)> = Vec::new();
    let mut iterations = 0usize;

    match iterable {
        Iterable::Empty => {
            return LoopOutcome {
                iterations: 0,
                error: None,
            }
        }
        Iterable::Items(items) => {
            let len = items.len();
            iterations = len;
            if sequential {
                for (i, item) in items.into_iter().enumerate() {
                    if let Err(p) = body(i, item, Some(len)).await {
                        errors.push((i, p));
                    }
                }
            } else {
                let window = limit.unwrap_or(usize::MAX);
                let mut running = FuturesUnordered::new();
                for (i, item) in items.into_iter().enumerate() {
                    while running.len() >= window {
                        if let Some((idx, result)) = running.next().await {
                            if let Err(p) = result {
                                errors.push((idx, p));
                            }
                        }
                    }
                    let fut = body(i, item, Some(len));
                    running.push(async move { (i, fut.await) });
                }
                while let Some((idx, result)) = running.next().await {
                    if let Err(p) = result {
                        errors.push((idx, p));
                    }
                }
            }
        }
        Iterable::Stream(mut stream) => {
            if sequential {
                let mut i = 0usize;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(value) => {
                            if let Err(p) = body(i, destructure_raw(value), None).await {
                                errors.push((i, p));
                            }
                        }
                        Err(IterError::Soft(e)) => errors.push((i, PoisonError::new(e))),
                        Err(IterError::Hard(e)) => {
                            errors.push((i, PoisonError::new(e)));
                            break;
                        }
                    }
                    i += 1;
                }
                iterations = i;
            } else {
                let window = limit.unwrap_or(usize::MAX);
                let mut running = FuturesUnordered::new();
                let mut i = 0usize;
                let mut stopped = false;
                loop {
                    if stopped && running.is_empty() {
                        break;
                    }
                    if !stopped && running.len() < window {
                        tokio::select! {
                            biased;
                            item = stream.next() => match item {
                                Some(Ok(value)) => {
                                    let fut = body(i, destructure_raw(value), None);
                                    running.push(async move { (i, fut.await) });
                                    i += 1;
                                }
                                Some(Err(IterError::Soft(e))) => {
                                    errors.push((i, PoisonError::new(e)));
                                    i += 1;
                                }
                                Some(Err(IterError::Hard(e))) => {
                                    errors.push((i, PoisonError::new(e)));
                                    i += 1;
                                    stopped = true;
                                }
                                None => stopped = true,
                            },
                            Some((idx, result)) = running.next() => {
                                if let Err(p) = result {
                                    errors.push((idx, p));
                                }
                            }
                        }
                    } else if let Some((idx, result)) = running.next().await {
                        if let Err(p) = result {
                            errors.push((idx, p));
                        }
                    }
                }
                iterations = i;
            }
        }
    }

    errors.sort_by_key(|(i, _)| *i);
    let mut merged: Option<PoisonError> = None;
    for (_, p) in errors {
        match &mut merged {
            Some(acc) => acc.merge(p),
            None => merged = Some(p),
        }
    }
    LoopOutcome {
        iterations,
        error: merged,
    }
}

fn destructure_raw(value: Value) -> LoopItem {
    let mut item = LoopItem::new();
    item.push(value);
    item
}

pub(crate) struct LoopOutcome {
    pub iterations: usize,
    pub error: Option<PoisonError>,
}

/// Helper for embedders and tests: build a stream value from results.
#[must_use]
pub fn stream_of(items: Vec<crate::value::IterResult>) -> Value {
    Value::Stream(ValueStream::new(Box::pin(futures::stream::iter(items))))
}

#[cfg(test)]
mod tests {
    use super::{drive, normalize, validate_limit, Iterable};
    use crate::error::{PoisonError, RenderError, RenderErrorKind};
    use crate::value::{IterError, Value};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn limit_accepts_only_finite_non_negatives() {
        assert_eq!(validate_limit(None).expect("none"), None);
        assert_eq!(validate_limit(Some(Value::Int(0))).expect("zero"), None);
        assert_eq!(validate_limit(Some(Value::Int(3))).expect("three"), Some(3));
        assert!(validate_limit(Some(Value::Int(-1))).is_err());
        assert!(validate_limit(Some(Value::Float(f64::NAN))).is_err());
        assert!(validate_limit(Some(Value::from("4"))).is_err());
    }

    #[test]
    fn null_and_undefined_iterate_empty() {
        assert!(matches!(normalize(Value::None, 1).expect("ok"), Iterable::Empty));
        assert!(matches!(
            normalize(Value::Undefined, 1).expect("ok"),
            Iterable::Empty
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parallel_window_never_exceeds_the_limit() {
        let live = Rc::new(RefCell::new((0usize, 0usize)));
        let items = normalize(
            Value::array((0..6).map(Value::from)),
            1,
        )
        .expect("iterable");
        let outcome = drive(items, false, Some(2), |_, _, _| {
            let live = Rc::clone(&live);
            Box::pin(async move {
                {
                    let mut s = live.borrow_mut();
                    s.0 += 1;
                    s.1 = s.1.max(s.0);
                }
                tokio::task::yield_now().await;
                live.borrow_mut().0 -= 1;
                Ok(())
            })
        })
        .await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.iterations, 6);
        assert!(live.borrow().1 <= 2, "window exceeded: {}", live.borrow().1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn soft_errors_continue_hard_errors_stop() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let stream = super::stream_of(vec![
            Ok(Value::from(1)),
            Err(IterError::Soft(RenderError::new(
                RenderErrorKind::IteratorSoft,
                "e2",
            ))),
            Ok(Value::from(3)),
            Err(IterError::Hard(RenderError::new(
                RenderErrorKind::IteratorHard,
                "e4",
            ))),
            Ok(Value::from(5)),
        ]);
        let iterable = normalize(stream, 1).expect("iterable");
        let seen2 = Rc::clone(&seen);
        let outcome = drive(iterable, true, None, move |_, item, _| {
            let seen = Rc::clone(&seen2);
            Box::pin(async move {
                seen.borrow_mut().push(item[0].clone());
                Ok(())
            })
        })
        .await;
        assert_eq!(*seen.borrow(), vec![Value::from(1), Value::from(3)]);
        let error = outcome.error.expect("collected errors");
        let messages: Vec<_> = error
            .errors()
            .iter()
            .map(|e| e.message().to_string())
            .collect();
        assert_eq!(messages, ["e2", "e4"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn body_errors_surface_in_iteration_order() {
        let items = normalize(Value::array((0..3).map(Value::from)), 1).expect("iterable");
        let outcome = drive(items, false, None, |i, _, _| {
            Box::pin(async move {
                // Later iterations fail faster.
                for _ in 0..(3 - i) {
                    tokio::task::yield_now().await;
                }
                Err(PoisonError::new(RenderError::new(
                    RenderErrorKind::Runtime,
                    format!("fail {i}"),
                )))
            })
        })
        .await;
        let error = outcome.error.expect("errors");
        let messages: Vec<_> = error
            .errors()
            .iter()
            .map(|e| e.message().to_string())
            .collect();
        assert_eq!(messages, ["fail 0", "fail 1", "fail 2"]);
    }
}
