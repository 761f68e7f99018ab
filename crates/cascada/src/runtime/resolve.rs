//! Sync-first combinators over concurrent producers.
//!
//! Every combinator awaits *all* of its inputs before reporting, so no error
//! from a concurrent producer is ever missed, and the collected bundle is
//! ordered by source position rather than completion time.

use std::future::Future;
use std::rc::Rc;

use futures::future::{join_all, LocalBoxFuture};
use futures::FutureExt;

use crate::error::PoisonError;
use crate::value::{Value, ValueMap};

use super::EvalResult;

/// Merge results in input order into a value list or one poison bundle.
pub(crate) fn collect_results(results: Vec<EvalResult>) -> Result<Vec<Value>, PoisonError> {
    let mut values = Vec::with_capacity(results.len());
    let mut poison: Option<PoisonError> = None;
    for result in results {
        match result {
            Ok(v) => values.push(v),
            Err(p) => match &mut poison {
                Some(acc) => acc.merge(p),
                None => poison = Some(p),
            },
        }
    }
    match poison {
        Some(p) => Err(p),
        None => Ok(values),
    }
}

/// Await every producer concurrently; errors collect in input order.
pub(crate) async fn resolve_all<F>(futures: Vec<F>) -> Result<Vec<Value>, PoisonError>
where
    F: Future<Output = EvalResult>,
{
    collect_results(join_all(futures).await)
}

pub(crate) async fn resolve_duo<A, B>(a: A, b: B) -> Result<(Value, Value), PoisonError>
where
    A: Future<Output = EvalResult>,
    B: Future<Output = EvalResult>,
{
    let (ra, rb) = futures::join!(a, b);
    let mut values = collect_results(vec![ra, rb])?;
    let second = values.pop().unwrap_or(Value::Undefined);
    let first = values.pop().unwrap_or(Value::Undefined);
    Ok((first, second))
}

/// Normalize one producer; present for symmetry with the aggregates.
pub(crate) async fn resolve_single<F>(value: F) -> EvalResult
where
    F: Future<Output = EvalResult>,
{
    value.await
}

/// Force a value if it is a lazy dict entry; anything else passes through.
pub(crate) async fn resolve_lazy(value: Value) -> EvalResult {
    let mut value = value;
    loop {
        match value {
            Value::Lazy(lazy) => value = lazy.force().await?,
            other => return Ok(other),
        }
    }
}

/// The hidden resolver attached to dict literals: awaiting the object awaits
/// every property resolver in place, recursively, so it either materializes
/// whole or poisons with errors in declaration order. Entries reached only
/// through member access stay unforced until that access.
pub(crate) fn resolve_object_properties(value: Value) -> LocalBoxFuture<'static, EvalResult> {
    async move {
        match resolve_lazy(value).await? {
            Value::Map(map) => {
                let futures: Vec<_> = map
                    .values()
                    .cloned()
                    .map(resolve_object_properties)
                    .collect();
                let values = resolve_all(futures).await?;
                let rebuilt: ValueMap = map.keys().cloned().zip(values).collect();
                Ok(Value::Map(Rc::new(rebuilt)))
            }
            Value::Array(items) => {
                let futures: Vec<_> = items
                    .iter()
                    .cloned()
                    .map(resolve_object_properties)
                    .collect();
                Ok(Value::Array(Rc::new(resolve_all(futures).await?)))
            }
            other => Ok(other),
        }
    }
    .boxed_local()
}

#[cfg(test)]
mod tests {
    use super::{resolve_all, resolve_duo};
    use crate::error::{PoisonError, RenderError, RenderErrorKind};
    use crate::value::Value;

    fn fail(msg: &str) -> PoisonError {
        PoisonError::new(RenderError::new(RenderErrorKind::Runtime, msg))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn errors_collect_in_input_order_not_completion_order() {
        let slow_failure = async {
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            Err(fail("first"))
        };
        let fast_failure = async { Err(fail("second")) };
        let err = resolve_all(vec![
            Box::pin(slow_failure) as futures::future::LocalBoxFuture<'_, _>,
            Box::pin(fast_failure),
        ])
        .await
        .expect_err("poison");
        let messages: Vec<_> = err.errors().iter().map(|e| e.message().to_string()).collect();
        assert_eq!(messages, ["first", "second"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn duo_returns_both_values() {
        let (a, b) = resolve_duo(async { Ok(Value::from(1)) }, async { Ok(Value::from(2)) })
            .await
            .expect("values");
        assert_eq!((a, b), (Value::from(1), Value::from(2)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn object_resolver_materializes_entries_in_declaration_order() {
        use crate::value::Lazy;

        let map = Value::map([
            (
                "z".to_string(),
                Value::Lazy(Lazy::new(Box::pin(async { Ok(Value::from(1)) }))),
            ),
            ("a".to_string(), Value::from(2)),
        ]);
        let resolved = super::resolve_object_properties(map).await.expect("map");
        let Value::Map(resolved) = resolved else {
            panic!("expected map");
        };
        let keys: Vec<_> = resolved.keys().cloned().collect();
        assert_eq!(keys, ["z", "a"]);
        assert_eq!(resolved.get("z"), Some(&Value::from(1)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn object_resolver_surfaces_entry_failures_in_declaration_order() {
        use crate::value::Lazy;

        let map = Value::map([
            (
                "bad".to_string(),
                Value::Lazy(Lazy::new(Box::pin(async { Err(fail("first")) }))),
            ),
            (
                "worse".to_string(),
                Value::Lazy(Lazy::new(Box::pin(async { Err(fail("second")) }))),
            ),
        ]);
        let err = super::resolve_object_properties(map)
            .await
            .expect_err("poison");
        let messages: Vec<_> = err.errors().iter().map(|e| e.message().to_string()).collect();
        assert_eq!(messages, ["first", "second"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unaccessed_entries_never_run() {
        use crate::value::Lazy;
        use std::cell::Cell;
        use std::rc::Rc;

        let runs = Rc::new(Cell::new(0));
        let counter = Rc::clone(&runs);
        let map = Value::map([
            ("a".to_string(), Value::from(1)),
            (
                "b".to_string(),
                Value::Lazy(Lazy::new(Box::pin(async move {
                    counter.set(counter.get() + 1);
                    Err(fail("never observed"))
                }))),
            ),
        ]);
        let Value::Map(map) = map else {
            panic!("expected map");
        };
        let a = super::resolve_lazy(map.get("a").cloned().unwrap_or(Value::Undefined))
            .await
            .expect("value");
        assert_eq!(a, Value::from(1));
        assert_eq!(runs.get(), 0, "the untouched entry must stay unforced");
    }
}
