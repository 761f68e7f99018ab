//! Expression evaluation.
//!
//! Aggregates evaluate their children concurrently and always await every
//! child, so no error from a concurrent producer is lost and bundles stay in
//! source order. Sequenced operations chain onto their path's lock in the
//! synchronous prefix, before any await, which pins their turn to lexical
//! order.

use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures::FutureExt;

use crate::ast::{Expr, ExprKind, LiteralValue};
use crate::environment::Callable;
use crate::error::{PoisonError, RenderError, RenderErrorKind};
use crate::runtime::call::not_callable_error;
use crate::runtime::frame::{resolve_binding, Frame};
use crate::runtime::lookup::{context_or_frame_lookup, member_lookup, missing_name_error};
use crate::runtime::resolve::{
    resolve_all, resolve_duo, resolve_lazy, resolve_object_properties,
};
use crate::runtime::sequence::{LockTurn, Targets};
use crate::runtime::EvalResult;
use crate::value::{Args, FuncReturn, Lazy, Value, ValueMap};

use super::ops;
use super::Evaluator;

impl Evaluator {
    pub(crate) fn eval_expr<'a>(
        &'a self,
        expr: &'a Expr,
        frame: &'a Rc<Frame>,
        targets: &'a Targets,
    ) -> LocalBoxFuture<'a, EvalResult> {
        let ann = self.anns().expr(expr.id);
        // Chain sequenced ops before anything can suspend.
        let turn = ann
            .lock_key
            .as_ref()
            .and_then(|key| LockTurn::acquire(targets, frame, key));

        match (&expr.kind, turn) {
            (ExprKind::FunCall { callee, args, kwargs }, turn) => self
                .eval_funcall(expr, callee, args, kwargs, frame, targets, None, turn)
                .boxed_local(),
            (_, Some(turn)) => async move {
                // A sequenced read waits its turn, observes, and passes the
                // chain on. A poisoned predecessor stops it from running.
                if let Err(p) = turn.wait_turn().await {
                    turn.release(Err(p.clone()));
                    return Err(p);
                }
                let result = self.eval_plain(expr, frame, targets).await;
                turn.release(result.clone());
                result
            }
            .boxed_local(),
            (_, None) => self.eval_plain(expr, frame, targets).boxed_local(),
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn eval_plain(
        &self,
        expr: &Expr,
        frame: &Rc<Frame>,
        targets: &Targets,
    ) -> EvalResult {
        match &expr.kind {
            ExprKind::Literal(value) => Ok(literal_value(value)),
            ExprKind::Symbol { name, .. } => {
                let binding = context_or_frame_lookup(
                    frame,
                    &self.context,
                    |n| self.env.global(n),
                    name,
                );
                match binding {
                    Some(b) => resolve_binding(b).await,
                    None if self.strict_lookup() => {
                        Err(PoisonError::new(missing_name_error(name).at(expr.pos)))
                    }
                    None => Ok(Value::Undefined),
                }
            }
            ExprKind::Group(items) | ExprKind::Array(items) => {
                let futures: Vec<_> = items
                    .iter()
                    .map(|e| self.eval_expr(e, frame, targets))
                    .collect();
                Ok(Value::array(resolve_all(futures).await?))
            }
            ExprKind::Dict(entries) => {
                // Keys resolve eagerly (the object needs its shape); values
                // stay lazy so an entry's producer only runs when the entry
                // is actually accessed.
                let key_futures: Vec<_> = entries
                    .iter()
                    .map(|(k, _)| self.eval_expr(k, frame, targets))
                    .collect();
                let keys = resolve_all(key_futures).await?;
                let mut map = ValueMap::new();
                for (key, (_, value)) in keys.into_iter().zip(entries.iter()) {
                    let ev = self.clone();
                    let frame = Rc::clone(frame);
                    let targets = targets.clone();
                    let value = Rc::clone(value);
                    let lazy = Lazy::new(Box::pin(async move {
                        ev.eval_expr(&value, &frame, &targets).await
                    }));
                    map.insert(key.render(), Value::Lazy(lazy));
                }
                Ok(Value::Map(Rc::new(map)))
            }
            ExprKind::Lookup { obj, key, .. } => {
                let (obj_v, key_v) = resolve_duo(
                    self.eval_expr(obj, frame, targets),
                    self.eval_expr(key, frame, targets),
                )
                .await?;
                // Accessing a dict entry forces its resolver. A forced
                // callable still binds to its owner.
                match resolve_lazy(member_lookup(&obj_v, &key_v)).await? {
                    Value::Func(f) => Ok(Value::Func(f.bind(obj_v.clone()))),
                    other => Ok(other),
                }
            }
            ExprKind::FunCall {
                callee,
                args,
                kwargs,
            } => {
                self.eval_funcall(expr, callee, args, kwargs, frame, targets, None, None)
                    .await
            }
            ExprKind::Filter { name, args, kwargs } => {
                let callable = self.env.filter(name).ok_or_else(|| {
                    PoisonError::new(
                        RenderError::new(
                            RenderErrorKind::Lookup,
                            format!("filter not found: {name}"),
                        )
                        .at(expr.pos),
                    )
                })?;
                let (positional, kwargs) = self
                    .eval_args(args, kwargs, frame, targets)
                    .await
                    .map_err(|p| {
                        p.ensure_context(expr.pos, Some(name), self.unit.path.as_ref());
                        p
                    })?;
                self.invoke_callable(&callable, name, positional, kwargs, expr.pos)
                    .await
            }
            ExprKind::Test {
                expr: inner,
                name,
                args,
                negated,
            } => {
                let value = if matches!(name.as_str(), "defined" | "undefined") {
                    // Probing for existence must not trip strict lookup.
                    match self.eval_expr(inner, frame, targets).await {
                        Ok(v) => v,
                        Err(p)
                            if p.errors().len() == 1
                                && p.errors()[0].kind() == RenderErrorKind::Lookup =>
                        {
                            Value::Undefined
                        }
                        Err(p) => return Err(p),
                    }
                } else {
                    self.eval_expr(inner, frame, targets).await?
                };
                let callable = self.env.test(name).ok_or_else(|| {
                    PoisonError::new(
                        RenderError::new(
                            RenderErrorKind::Lookup,
                            format!("test not found: {name}"),
                        )
                        .at(expr.pos),
                    )
                })?;
                let arg_futures: Vec<_> = args
                    .iter()
                    .map(|e| self.eval_expr(e, frame, targets))
                    .collect();
                let mut positional = vec![value];
                positional.extend(resolve_all(arg_futures).await?);
                let result = self
                    .invoke_callable(&callable, name, positional, ValueMap::new(), expr.pos)
                    .await?;
                Ok(Value::Bool(result.is_true() != *negated))
            }
            ExprKind::Compare { left, ops } => {
                let mut futures = vec![self.eval_expr(left, frame, targets)];
                futures.extend(ops.iter().map(|(_, e)| self.eval_expr(e, frame, targets)));
                let values = resolve_all(futures).await?;
                for (i, (op, _)) in ops.iter().enumerate() {
                    let holds = ops::compare(*op, &values[i], &values[i + 1])
                        .map_err(|e| PoisonError::new(e.at(expr.pos)))?;
                    if !holds {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            ExprKind::In {
                left,
                right,
                negated,
            } => {
                let (needle, haystack) = resolve_duo(
                    self.eval_expr(left, frame, targets),
                    self.eval_expr(right, frame, targets),
                )
                .await?;
                let found = ops::contains(&needle, &haystack)
                    .map_err(|e| PoisonError::new(e.at(expr.pos)))?;
                Ok(Value::Bool(found != *negated))
            }
            ExprKind::InlineIf {
                cond,
                then,
                otherwise,
            } => {
                let c = self.eval_expr(cond, frame, targets).await?;
                if c.is_true() {
                    self.eval_expr(then, frame, targets).await
                } else {
                    match otherwise {
                        Some(e) => self.eval_expr(e, frame, targets).await,
                        None => Ok(Value::Undefined),
                    }
                }
            }
            ExprKind::And(l, r) => {
                let left = self.eval_expr(l, frame, targets).await?;
                if left.is_true() {
                    self.eval_expr(r, frame, targets).await
                } else {
                    Ok(left)
                }
            }
            ExprKind::Or(l, r) => {
                let left = self.eval_expr(l, frame, targets).await?;
                if left.is_true() {
                    Ok(left)
                } else {
                    self.eval_expr(r, frame, targets).await
                }
            }
            ExprKind::Not(inner) => {
                let v = self.eval_expr(inner, frame, targets).await?;
                Ok(Value::Bool(!v.is_true()))
            }
            ExprKind::BinOp { op, left, right } => {
                let (a, b) = resolve_duo(
                    self.eval_expr(left, frame, targets),
                    self.eval_expr(right, frame, targets),
                )
                .await?;
                ops::binop(*op, &a, &b).map_err(|e| PoisonError::new(e.at(expr.pos)))
            }
            ExprKind::Neg(inner) => {
                let v = self.eval_expr(inner, frame, targets).await?;
                ops::negate(&v).map_err(|e| PoisonError::new(e.at(expr.pos)))
            }
            ExprKind::Pos(inner) => {
                let v = self.eval_expr(inner, frame, targets).await?;
                if v.as_number().is_some() {
                    Ok(v)
                } else {
                    Err(PoisonError::new(
                        RenderError::new(
                            RenderErrorKind::Runtime,
                            format!("cannot apply unary plus to {}", v.type_name()),
                        )
                        .at(expr.pos),
                    ))
                }
            }
        }
    }

    pub(crate) async fn eval_call_with_caller(
        &self,
        call: &Expr,
        frame: &Rc<Frame>,
        targets: &Targets,
        caller: Option<Value>,
    ) -> EvalResult {
        let ExprKind::FunCall { callee, args, kwargs } = &call.kind else {
            return Err(PoisonError::new(
                RenderError::new(RenderErrorKind::Runtime, "expected a call expression")
                    .at(call.pos),
            ));
        };
        let ann = self.anns().expr(call.id);
        let turn = ann
            .lock_key
            .as_ref()
            .and_then(|key| LockTurn::acquire(targets, frame, key));
        self.eval_funcall(call, callee, args, kwargs, frame, targets, caller, turn)
            .await
    }

    /// Calls never miss an error: the callee and every argument are awaited
    /// even when one of them already failed. A sequenced call resolves its
    /// arguments first, then waits its turn, then runs; success releases the
    /// chain to the result and failure poisons it.
    #[allow(clippy::too_many_arguments)]
    async fn eval_funcall(
        &self,
        expr: &Expr,
        callee: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        frame: &Rc<Frame>,
        targets: &Targets,
        caller: Option<Value>,
        turn: Option<LockTurn>,
    ) -> EvalResult {
        if let ExprKind::Symbol { name, .. } = &callee.kind {
            if name == "super" && args.is_empty() {
                return self.render_super().await;
            }
        }

        let display = callee
            .static_path()
            .map_or_else(|| "expression".to_string(), |p| p.join("."));

        let mut futures = vec![self.eval_expr(callee, frame, targets)];
        futures.extend(args.iter().map(|e| self.eval_expr(e, frame, targets)));
        futures.extend(kwargs.iter().map(|(_, e)| self.eval_expr(e, frame, targets)));

        let resolved = resolve_all(futures).await;
        let mut values = match resolved {
            Ok(v) => v.into_iter(),
            Err(p) => {
                p.ensure_context(expr.pos, Some(&display), self.unit.path.as_ref());
                if let Some(turn) = turn {
                    turn.release(Err(p.clone()));
                }
                return Err(p);
            }
        };

        let callee_value = values.next().unwrap_or(Value::Undefined);
        let mut call_args = Args::default();
        for _ in 0..args.len() {
            call_args
                .positional
                .push(values.next().unwrap_or(Value::Undefined));
        }
        for (name, _) in kwargs {
            call_args
                .kwargs
                .insert(name.clone(), values.next().unwrap_or(Value::Undefined));
        }

        if let Some(turn) = turn {
            if let Err(p) = turn.wait_turn().await {
                turn.release(Err(p.clone()));
                return Err(p);
            }
            let result = self
                .apply_call(&callee_value, &display, call_args, caller, expr.pos)
                .await;
            turn.release(result.clone());
            return result;
        }

        self.apply_call(&callee_value, &display, call_args, caller, expr.pos)
            .await
    }

    async fn apply_call(
        &self,
        callee: &Value,
        display: &str,
        args: Args,
        caller: Option<Value>,
        pos: crate::error::Pos,
    ) -> EvalResult {
        match callee {
            Value::Func(f) => {
                // Opaque callables receive fully materialized arguments;
                // only template code can force lazy entries itself.
                let args = match materialize_args(args).await {
                    Ok(args) => args,
                    Err(p) => {
                        p.ensure_context(pos, Some(display), self.unit.path.as_ref());
                        return Err(p);
                    }
                };
                let result = match f.invoke(args) {
                    FuncReturn::Value(r) => r,
                    FuncReturn::Future(fut) => fut.await,
                };
                result.map_err(|e| {
                    e.ensure_context(pos, Some(display), self.unit.path.as_ref());
                    PoisonError::new(e)
                })
            }
            Value::Macro(m) => {
                let result = self.call_macro(m, args, caller).await;
                if let Err(p) = &result {
                    p.ensure_context(pos, Some(display), self.unit.path.as_ref());
                }
                result
            }
            other => Err(PoisonError::new(
                not_callable_error(display, other).at(pos),
            )),
        }
    }

    async fn eval_args(
        &self,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        frame: &Rc<Frame>,
        targets: &Targets,
    ) -> Result<(Vec<Value>, ValueMap), PoisonError> {
        let mut futures: Vec<_> = args
            .iter()
            .map(|e| self.eval_expr(e, frame, targets))
            .collect();
        futures.extend(kwargs.iter().map(|(_, e)| self.eval_expr(e, frame, targets)));
        let mut values = resolve_all(futures).await?.into_iter();
        let positional: Vec<_> = (0..args.len())
            .map(|_| values.next().unwrap_or(Value::Undefined))
            .collect();
        let named: ValueMap = kwargs
            .iter()
            .map(|(name, _)| (name.clone(), values.next().unwrap_or(Value::Undefined)))
            .collect();
        Ok((positional, named))
    }

    pub(crate) async fn invoke_callable(
        &self,
        callable: &Callable,
        name: &str,
        positional: Vec<Value>,
        kwargs: ValueMap,
        pos: crate::error::Pos,
    ) -> EvalResult {
        let args = Args {
            positional: positional.into_iter().collect(),
            kwargs,
        };
        let args = match materialize_args(args).await {
            Ok(args) => args,
            Err(p) => {
                p.ensure_context(pos, Some(name), self.unit.path.as_ref());
                return Err(p);
            }
        };
        let result = match callable {
            Callable::Sync(f) => f(args),
            Callable::Async(f) => f(args).await,
        };
        result.map_err(|e| {
            e.ensure_context(pos, Some(name), self.unit.path.as_ref());
            PoisonError::new(e)
        })
    }
}

/// Await the hidden resolvers in every argument so user callables never see
/// unforced dict entries; errors collect in argument order.
async fn materialize_args(args: Args) -> Result<Args, PoisonError> {
    let Args { positional, kwargs } = args;
    let n_positional = positional.len();
    let keys: Vec<String> = kwargs.keys().cloned().collect();
    let futures: Vec<_> = positional
        .into_iter()
        .chain(kwargs.into_iter().map(|(_, v)| v))
        .map(resolve_object_properties)
        .collect();
    let mut values = resolve_all(futures).await?.into_iter();

    let mut out = Args::default();
    for _ in 0..n_positional {
        out.positional.push(values.next().unwrap_or(Value::Undefined));
    }
    for key in keys {
        out.kwargs.insert(key, values.next().unwrap_or(Value::Undefined));
    }
    Ok(out)
}

fn literal_value(value: &LiteralValue) -> Value {
    match value {
        LiteralValue::None => Value::None,
        LiteralValue::Bool(b) => Value::Bool(*b),
        LiteralValue::Int(i) => Value::Int(*i),
        LiteralValue::Float(f) => Value::Float(*f),
        LiteralValue::Str(s) => Value::Str(s.as_str().into()),
    }
}
