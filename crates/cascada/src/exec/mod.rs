//! The executable unit: compilation packaging and the evaluator the compiled
//! template runs on.
//!
//! A block's children all start inside one synchronous sweep — snapshot,
//! announce, reserve, enter — in lexical order, then run concurrently. The
//! write gates and sequence chains announced during the sweep are what keep
//! the concurrent execution observationally sequential where the source
//! demands it.

pub(crate) mod expr;
mod ops;

use std::collections::HashMap;
use std::rc::Rc;

use futures::future::{join_all, LocalBoxFuture};
use futures::FutureExt;
use tracing::trace;

use crate::ast::{Body, LoopMode, Param, PathSeg, Stmt, StmtKind, VarType};
use crate::context::Context;
use crate::environment::EnvInner;
use crate::error::{CompileError, PoisonError, RenderError, RenderErrorKind};
use crate::parse::{ScriptParser, SyntaxConfig, TemplateParser};
use crate::runtime::async_state::AsyncState;
use crate::runtime::buffer::{suppress_value, Buffer, ScriptAssembly, Slot};
use crate::runtime::call::{bind_macro_args, MacroValue};
use crate::runtime::frame::{resolve_binding, Frame};
use crate::runtime::iterate::{
    self, destructure, loop_object, normalize, validate_limit, Iterable,
};
use crate::runtime::sequence::Targets;
use crate::runtime::EvalResult;
use crate::script::command::{CommandRecord, PathValue};
use crate::script::ScriptOutput;
use crate::transform::{annotate, Annotations, BodyAnn, CompileHints};
use crate::value::{Value, ValueMap};
use crate::TRACE_TARGET_RENDER;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) enum Mode {
    Template,
    Script,
}

/// A compiled template or script: the annotated tree plus everything the
/// runtime needs to start executing without re-analysis.
pub(crate) struct CompiledUnit {
    pub body: Rc<Body>,
    pub anns: Rc<Annotations>,
    pub path: Option<Rc<str>>,
    pub mode: Mode,
    pub blocks: HashMap<String, Rc<Body>>,
    pub has_extends: bool,
}

pub(crate) fn compile(
    src: &str,
    mode: Mode,
    syntax: &SyntaxConfig,
    hints: &CompileHints,
    path: Option<&str>,
) -> Result<Rc<CompiledUnit>, CompileError> {
    let with_path = |mut e: CompileError| {
        if let Some(path) = path {
            if e.template_path.is_none() {
                e.template_path = Some(path.to_string());
            }
        }
        e
    };

    let (body, ids) = match mode {
        Mode::Template => TemplateParser::parse(src, syntax).map_err(with_path)?,
        Mode::Script => ScriptParser::parse(src).map_err(with_path)?,
    };
    let anns = annotate(&body, &ids, hints).map_err(with_path)?;

    let mut blocks = HashMap::new();
    collect_blocks(&body, &mut blocks);
    let has_extends = body
        .stmts
        .iter()
        .any(|s| matches!(s.kind, StmtKind::Extends(_)));

    Ok(Rc::new(CompiledUnit {
        body: Rc::new(body),
        anns: Rc::new(anns),
        path: path.map(Rc::from),
        mode,
        blocks,
        has_extends,
    }))
}

fn collect_blocks(body: &Body, out: &mut HashMap<String, Rc<Body>>) {
    for stmt in &body.stmts {
        match &stmt.kind {
            StmtKind::Block { name, body } => {
                out.entry(name.clone()).or_insert_with(|| Rc::clone(body));
                collect_blocks(body, out);
            }
            StmtKind::If { arms, alt } => {
                for (_, b) in arms {
                    collect_blocks(b, out);
                }
                if let Some(b) = alt {
                    collect_blocks(b, out);
                }
            }
            StmtKind::For { body, alt, .. } => {
                collect_blocks(body, out);
                if let Some(b) = alt {
                    collect_blocks(b, out);
                }
            }
            StmtKind::While { body, .. } => collect_blocks(body, out),
            StmtKind::Switch { cases, default, .. } => {
                for (_, b) in cases {
                    collect_blocks(b, out);
                }
                if let Some(b) = default {
                    collect_blocks(b, out);
                }
            }
            _ => {}
        }
    }
}

type BlockChains = HashMap<String, Vec<(Rc<Body>, Rc<CompiledUnit>)>>;

const NOT_ROOT: u32 = u32::MAX;

/// One render's evaluation state; cheap to clone, everything reference
/// counted.
#[derive(Clone)]
pub(crate) struct Evaluator {
    pub env: Rc<EnvInner>,
    pub context: Rc<Context>,
    pub astate: Rc<AsyncState>,
    pub unit: Rc<CompiledUnit>,
    pub blocks: Rc<BlockChains>,
    pub parent_template: Rc<std::cell::RefCell<Option<String>>>,
    pub focus: Rc<std::cell::RefCell<Option<String>>>,
    pub block_pos: Option<(Rc<str>, usize)>,
    pub suppress_inline_blocks: bool,
    /// Body id of the root statement list; top-level sets export through the
    /// context. `NOT_ROOT` in macro bodies, blocks and includes.
    pub root_body_id: u32,
}

impl Evaluator {
    fn anns(&self) -> &Annotations {
        &self.unit.anns
    }

    fn strict_lookup(&self) -> bool {
        self.unit.mode == Mode::Script
    }

    fn with_unit(&self, unit: &Rc<CompiledUnit>) -> Self {
        let mut ev = self.clone();
        ev.unit = Rc::clone(unit);
        ev.root_body_id = NOT_ROOT;
        ev
    }

    fn with_block(&self, name: Rc<str>, depth: usize) -> Self {
        let mut ev = self.clone();
        ev.block_pos = Some((name, depth));
        ev
    }

    /// Render a whole unit (following `extends` hops) into `buf`.
    pub fn run_unit_into(
        env: Rc<EnvInner>,
        context: Rc<Context>,
        astate: Rc<AsyncState>,
        unit: Rc<CompiledUnit>,
        buf: Rc<Buffer>,
        focus: Rc<std::cell::RefCell<Option<String>>>,
    ) -> LocalBoxFuture<'static, Result<(), PoisonError>> {
        async move {
            let mut unit = unit;
            let mut context = context;
            let mut chains: BlockChains = HashMap::new();
            for (name, body) in &unit.blocks {
                chains.insert(name.clone(), vec![(Rc::clone(body), Rc::clone(&unit))]);
            }

            loop {
                let parent_template = Rc::new(std::cell::RefCell::new(None));
                let extending = unit.has_extends;
                let ev = Evaluator {
                    env: Rc::clone(&env),
                    context: Rc::clone(&context),
                    astate: Rc::clone(&astate),
                    unit: Rc::clone(&unit),
                    blocks: Rc::new(chains.clone()),
                    parent_template: Rc::clone(&parent_template),
                    focus: Rc::clone(&focus),
                    block_pos: None,
                    suppress_inline_blocks: extending,
                    root_body_id: unit.body.id,
                };
                // An extending unit runs for its side effects only; its own
                // output is discarded in favor of the parent's.
                let target = if extending { Buffer::new() } else { Rc::clone(&buf) };
                let frame = Frame::root();
                let body = Rc::clone(&unit.body);
                let result = ev.eval_body(&body, &frame, &Targets::empty(), &target).await;

                let parent = parent_template.borrow_mut().take();
                match parent {
                    Some(name) => {
                        result?;
                        let parent_unit = ev
                            .load_unit(&name, unit.mode)
                            .await
                            .map_err(PoisonError::new)?;
                        for (name, body) in &parent_unit.blocks {
                            chains
                                .entry(name.clone())
                                .or_default()
                                .push((Rc::clone(body), Rc::clone(&parent_unit)));
                        }
                        context = Rc::new(context.fork());
                        unit = parent_unit;
                    }
                    None => return result,
                }
            }
        }
        .boxed_local()
    }

    async fn load_unit(&self, name: &str, mode: Mode) -> Result<Rc<CompiledUnit>, RenderError> {
        self.env.get_unit(name, mode).await.map_err(|e| {
            RenderError::with_cause(
                RenderErrorKind::Runtime,
                format!("cannot load template {name:?}"),
                anyhow::anyhow!(e.to_string()),
            )
        })
    }

    /// Evaluate a statement list. The synchronous sweep snapshots, announces
    /// and reserves for every child in lexical order; the children then run
    /// concurrently and errors merge back in child order.
    pub fn eval_body<'a>(
        &'a self,
        body: &'a Body,
        frame: &'a Rc<Frame>,
        targets: &'a Targets,
        buf: &'a Rc<Buffer>,
    ) -> LocalBoxFuture<'a, Result<(), PoisonError>> {
        async move {
            let top = body.id == self.root_body_id;
            let mut children = Vec::new();

            for stmt in &body.stmts {
                if let StmtKind::Text(text) = &stmt.kind {
                    // Literal template data is trusted; autoescape only
                    // applies to expression output.
                    buf.push(Slot::Safe(text.as_str().into()));
                    continue;
                }
                let ann = self.anns().stmt(stmt.id);

                let mut seeds = Vec::new();
                if ann.is_async {
                    for name in ann.reads.iter().chain(ann.writes.iter().map(|(n, _)| n)) {
                        if let Some(binding) = frame.lookup_binding(name) {
                            seeds.push((Rc::clone(name), binding));
                        }
                    }
                }
                let child_targets =
                    Targets::announce_child(targets, frame, &ann.declares, &ann.writes, &ann.locks);
                let child_frame = if ann.is_async {
                    frame.push_async_block(seeds)
                } else {
                    Rc::clone(frame)
                };
                let child_buf = Buffer::new();
                buf.push(Slot::Nested(Rc::clone(&child_buf)));
                let guard = ann.is_async.then(|| self.astate.enter_async_block());

                children.push(async move {
                    let result = self
                        .eval_stmt(stmt, &child_frame, &child_targets, &child_buf, top)
                        .await;
                    match &result {
                        Ok(()) => child_targets.skip_remaining(),
                        Err(p) => {
                            p.ensure_context(stmt.pos, None, self.unit.path.as_ref());
                            child_targets.poison_all(p);
                        }
                    }
                    drop(guard);
                    result
                });
            }

            let results = join_all(children).await;
            let mut poison: Option<PoisonError> = None;
            for result in results {
                if let Err(p) = result {
                    match &mut poison {
                        Some(acc) => acc.merge(p),
                        None => poison = Some(p),
                    }
                }
            }
            poison.map_or(Ok(()), Err)
        }
        .boxed_local()
    }

    #[allow(clippy::too_many_lines)]
    async fn eval_stmt(
        &self,
        stmt: &Stmt,
        frame: &Rc<Frame>,
        targets: &Targets,
        buf: &Rc<Buffer>,
        top: bool,
    ) -> Result<(), PoisonError> {
        match &stmt.kind {
            StmtKind::Text(text) => {
                buf.push(Slot::Safe(text.as_str().into()));
                Ok(())
            }
            StmtKind::Output(expr) => {
                // Rendering the value awaits its hidden resolvers in place:
                // a dict literal either materializes whole or poisons here.
                let result = match self.eval_expr(expr, frame, targets).await {
                    Ok(v) => crate::runtime::resolve::resolve_object_properties(v).await,
                    Err(p) => Err(p),
                };
                if let Err(p) = &result {
                    // Expression roots that may suspend own their error
                    // position.
                    if self.anns().expr(expr.id).wrap_async {
                        p.ensure_context(expr.pos, None, self.unit.path.as_ref());
                    }
                }
                let failed = result.as_ref().err().cloned();
                buf.push(suppress_value(
                    result,
                    self.env.options().throw_on_undefined,
                    expr.pos,
                ));
                failed.map_or(Ok(()), Err)
            }
            StmtKind::OutputCommand {
                handler,
                subpath,
                command,
                args,
            } => {
                self.eval_command(stmt, handler, subpath, command, args, frame, targets, buf)
                    .await
            }
            StmtKind::Option { name, value } => {
                let v = self.eval_expr(value, frame, targets).await?;
                if name == "focus" {
                    *self.focus.borrow_mut() = Some(v.render());
                }
                Ok(())
            }
            StmtKind::If { arms, alt } => {
                let mut taken: Option<&Body> = None;
                let mut cond_poison: Option<PoisonError> = None;
                let mut skip_from = 0;

                for (i, (cond, branch)) in arms.iter().enumerate() {
                    let trap = frame.push();
                    match self.eval_expr(cond, &trap, targets).await {
                        Err(p) => {
                            cond_poison = Some(p);
                            skip_from = i;
                            break;
                        }
                        Ok(v) if v.is_true() => {
                            taken = Some(branch);
                            skip_from = i + 1;
                            break;
                        }
                        Ok(_) => {
                            self.skip_body_effects(branch, targets);
                            skip_from = i + 1;
                        }
                    }
                }

                for (_, branch) in arms.iter().skip(skip_from) {
                    self.skip_body_effects(branch, targets);
                }
                if let Some(p) = cond_poison {
                    if let Some(alt) = alt {
                        self.skip_body_effects(alt, targets);
                    }
                    return Err(p);
                }

                match (taken, alt) {
                    (Some(branch), alt) => {
                        if let Some(alt) = alt {
                            self.skip_body_effects(alt, targets);
                        }
                        self.eval_body(branch, frame, targets, buf).await
                    }
                    (None, Some(alt)) => self.eval_body(alt, frame, targets, buf).await,
                    (None, None) => Ok(()),
                }
            }
            StmtKind::Switch {
                subject,
                cases,
                default,
            } => {
                let trap = frame.push();
                let subject_value = match self.eval_expr(subject, &trap, targets).await {
                    Ok(v) => v,
                    Err(p) => {
                        for (_, branch) in cases {
                            self.skip_body_effects(branch, targets);
                        }
                        if let Some(default) = default {
                            self.skip_body_effects(default, targets);
                        }
                        return Err(p);
                    }
                };

                let mut taken: Option<&Body> = None;
                for (matches, branch) in cases {
                    if taken.is_some() {
                        self.skip_body_effects(branch, targets);
                        continue;
                    }
                    let mut matched = false;
                    for m in matches {
                        let v = self.eval_expr(m, &trap, targets).await?;
                        if v == subject_value {
                            matched = true;
                            break;
                        }
                    }
                    if matched {
                        taken = Some(branch);
                    } else {
                        self.skip_body_effects(branch, targets);
                    }
                }

                match (taken, default) {
                    (Some(branch), default) => {
                        if let Some(default) = default {
                            self.skip_body_effects(default, targets);
                        }
                        self.eval_body(branch, frame, targets, buf).await
                    }
                    (None, Some(default)) => self.eval_body(default, frame, targets, buf).await,
                    (None, None) => Ok(()),
                }
            }
            StmtKind::For {
                targets: loop_targets,
                iter,
                body,
                alt,
                mode,
                concurrent_limit,
            } => {
                self.eval_for(
                    stmt,
                    loop_targets,
                    iter,
                    body,
                    alt.as_ref(),
                    *mode,
                    concurrent_limit.as_ref(),
                    frame,
                    targets,
                    buf,
                )
                .await
            }
            StmtKind::While { cond, body } => {
                self.eval_while(cond, body, frame, targets, buf).await
            }
            StmtKind::Set {
                targets: names,
                value,
                body,
                var_type,
            } => {
                let result: EvalResult = match (value, body, var_type) {
                    (_, _, VarType::Extern) => {
                        let name = names.first().map(String::as_str).unwrap_or_default();
                        Ok(self.context.get(name).unwrap_or(Value::Undefined))
                    }
                    (Some(value), _, _) => self.eval_expr(value, frame, targets).await,
                    (None, Some(body), _) => {
                        let capture_frame = frame.push();
                        let capture_buf = Buffer::new();
                        self.eval_body(body, &capture_frame, targets, &capture_buf)
                            .await
                            .and_then(|()| {
                                capture_buf
                                    .flatten_template(self.env.options().autoescape)
                                    .map(|s| Value::Safe(s.into()))
                            })
                    }
                    (None, None, _) => Ok(Value::Undefined),
                };

                for name in names {
                    if let Some(gate) = targets.write_gate(name) {
                        gate.fulfill(result.clone());
                    } else {
                        frame.declare_value(name.as_str(), result.clone().unwrap_or_default());
                    }
                    if top
                        && self.unit.mode == Mode::Template
                        && !name.starts_with('_')
                    {
                        if let Ok(v) = &result {
                            self.context.export(name, v.clone());
                        }
                    }
                }
                result.map(|_| ())
            }
            StmtKind::Do(exprs) => {
                let futures: Vec<_> = exprs
                    .iter()
                    .map(|e| self.eval_expr(e, frame, targets))
                    .collect();
                crate::runtime::resolve::resolve_all(futures).await.map(|_| ())
            }
            StmtKind::Macro { name, params, body } => {
                let value = Value::Macro(Rc::new(MacroValue::new(
                    name.as_str(),
                    Rc::clone(params),
                    Rc::clone(body),
                    Rc::clone(frame),
                    Rc::clone(&self.unit),
                )));
                if let Some(gate) = targets.write_gate(name) {
                    gate.fulfill(Ok(value.clone()));
                } else {
                    frame.declare_value(name.as_str(), value.clone());
                }
                if top && self.unit.mode == Mode::Template && !name.starts_with('_') {
                    self.context.export(name, value);
                }
                Ok(())
            }
            StmtKind::CallBlock { call, params, body } => {
                let caller = Value::Macro(Rc::new(MacroValue::new(
                    "caller",
                    Rc::clone(params),
                    Rc::clone(body),
                    Rc::clone(frame),
                    Rc::clone(&self.unit),
                )));
                let result = self
                    .eval_call_with_caller(call, frame, targets, Some(caller))
                    .await;
                let failed = result.as_ref().err().cloned();
                buf.push(suppress_value(
                    result,
                    self.env.options().throw_on_undefined,
                    call.pos,
                ));
                failed.map_or(Ok(()), Err)
            }
            StmtKind::Block { name, body } => {
                if self.suppress_inline_blocks && top {
                    return Ok(());
                }
                self.render_block_into(name, 0, frame, targets, buf, body)
                    .await
            }
            StmtKind::Extends(template) => {
                let v = self.eval_expr(template, frame, targets).await?;
                *self.parent_template.borrow_mut() = Some(v.render());
                Ok(())
            }
            StmtKind::Include { template } => {
                let v = self.eval_expr(template, frame, targets).await?;
                let name = v.render();
                let unit = self
                    .load_unit(&name, Mode::Template)
                    .await
                    .map_err(|e| PoisonError::new(e.at(stmt.pos)))?;
                // Composition mode: the child's buffer nests into ours
                // synchronously; its completion future joins this statement.
                let child_buf = Buffer::new();
                buf.push(Slot::Nested(Rc::clone(&child_buf)));
                let child_ctx = Rc::new(self.context.fork());
                Self::run_unit_into(
                    Rc::clone(&self.env),
                    child_ctx,
                    Rc::clone(&self.astate),
                    unit,
                    child_buf,
                    Rc::new(std::cell::RefCell::new(None)),
                )
                .await
            }
            StmtKind::Import {
                template,
                alias,
                with_context,
            } => {
                let exports = self
                    .collect_imports(stmt, template, *with_context, frame, targets)
                    .await;
                let result = exports.map(|map| Value::Map(Rc::new(map)));
                if let Some(gate) = targets.write_gate(alias) {
                    gate.fulfill(result.clone());
                }
                result.map(|_| ())
            }
            StmtKind::FromImport {
                template,
                names,
                with_context,
            } => {
                let exports = self
                    .collect_imports(stmt, template, *with_context, frame, targets)
                    .await;
                match exports {
                    Ok(map) => {
                        for (name, alias) in names {
                            let local = alias.as_deref().unwrap_or(name);
                            let value = map.get(name).cloned().map_or_else(
                                || {
                                    Err(PoisonError::new(
                                        RenderError::new(
                                            RenderErrorKind::Lookup,
                                            format!("template does not export {name:?}"),
                                        )
                                        .at(stmt.pos),
                                    ))
                                },
                                Ok,
                            );
                            if let Some(gate) = targets.write_gate(local) {
                                gate.fulfill(value);
                            }
                        }
                        Ok(())
                    }
                    Err(p) => Err(p),
                }
            }
            StmtKind::CallExtension { name, args, bodies } => {
                let ext = self.env.extension(name).ok_or_else(|| {
                    PoisonError::new(
                        RenderError::new(
                            RenderErrorKind::Runtime,
                            format!("unknown extension {name:?}"),
                        )
                        .at(stmt.pos),
                    )
                })?;
                let arg_futures: Vec<_> = args
                    .iter()
                    .map(|e| self.eval_expr(e, frame, targets))
                    .collect();
                let mut values = crate::runtime::resolve::resolve_all(arg_futures).await?;
                for body in bodies {
                    let body_frame = frame.push();
                    let body_buf = Buffer::new();
                    self.eval_body(body, &body_frame, targets, &body_buf).await?;
                    let rendered = body_buf.flatten_template(self.env.options().autoescape)?;
                    values.push(Value::Safe(rendered.into()));
                }
                let result = self
                    .invoke_callable(&ext, name, values, ValueMap::new(), stmt.pos)
                    .await;
                let failed = result.as_ref().err().cloned();
                buf.push(suppress_value(
                    result,
                    self.env.options().throw_on_undefined,
                    stmt.pos,
                ));
                failed.map_or(Ok(()), Err)
            }
        }
    }

    fn skip_body_effects(&self, body: &Body, targets: &Targets) {
        let ann = self.anns().body(body.id);
        targets.skip_branch(&ann.writes, &ann.locks);
    }

    #[allow(clippy::too_many_arguments)]
    async fn eval_command(
        &self,
        stmt: &Stmt,
        handler: &str,
        subpath: &[PathSeg],
        command: &str,
        args: &[crate::ast::Expr],
        frame: &Rc<Frame>,
        targets: &Targets,
        buf: &Rc<Buffer>,
    ) -> Result<(), PoisonError> {
        if self.unit.mode != Mode::Script {
            return Err(PoisonError::new(
                RenderError::new(
                    RenderErrorKind::Runtime,
                    "output commands are only available in scripts",
                )
                .at(stmt.pos),
            ));
        }

        let slot = buf.reserve();

        let mut seg_futures = Vec::new();
        for seg in subpath {
            if let PathSeg::Index(e) = seg {
                seg_futures.push(self.eval_expr(e, frame, targets));
            }
        }
        let arg_futures: Vec<_> = args
            .iter()
            .map(|e| self.eval_expr(e, frame, targets))
            .collect();

        let (seg_values, arg_values) = futures::join!(
            crate::runtime::resolve::resolve_all(seg_futures),
            crate::runtime::resolve::resolve_all(arg_futures),
        );
        let merged: Result<_, PoisonError> = match (seg_values, arg_values) {
            (Ok(s), Ok(a)) => Ok((s, a)),
            (Err(mut p), Err(q)) => {
                p.merge(q);
                Err(p)
            }
            (Err(p), Ok(_)) | (Ok(_), Err(p)) => Err(p),
        };
        let (seg_values, arg_values) = match merged {
            Ok(v) => v,
            Err(p) => {
                buf.set(slot, Slot::Failed(p.clone()));
                return Err(p);
            }
        };

        // Command records outlive the expression pipeline; hand the handler
        // materialized values, never unforced dict entries.
        let arg_futures: Vec<_> = arg_values
            .into_iter()
            .map(crate::runtime::resolve::resolve_object_properties)
            .collect();
        let arg_values = match crate::runtime::resolve::resolve_all(arg_futures).await {
            Ok(v) => v,
            Err(p) => {
                buf.set(slot, Slot::Failed(p.clone()));
                return Err(p);
            }
        };

        let mut resolved_path = Vec::with_capacity(subpath.len());
        let mut dynamic = seg_values.into_iter();
        for seg in subpath {
            match seg {
                PathSeg::Key(k) => resolved_path.push(PathValue::Key(k.as_str().into())),
                PathSeg::Index(e) => {
                    let v = dynamic.next().unwrap_or(Value::Undefined);
                    match v {
                        Value::Int(i) => resolved_path.push(PathValue::Index(i)),
                        Value::Str(s) | Value::Safe(s) => {
                            resolved_path.push(PathValue::Key(s));
                        }
                        other => {
                            let p = PoisonError::new(
                                RenderError::new(
                                    RenderErrorKind::Runtime,
                                    format!(
                                        "command path segment must be a key or index, got {}",
                                        other.type_name()
                                    ),
                                )
                                .at(e.pos),
                            );
                            buf.set(slot, Slot::Failed(p.clone()));
                            return Err(p);
                        }
                    }
                }
            }
        }

        buf.set(
            slot,
            Slot::Command(CommandRecord {
                handler: handler.into(),
                command: command.into(),
                subpath: resolved_path,
                args: arg_values,
                pos: stmt.pos,
            }),
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn eval_for(
        &self,
        stmt: &Stmt,
        loop_targets: &[String],
        iter: &crate::ast::Expr,
        body: &Body,
        alt: Option<&Body>,
        mode: LoopMode,
        concurrent_limit: Option<&crate::ast::Expr>,
        frame: &Rc<Frame>,
        targets: &Targets,
        buf: &Rc<Buffer>,
    ) -> Result<(), PoisonError> {
        let body_ann = self.anns().body(body.id);
        let sequential = match mode {
            LoopMode::Sequential => true,
            LoopMode::Parallel => false,
            // Body writes demand write-order; a loop nested in a sequential
            // body inherits the discipline.
            LoopMode::For => !body_ann.writes.is_empty() || frame.is_sequential_loop_body(),
        };

        let limit_result = match concurrent_limit {
            Some(e) => self
                .eval_expr(e, frame, targets)
                .await
                .and_then(|v| validate_limit(Some(v)).map_err(|err| PoisonError::new(err.at(e.pos)))),
            None => Ok(None),
        };
        let iter_result = self.eval_expr(iter, frame, targets).await.and_then(|v| {
            normalize(v, loop_targets.len()).map_err(|e| PoisonError::new(e.at(iter.pos)))
        });

        let (limit, iterable) = match (limit_result, iter_result) {
            (Ok(limit), Ok(iterable)) => (limit, iterable),
            (limit_result, iter_result) => {
                // Poisoned input: cancel the body's announced effects, still
                // run the else branch, and re-surface the poison.
                let mut poison = match (limit_result, iter_result) {
                    (Err(mut p), Err(q)) => {
                        p.merge(q);
                        p
                    }
                    (Err(p), _) | (_, Err(p)) => p,
                    _ => unreachable!("at least one side failed"),
                };
                self.cancel_loop_body(body_ann, targets);
                if let Some(alt) = alt {
                    if let Err(q) = self.eval_body(alt, frame, targets, buf).await {
                        poison.merge(q);
                    }
                }
                return Err(poison);
            }
        };

        if matches!(iterable, Iterable::Empty) {
            self.cancel_loop_body(body_ann, targets);
            if let Some(alt) = alt {
                return self.eval_body(alt, frame, targets, buf).await;
            }
            return Ok(());
        }
        if let Some(alt) = alt {
            self.skip_body_effects(alt, targets);
        }

        let loop_frame = frame.push();
        loop_frame.set_sequential_loop_body(sequential);
        for (name, _) in &body_ann.writes {
            if let Some(gate) = targets.write_gate(name) {
                loop_frame.bind(Rc::clone(name), gate.prev());
            }
        }

        trace!(target: TRACE_TARGET_RENDER, sequential, "loop start");
        let outcome = iterate::drive(iterable, sequential, limit, |i, item, len| {
            let iter_frame = loop_frame.push();
            // Stream items arrive undestructured; split them here.
            let values = if item.len() < loop_targets.len() {
                let first = item.into_iter().next().unwrap_or(Value::Undefined);
                destructure(first, loop_targets.len())
            } else {
                item
            };
            iter_frame.declare_value("loop", loop_object(i, len));
            let iter_targets = Targets::loop_iteration(targets, &body_ann.locks);
            let iter_buf = Buffer::new();
            buf.push(Slot::Nested(Rc::clone(&iter_buf)));
            let guard = self.astate.enter_async_block();
            async move {
                let result = async {
                    // Iterating a dict yields its entries; bind them forced.
                    for (slot, name) in loop_targets.iter().enumerate() {
                        let value = values.get(slot).cloned().unwrap_or(Value::Undefined);
                        let value = crate::runtime::resolve::resolve_lazy(value).await?;
                        iter_frame.declare_value(name.as_str(), value);
                    }
                    self.eval_body(body, &iter_frame, &iter_targets, &iter_buf).await
                }
                .await;
                drop(guard);
                result
            }
            .boxed_local()
        })
        .await;

        self.finalize_loop_writes(body_ann, targets, &loop_frame).await;
        outcome.error.map_or(Ok(()), Err)
    }

    async fn eval_while(
        &self,
        cond: &crate::ast::Expr,
        body: &Body,
        frame: &Rc<Frame>,
        targets: &Targets,
        buf: &Rc<Buffer>,
    ) -> Result<(), PoisonError> {
        let body_ann = self.anns().body(body.id);
        let loop_frame = frame.push();
        loop_frame.set_sequential_loop_body(true);
        for (name, _) in &body_ann.writes {
            if let Some(gate) = targets.write_gate(name) {
                loop_frame.bind(Rc::clone(name), gate.prev());
            }
        }

        let mut poison: Option<PoisonError> = None;
        let mut index = 0usize;
        loop {
            // The condition re-evaluates before every iteration, seeing the
            // writes of the previous one.
            let trap = loop_frame.push();
            match self.eval_expr(cond, &trap, targets).await {
                Err(p) => {
                    poison = Some(p);
                    break;
                }
                Ok(v) if !v.is_true() => break,
                Ok(_) => {}
            }

            let iter_frame = loop_frame.push();
            iter_frame.declare_value("loop", loop_object(index, None));
            let iter_targets = Targets::loop_iteration(targets, &body_ann.locks);
            let iter_buf = Buffer::new();
            buf.push(Slot::Nested(Rc::clone(&iter_buf)));
            let guard = self.astate.enter_async_block();
            let result = self.eval_body(body, &iter_frame, &iter_targets, &iter_buf).await;
            drop(guard);
            if let Err(p) = result {
                match &mut poison {
                    Some(acc) => acc.merge(p),
                    None => poison = Some(p),
                }
            }
            index += 1;
        }

        self.finalize_loop_writes(body_ann, targets, &loop_frame).await;
        poison.map_or(Ok(()), Err)
    }

    fn cancel_loop_body(&self, body_ann: &BodyAnn, targets: &Targets) {
        let writes: Vec<_> = body_ann
            .writes
            .iter()
            .map(|(n, _)| (Rc::clone(n), 1))
            .collect();
        let locks: Vec<_> = body_ann
            .locks
            .iter()
            .map(|(k, _)| (Rc::clone(k), 1))
            .collect();
        targets.skip_branch(&writes, &locks);
    }

    /// Outside the loop each body write is observed once: resolve the final
    /// shadow binding and release the loop-level gate with it.
    async fn finalize_loop_writes(
        &self,
        body_ann: &BodyAnn,
        targets: &Targets,
        loop_frame: &Rc<Frame>,
    ) {
        for (name, _) in &body_ann.writes {
            if let Some(gate) = targets.write_gate(name) {
                let binding = loop_frame
                    .lookup_binding(name)
                    .unwrap_or_else(crate::runtime::frame::Binding::undefined);
                let result = resolve_binding(binding).await;
                gate.fulfill(result);
            }
        }
        for (key, _) in &body_ann.locks {
            if let Some(gate) = targets.lock_aggregate(key) {
                let left = gate.pending();
                if left > 0 {
                    gate.skip(left);
                }
            }
        }
    }

    async fn collect_imports(
        &self,
        stmt: &Stmt,
        template: &crate::ast::Expr,
        with_context: bool,
        frame: &Rc<Frame>,
        targets: &Targets,
    ) -> Result<ValueMap, PoisonError> {
        let v = self.eval_expr(template, frame, targets).await?;
        let name = v.render();
        let unit = self
            .load_unit(&name, Mode::Template)
            .await
            .map_err(|e| PoisonError::new(e.at(stmt.pos)))?;
        let child_ctx = Rc::new(if with_context {
            self.context.fork()
        } else {
            Context::new()
        });
        let discard = Buffer::new();
        Self::run_unit_into(
            Rc::clone(&self.env),
            Rc::clone(&child_ctx),
            Rc::clone(&self.astate),
            unit,
            discard,
            Rc::new(std::cell::RefCell::new(None)),
        )
        .await?;
        Ok(child_ctx.exports())
    }

    async fn render_block_into(
        &self,
        name: &str,
        depth: usize,
        frame: &Rc<Frame>,
        targets: &Targets,
        buf: &Rc<Buffer>,
        fallback: &Rc<Body>,
    ) -> Result<(), PoisonError> {
        let entry = self
            .blocks
            .get(name)
            .and_then(|chain| chain.get(depth).cloned());
        let (body, unit) = entry.unwrap_or_else(|| (Rc::clone(fallback), Rc::clone(&self.unit)));
        let sub = self.with_unit(&unit).with_block(name.into(), depth);
        let block_frame = frame.push();
        sub.eval_body(&body, &block_frame, targets, buf).await
    }

    /// Render the next block up the inheritance chain; the value of
    /// `super()`.
    pub(crate) async fn render_super(&self) -> EvalResult {
        let Some((name, depth)) = &self.block_pos else {
            return Err(PoisonError::new(RenderError::new(
                RenderErrorKind::Runtime,
                "super() is only available inside a block",
            )));
        };
        let entry = self
            .blocks
            .get(name.as_ref())
            .and_then(|chain| chain.get(depth + 1).cloned());
        let Some((body, unit)) = entry else {
            return Err(PoisonError::new(RenderError::new(
                RenderErrorKind::Runtime,
                format!("block {name:?} has no parent block"),
            )));
        };
        let sub = self.with_unit(&unit).with_block(Rc::clone(name), depth + 1);
        let frame = Frame::root();
        let block_buf = Buffer::new();
        sub.eval_body(&body, &frame, &Targets::empty(), &block_buf).await?;
        let rendered = block_buf.flatten_template(self.env.options().autoescape)?;
        Ok(Value::Safe(rendered.into()))
    }

    /// Call a macro: marshal arguments into declaration order, bind them in
    /// a fresh scope over the macro's closure, render the body, and return
    /// the output as a safe string.
    pub(crate) async fn call_macro(
        &self,
        mv: &MacroValue,
        args: crate::value::Args,
        caller: Option<Value>,
    ) -> EvalResult {
        let bound = bind_macro_args(mv.name(), &mv.params, args).map_err(PoisonError::new)?;
        let frame = mv.closure.push();
        for (name, value) in bound.bindings {
            match value {
                Some(v) => frame.declare_value(name, v),
                None => {
                    let param = mv
                        .params
                        .iter()
                        .find(|p| p.name.as_str() == name.as_ref());
                    let v = match param.and_then(|p: &Param| p.default.as_ref()) {
                        Some(default) => {
                            let sub = self.with_unit(&mv.unit);
                            sub.eval_expr(default, &frame, &Targets::empty()).await?
                        }
                        None => Value::Undefined,
                    };
                    frame.declare_value(name, v);
                }
            }
        }
        let mut extra = bound.extra_kwargs;
        let caller_value = caller.or_else(|| extra.shift_remove("caller"));
        frame.declare_value("caller", caller_value.unwrap_or(Value::Undefined));
        frame.declare_value("varargs", Value::array(bound.varargs));
        frame.declare_value("kwargs", Value::Map(Rc::new(extra)));

        let body_buf = Buffer::new();
        let guard = self.astate.enter_async_block();
        let sub = self.with_unit(&mv.unit);
        let result = sub
            .eval_body(&mv.body, &frame, &Targets::empty(), &body_buf)
            .await;
        drop(guard);
        result?;
        let rendered = body_buf.flatten_template(self.env.options().autoescape)?;
        Ok(Value::Safe(rendered.into()))
    }
}

/// Template-mode entry: run the root contract and flatten to a string.
pub(crate) async fn run_template(
    env: Rc<EnvInner>,
    unit: Rc<CompiledUnit>,
    context: Rc<Context>,
) -> Result<String, PoisonError> {
    let astate = AsyncState::new_root();
    let buf = Buffer::new();
    let focus = Rc::new(std::cell::RefCell::new(None));
    let result = Evaluator::run_unit_into(
        Rc::clone(&env),
        context,
        Rc::clone(&astate),
        unit,
        Rc::clone(&buf),
        focus,
    )
    .await;
    astate.wait_all_closures(0).await;

    let flattened = buf.flatten_template(env.options().autoescape);
    match (result, flattened) {
        (Ok(()), Ok(out)) => Ok(out),
        (Err(mut p), Err(q)) => {
            p.merge(q);
            Err(p)
        }
        (Err(p), Ok(_)) | (Ok(()), Err(p)) => Err(p),
    }
}

/// Script-mode entry: run, then assemble commands into the script output.
pub(crate) async fn run_script(
    env: Rc<EnvInner>,
    unit: Rc<CompiledUnit>,
    context: Rc<Context>,
) -> Result<ScriptOutput, PoisonError> {
    let astate = AsyncState::new_root();
    let buf = Buffer::new();
    let focus = Rc::new(std::cell::RefCell::new(None));
    let result = Evaluator::run_unit_into(
        Rc::clone(&env),
        context,
        Rc::clone(&astate),
        unit,
        Rc::clone(&buf),
        Rc::clone(&focus),
    )
    .await;
    astate.wait_all_closures(0).await;
    result?;

    let focus = focus.borrow_mut().take();
    env.with_script_registries(|data_methods, handlers| {
        buf.flatten_script(&ScriptAssembly {
            data_methods,
            handlers,
            focus,
        })
    })
}
