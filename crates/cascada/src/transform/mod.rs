//! AST annotation: the two-pass walk that marks suspension points, collects
//! per-statement read/write accounting, and extracts static sequence-lock
//! paths from `!` markers.
//!
//! Results live in side tables indexed by node id, leaving the parsed tree
//! shareable. A template-wide pre-scan gathers write names (so reads of
//! possibly-pending variables annotate as suspendable) and marked paths (so
//! every operation on a marked path, marked or not, participates in its
//! ordered chain).

use std::collections::HashSet;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use crate::ast::{Body, Expr, ExprKind, IdGen, PathSeg, Stmt, StmtKind, VarType};
use crate::error::{CompileError, Pos};

#[derive(Default, Debug)]
pub(crate) struct StmtAnn {
    pub is_async: bool,
    /// Outer-scope names the statement's subtree reads; snapshotted into its
    /// async-block frame at entry.
    pub reads: Vec<Rc<str>>,
    /// Writes the enclosing block announces at the statement's entry.
    pub writes: Vec<(Rc<str>, usize)>,
    /// Sequence ops the enclosing block announces at the statement's entry.
    pub locks: Vec<(Rc<str>, usize)>,
    /// Names the statement declares in the enclosing scope.
    pub declares: Vec<Rc<str>>,
}

#[derive(Default, Debug)]
pub(crate) struct ExprAnn {
    pub is_async: bool,
    /// Wrap evaluation so failures carry this node's position.
    pub wrap_async: bool,
    /// Set when this node is itself a sequenced operation.
    pub lock_key: Option<Rc<str>>,
}

#[derive(Default, Debug)]
pub(crate) struct BodyAnn {
    pub is_async: bool,
    pub reads: Vec<Rc<str>>,
    pub writes: Vec<(Rc<str>, usize)>,
    pub locks: Vec<(Rc<str>, usize)>,
}

#[derive(Debug)]
pub(crate) struct Annotations {
    stmts: Vec<StmtAnn>,
    exprs: Vec<ExprAnn>,
    bodies: Vec<BodyAnn>,
}

impl Annotations {
    pub fn stmt(&self, id: u32) -> &StmtAnn {
        &self.stmts[id as usize]
    }

    pub fn expr(&self, id: u32) -> &ExprAnn {
        &self.exprs[id as usize]
    }

    pub fn body(&self, id: u32) -> &BodyAnn {
        &self.bodies[id as usize]
    }
}

/// What the environment knows at compile time: which filters and tests are
/// registered as synchronous.
#[derive(Default)]
pub(crate) struct CompileHints {
    pub sync_filters: HashSet<String>,
    pub sync_tests: HashSet<String>,
}

#[derive(Default, Clone)]
struct Usage {
    is_async: bool,
    reads: IndexSet<Rc<str>>,
    writes: IndexMap<Rc<str>, usize>,
    locks: IndexMap<Rc<str>, usize>,
}

impl Usage {
    fn absorb(&mut self, other: Self) {
        self.is_async |= other.is_async;
        self.reads.extend(other.reads);
        for (name, count) in other.writes {
            *self.writes.entry(name).or_insert(0) += count;
        }
        for (key, count) in other.locks {
            *self.locks.entry(key).or_insert(0) += count;
        }
    }
}

pub(crate) fn annotate(
    body: &Body,
    ids: &IdGen,
    hints: &CompileHints,
) -> Result<Annotations, CompileError> {
    let (n_stmts, n_exprs, n_bodies) = ids.counts();
    let mut annotator = Annotator {
        anns: Annotations {
            stmts: (0..n_stmts).map(|_| StmtAnn::default()).collect(),
            exprs: (0..n_exprs).map(|_| ExprAnn::default()).collect(),
            bodies: (0..n_bodies).map(|_| BodyAnn::default()).collect(),
        },
        scopes: vec![HashSet::new()],
        pending: Vec::new(),
        keys: Vec::new(),
        hints,
    };
    collect_marked_keys(body, &mut annotator.keys)?;
    annotator.walk_body(body, None)?;
    Ok(annotator.anns)
}

struct Annotator<'h> {
    anns: Annotations,
    /// Declared names, innermost scope last.
    scopes: Vec<HashSet<Rc<str>>>,
    /// Names written anywhere in each enclosing body; reads of these may
    /// suspend on a write gate.
    pending: Vec<HashSet<String>>,
    /// Marked sequence paths: `(static path, "!a!b" key)`.
    keys: Vec<(Vec<String>, Rc<str>)>,
    hints: &'h CompileHints,
}

impl Annotator<'_> {
    fn is_declared(&self, name: &str) -> bool {
        self.scopes.iter().any(|s| s.contains(name))
    }

    fn declare(&mut self, name: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(Rc::from(name));
        }
    }

    fn may_be_pending(&self, name: &str) -> bool {
        self.pending.iter().any(|s| s.contains(name))
    }

    /// Longest marked key whose path prefixes `path`.
    fn match_key(&self, path: &[&str]) -> Option<Rc<str>> {
        self.keys
            .iter()
            .filter(|(key_path, _)| {
                key_path.len() <= path.len()
                    && key_path.iter().zip(path).all(|(a, b)| a == b)
            })
            .max_by_key(|(key_path, _)| key_path.len())
            .map(|(_, key)| Rc::clone(key))
    }

    fn sequence_op(
        &self,
        path: &[&str],
        pos: Pos,
    ) -> Result<Option<Rc<str>>, CompileError> {
        let Some(key) = self.match_key(path) else {
            return Ok(None);
        };
        if self.is_declared(path[0]) {
            return Err(CompileError::new(
                format!(
                    "sequence marker path {:?} starts at a locally-declared variable",
                    path[0]
                ),
                pos,
            ));
        }
        Ok(Some(key))
    }

    fn walk_body(
        &mut self,
        body: &Body,
        new_scope: Option<Vec<Rc<str>>>,
    ) -> Result<Usage, CompileError> {
        let own_scope = new_scope.is_some();
        if let Some(names) = new_scope {
            self.scopes.push(names.into_iter().collect());
        }
        let mut written = HashSet::new();
        collect_write_names(body, &mut written);
        self.pending.push(written);

        let mut usage = Usage::default();
        for stmt in &body.stmts {
            let stmt_usage = self.walk_stmt(stmt)?;
            let ann = &mut self.anns.stmts[stmt.id as usize];
            ann.is_async = stmt_usage.is_async;
            ann.reads = stmt_usage.reads.iter().cloned().collect();
            ann.writes = stmt_usage
                .writes
                .iter()
                .map(|(k, v)| (Rc::clone(k), *v))
                .collect();
            ann.locks = stmt_usage
                .locks
                .iter()
                .map(|(k, v)| (Rc::clone(k), *v))
                .collect();
            usage.absorb(stmt_usage);
        }

        self.pending.pop();
        if own_scope {
            let scope = self.scopes.pop().unwrap_or_default();
            usage.reads.retain(|name| !scope.contains(name));
            usage.writes.retain(|name, _| !scope.contains(name));
        }

        let ann = &mut self.anns.bodies[body.id as usize];
        ann.is_async = usage.is_async;
        ann.reads = usage.reads.iter().cloned().collect();
        ann.writes = usage.writes.iter().map(|(k, v)| (Rc::clone(k), *v)).collect();
        ann.locks = usage.locks.iter().map(|(k, v)| (Rc::clone(k), *v)).collect();
        Ok(usage)
    }

    #[allow(clippy::too_many_lines)]
    fn walk_stmt(&mut self, stmt: &Stmt) -> Result<Usage, CompileError> {
        let mut usage = Usage::default();
        match &stmt.kind {
            StmtKind::Text(_) => {}
            StmtKind::Output(expr) => {
                usage.absorb(self.walk_expr(expr, false)?);
            }
            StmtKind::OutputCommand { subpath, args, .. } => {
                for seg in subpath {
                    if let PathSeg::Index(expr) = seg {
                        usage.absorb(self.walk_expr(expr, false)?);
                    }
                }
                for arg in args {
                    usage.absorb(self.walk_expr(arg, false)?);
                }
            }
            StmtKind::Option { value, .. } => {
                usage.absorb(self.walk_expr(value, false)?);
            }
            StmtKind::If { arms, alt } => {
                for (cond, branch) in arms {
                    usage.absorb(self.walk_expr(cond, false)?);
                    usage.absorb(self.walk_body(branch, None)?);
                }
                if let Some(alt) = alt {
                    usage.absorb(self.walk_body(alt, None)?);
                }
            }
            StmtKind::Switch {
                subject,
                cases,
                default,
            } => {
                usage.absorb(self.walk_expr(subject, false)?);
                for (matches, branch) in cases {
                    for m in matches {
                        usage.absorb(self.walk_expr(m, false)?);
                    }
                    usage.absorb(self.walk_body(branch, None)?);
                }
                if let Some(default) = default {
                    usage.absorb(self.walk_body(default, None)?);
                }
            }
            StmtKind::For {
                targets,
                iter,
                body,
                alt,
                concurrent_limit,
                ..
            } => {
                usage.absorb(self.walk_expr(iter, false)?);
                if let Some(limit) = concurrent_limit {
                    usage.absorb(self.walk_expr(limit, false)?);
                }
                let mut scope: Vec<Rc<str>> =
                    targets.iter().map(|t| Rc::from(t.as_str())).collect();
                scope.push(Rc::from("loop"));
                let body_usage = self.walk_body(body, Some(scope))?;
                usage.is_async = true;
                usage.reads.extend(body_usage.reads);
                // Outside the loop each body write is observed once.
                for (name, _) in body_usage.writes {
                    *usage.writes.entry(name).or_insert(0) += 1;
                }
                for (key, _) in body_usage.locks {
                    *usage.locks.entry(key).or_insert(0) += 1;
                }
                if let Some(alt) = alt {
                    usage.absorb(self.walk_body(alt, None)?);
                }
            }
            StmtKind::While { cond, body } => {
                usage.absorb(self.walk_expr(cond, false)?);
                let body_usage = self.walk_body(body, Some(vec![Rc::from("loop")]))?;
                usage.is_async = true;
                usage.reads.extend(body_usage.reads);
                for (name, _) in body_usage.writes {
                    *usage.writes.entry(name).or_insert(0) += 1;
                }
                for (key, _) in body_usage.locks {
                    *usage.locks.entry(key).or_insert(0) += 1;
                }
            }
            StmtKind::Set {
                targets,
                value,
                body,
                var_type,
            } => {
                if let Some(value) = value {
                    usage.absorb(self.walk_expr(value, false)?);
                }
                if let Some(body) = body {
                    usage.absorb(self.walk_body(body, Some(Vec::new()))?);
                }
                for target in targets {
                    self.declare_target(stmt, target, *var_type)?;
                    *usage.writes.entry(Rc::from(target.as_str())).or_insert(0) += 1;
                }
            }
            StmtKind::Do(exprs) => {
                for expr in exprs {
                    usage.absorb(self.walk_expr(expr, false)?);
                }
            }
            StmtKind::Macro { name, params, body } => {
                if !self.is_declared(name) {
                    self.declare(name);
                    self.anns.stmts[stmt.id as usize]
                        .declares
                        .push(Rc::from(name.as_str()));
                }
                *usage.writes.entry(Rc::from(name.as_str())).or_insert(0) += 1;

                let mut scope: Vec<Rc<str>> =
                    params.iter().map(|p| Rc::from(p.name.as_str())).collect();
                scope.extend(["varargs".into(), "kwargs".into(), "caller".into()]);
                self.scopes.push(scope.iter().cloned().collect());
                for param in params.iter() {
                    if let Some(default) = &param.default {
                        self.walk_expr(default, false)?;
                    }
                }
                self.scopes.pop();
                // The body runs at call time; annotate it without leaking
                // its usage into the declaration site.
                self.walk_body(body, Some(scope))?;
            }
            StmtKind::CallBlock { call, params, body } => {
                usage.absorb(self.walk_expr(call, false)?);
                let mut scope: Vec<Rc<str>> =
                    params.iter().map(|p| Rc::from(p.name.as_str())).collect();
                scope.extend(["varargs".into(), "kwargs".into(), "caller".into()]);
                usage.absorb(self.walk_body(body, Some(scope))?);
                usage.is_async = true;
            }
            StmtKind::Block { body, .. } => {
                usage.absorb(self.walk_body(body, Some(Vec::new()))?);
                usage.is_async = true;
            }
            StmtKind::Extends(template) | StmtKind::Include { template } => {
                usage.absorb(self.walk_expr(template, false)?);
                usage.is_async = true;
            }
            StmtKind::Import {
                template, alias, ..
            } => {
                usage.absorb(self.walk_expr(template, false)?);
                if !self.is_declared(alias) {
                    self.declare(alias);
                    self.anns.stmts[stmt.id as usize]
                        .declares
                        .push(Rc::from(alias.as_str()));
                }
                *usage.writes.entry(Rc::from(alias.as_str())).or_insert(0) += 1;
                usage.is_async = true;
            }
            StmtKind::FromImport {
                template, names, ..
            } => {
                usage.absorb(self.walk_expr(template, false)?);
                for (name, alias) in names {
                    let local = alias.as_deref().unwrap_or(name);
                    if !self.is_declared(local) {
                        self.declare(local);
                        self.anns.stmts[stmt.id as usize]
                            .declares
                            .push(Rc::from(local));
                    }
                    *usage.writes.entry(Rc::from(local)).or_insert(0) += 1;
                }
                usage.is_async = true;
            }
            StmtKind::CallExtension { args, bodies, .. } => {
                for arg in args {
                    usage.absorb(self.walk_expr(arg, false)?);
                }
                for body in bodies {
                    usage.absorb(self.walk_body(body, Some(Vec::new()))?);
                }
                usage.is_async = true;
            }
        }
        Ok(usage)
    }

    fn declare_target(
        &mut self,
        stmt: &Stmt,
        target: &str,
        var_type: VarType,
    ) -> Result<(), CompileError> {
        let declared = self.is_declared(target);
        match var_type {
            VarType::Auto => {
                if !declared {
                    self.declare(target);
                    self.anns.stmts[stmt.id as usize].declares.push(Rc::from(target));
                }
            }
            VarType::Declaration => {
                if declared {
                    return Err(CompileError::new(
                        format!("variable {target:?} is already declared"),
                        stmt.pos,
                    ));
                }
                self.declare(target);
                self.anns.stmts[stmt.id as usize].declares.push(Rc::from(target));
            }
            VarType::Assignment => {
                if !declared {
                    return Err(CompileError::new(
                        format!("assignment to undeclared variable {target:?}"),
                        stmt.pos,
                    ));
                }
            }
            VarType::Extern => {
                if declared {
                    return Err(CompileError::new(
                        format!("extern {target:?} conflicts with an existing declaration"),
                        stmt.pos,
                    ));
                }
                self.declare(target);
                self.anns.stmts[stmt.id as usize].declares.push(Rc::from(target));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn walk_expr(&mut self, expr: &Expr, in_path: bool) -> Result<Usage, CompileError> {
        let mut usage = Usage::default();
        let mut lock_key = None;
        let mut wrap_async = false;

        match &expr.kind {
            ExprKind::Literal(_) => {}
            ExprKind::Symbol { name, marked } => {
                if *marked && self.is_declared(name) {
                    return Err(CompileError::new(
                        format!("sequence marker on locally-declared variable {name:?}"),
                        expr.pos,
                    ));
                }
                usage.reads.insert(Rc::from(name.as_str()));
                usage.is_async = self.may_be_pending(name);
                if !in_path {
                    if let Some(key) = self.sequence_op(&[name.as_str()], expr.pos)? {
                        *usage.locks.entry(Rc::clone(&key)).or_insert(0) += 1;
                        lock_key = Some(key);
                        usage.is_async = true;
                    }
                }
            }
            ExprKind::Group(items) | ExprKind::Array(items) => {
                for item in items {
                    usage.absorb(self.walk_expr(item, false)?);
                }
            }
            ExprKind::Dict(entries) => {
                for (key, value) in entries {
                    usage.absorb(self.walk_expr(key, false)?);
                    usage.absorb(self.walk_expr(value, false)?);
                }
            }
            ExprKind::Lookup { obj, key, marked } => {
                usage.absorb(self.walk_expr(obj, true)?);
                usage.absorb(self.walk_expr(key, false)?);
                if *marked && expr.static_path().is_none() {
                    return Err(CompileError::new(
                        "sequence marker requires a static path",
                        expr.pos,
                    ));
                }
                if !in_path {
                    if let Some(path) = expr.static_path() {
                        if let Some(key) = self.sequence_op(&path, expr.pos)? {
                            *usage.locks.entry(Rc::clone(&key)).or_insert(0) += 1;
                            lock_key = Some(key);
                            usage.is_async = true;
                        }
                    }
                }
            }
            ExprKind::FunCall {
                callee,
                args,
                kwargs,
            } => {
                usage.absorb(self.walk_expr(callee, true)?);
                for arg in args {
                    usage.absorb(self.walk_expr(arg, false)?);
                }
                for (_, arg) in kwargs {
                    usage.absorb(self.walk_expr(arg, false)?);
                }
                if let Some(path) = callee.static_path() {
                    if let Some(key) = self.sequence_op(&path, expr.pos)? {
                        *usage.locks.entry(Rc::clone(&key)).or_insert(0) += 1;
                        lock_key = Some(key);
                    }
                }
                usage.is_async = true;
                wrap_async = true;
            }
            ExprKind::Filter { name, args, kwargs } => {
                for arg in args {
                    usage.absorb(self.walk_expr(arg, false)?);
                }
                for (_, arg) in kwargs {
                    usage.absorb(self.walk_expr(arg, false)?);
                }
                if !self.hints.sync_filters.contains(name) {
                    usage.is_async = true;
                }
                wrap_async = usage.is_async;
            }
            ExprKind::Test { expr: inner, name, args, .. } => {
                usage.absorb(self.walk_expr(inner, false)?);
                for arg in args {
                    usage.absorb(self.walk_expr(arg, false)?);
                }
                if !self.hints.sync_tests.contains(name) {
                    usage.is_async = true;
                }
                wrap_async = usage.is_async;
            }
            ExprKind::Compare { left, ops } => {
                usage.absorb(self.walk_expr(left, false)?);
                for (_, right) in ops {
                    usage.absorb(self.walk_expr(right, false)?);
                }
            }
            ExprKind::In { left, right, .. } => {
                usage.absorb(self.walk_expr(left, false)?);
                usage.absorb(self.walk_expr(right, false)?);
            }
            ExprKind::InlineIf {
                cond,
                then,
                otherwise,
            } => {
                usage.absorb(self.walk_expr(cond, false)?);
                usage.absorb(self.walk_expr(then, false)?);
                if let Some(otherwise) = otherwise {
                    usage.absorb(self.walk_expr(otherwise, false)?);
                }
            }
            ExprKind::And(l, r) | ExprKind::Or(l, r) => {
                usage.absorb(self.walk_expr(l, false)?);
                usage.absorb(self.walk_expr(r, false)?);
            }
            ExprKind::Not(inner) | ExprKind::Neg(inner) | ExprKind::Pos(inner) => {
                usage.absorb(self.walk_expr(inner, false)?);
            }
            ExprKind::BinOp { left, right, .. } => {
                usage.absorb(self.walk_expr(left, false)?);
                usage.absorb(self.walk_expr(right, false)?);
            }
        }

        let ann = &mut self.anns.exprs[expr.id as usize];
        ann.is_async = usage.is_async;
        ann.wrap_async = wrap_async;
        ann.lock_key = lock_key;
        Ok(usage)
    }
}

/// Names any `set`-family statement in (or under) this body writes.
fn collect_write_names(body: &Body, out: &mut HashSet<String>) {
    for stmt in &body.stmts {
        match &stmt.kind {
            StmtKind::Set { targets, body, .. } => {
                out.extend(targets.iter().cloned());
                if let Some(body) = body {
                    collect_write_names(body, out);
                }
            }
            StmtKind::Import { alias, .. } => {
                out.insert(alias.clone());
            }
            StmtKind::FromImport { names, .. } => {
                for (name, alias) in names {
                    out.insert(alias.clone().unwrap_or_else(|| name.clone()));
                }
            }
            StmtKind::Macro { name, body, .. } => {
                out.insert(name.clone());
                collect_write_names(body, out);
            }
            StmtKind::If { arms, alt } => {
                for (_, branch) in arms {
                    collect_write_names(branch, out);
                }
                if let Some(alt) = alt {
                    collect_write_names(alt, out);
                }
            }
            StmtKind::Switch { cases, default, .. } => {
                for (_, branch) in cases {
                    collect_write_names(branch, out);
                }
                if let Some(default) = default {
                    collect_write_names(default, out);
                }
            }
            StmtKind::For { body, alt, .. } => {
                collect_write_names(body, out);
                if let Some(alt) = alt {
                    collect_write_names(alt, out);
                }
            }
            StmtKind::While { body, .. } => collect_write_names(body, out),
            StmtKind::CallBlock { body, .. } | StmtKind::Block { body, .. } => {
                collect_write_names(body, out);
            }
            StmtKind::CallExtension { bodies, .. } => {
                for body in bodies {
                    collect_write_names(body, out);
                }
            }
            _ => {}
        }
    }
}

/// Template-wide scan for `!` markers; rejects markers on computed paths.
fn collect_marked_keys(
    body: &Body,
    keys: &mut Vec<(Vec<String>, Rc<str>)>,
) -> Result<(), CompileError> {
    fn visit_expr(
        expr: &Expr,
        keys: &mut Vec<(Vec<String>, Rc<str>)>,
    ) -> Result<(), CompileError> {
        let marked = match &expr.kind {
            ExprKind::Symbol { marked, .. } | ExprKind::Lookup { marked, .. } => *marked,
            _ => false,
        };
        if marked {
            let Some(path) = expr.static_path() else {
                return Err(CompileError::new(
                    "sequence marker requires a static path",
                    expr.pos,
                ));
            };
            let key: Rc<str> = format!("!{}", path.join("!")).into();
            let path: Vec<String> = path.iter().map(ToString::to_string).collect();
            if !keys.iter().any(|(_, k)| *k == key) {
                keys.push((path, key));
            }
        }
        visit_children(expr, keys)
    }

    fn visit_children(
        expr: &Expr,
        keys: &mut Vec<(Vec<String>, Rc<str>)>,
    ) -> Result<(), CompileError> {
        match &expr.kind {
            ExprKind::Literal(_) | ExprKind::Symbol { .. } => Ok(()),
            ExprKind::Group(items) | ExprKind::Array(items) => {
                items.iter().try_for_each(|e| visit_expr(e, keys))
            }
            ExprKind::Dict(entries) => entries.iter().try_for_each(|(k, v)| {
                visit_expr(k, keys)?;
                visit_expr(v, keys)
            }),
            ExprKind::Lookup { obj, key, .. } => {
                visit_expr(obj, keys)?;
                visit_expr(key, keys)
            }
            ExprKind::FunCall {
                callee,
                args,
                kwargs,
            } => {
                visit_expr(callee, keys)?;
                args.iter().try_for_each(|e| visit_expr(e, keys))?;
                kwargs.iter().try_for_each(|(_, e)| visit_expr(e, keys))
            }
            ExprKind::Filter { args, kwargs, .. } => {
                args.iter().try_for_each(|e| visit_expr(e, keys))?;
                kwargs.iter().try_for_each(|(_, e)| visit_expr(e, keys))
            }
            ExprKind::Test {
                expr: inner, args, ..
            } => {
                visit_expr(inner, keys)?;
                args.iter().try_for_each(|e| visit_expr(e, keys))
            }
            ExprKind::Compare { left, ops } => {
                visit_expr(left, keys)?;
                ops.iter().try_for_each(|(_, e)| visit_expr(e, keys))
            }
            ExprKind::In { left, right, .. } => {
                visit_expr(left, keys)?;
                visit_expr(right, keys)
            }
            ExprKind::InlineIf {
                cond,
                then,
                otherwise,
            } => {
                visit_expr(cond, keys)?;
                visit_expr(then, keys)?;
                otherwise.as_ref().map_or(Ok(()), |e| visit_expr(e, keys))
            }
            ExprKind::And(l, r) | ExprKind::Or(l, r) | ExprKind::BinOp { left: l, right: r, .. } => {
                visit_expr(l, keys)?;
                visit_expr(r, keys)
            }
            ExprKind::Not(inner) | ExprKind::Neg(inner) | ExprKind::Pos(inner) => {
                visit_expr(inner, keys)
            }
        }
    }

    fn visit_stmt(stmt: &Stmt, keys: &mut Vec<(Vec<String>, Rc<str>)>) -> Result<(), CompileError> {
        match &stmt.kind {
            StmtKind::Text(_) => Ok(()),
            StmtKind::Output(e) | StmtKind::Option { value: e, .. } | StmtKind::Extends(e) => {
                visit_expr(e, keys)
            }
            StmtKind::OutputCommand { subpath, args, .. } => {
                for seg in subpath {
                    if let PathSeg::Index(e) = seg {
                        visit_expr(e, keys)?;
                    }
                }
                args.iter().try_for_each(|e| visit_expr(e, keys))
            }
            StmtKind::If { arms, alt } => {
                for (cond, branch) in arms {
                    visit_expr(cond, keys)?;
                    collect_marked_keys(branch, keys)?;
                }
                alt.as_ref().map_or(Ok(()), |b| collect_marked_keys(b, keys))
            }
            StmtKind::Switch {
                subject,
                cases,
                default,
            } => {
                visit_expr(subject, keys)?;
                for (matches, branch) in cases {
                    matches.iter().try_for_each(|e| visit_expr(e, keys))?;
                    collect_marked_keys(branch, keys)?;
                }
                default.as_ref().map_or(Ok(()), |b| collect_marked_keys(b, keys))
            }
            StmtKind::For {
                iter,
                body,
                alt,
                concurrent_limit,
                ..
            } => {
                visit_expr(iter, keys)?;
                if let Some(limit) = concurrent_limit {
                    visit_expr(limit, keys)?;
                }
                collect_marked_keys(body, keys)?;
                alt.as_ref().map_or(Ok(()), |b| collect_marked_keys(b, keys))
            }
            StmtKind::While { cond, body } => {
                visit_expr(cond, keys)?;
                collect_marked_keys(body, keys)
            }
            StmtKind::Set { value, body, .. } => {
                if let Some(value) = value {
                    visit_expr(value, keys)?;
                }
                body.as_ref().map_or(Ok(()), |b| collect_marked_keys(b, keys))
            }
            StmtKind::Do(exprs) => exprs.iter().try_for_each(|e| visit_expr(e, keys)),
            StmtKind::Macro { params, body, .. } => {
                for p in params.iter() {
                    if let Some(d) = &p.default {
                        visit_expr(d, keys)?;
                    }
                }
                collect_marked_keys(body, keys)
            }
            StmtKind::CallBlock { call, body, .. } => {
                visit_expr(call, keys)?;
                collect_marked_keys(body, keys)
            }
            StmtKind::Block { body, .. } => collect_marked_keys(body, keys),
            StmtKind::Include { template } => visit_expr(template, keys),
            StmtKind::Import { template, .. } | StmtKind::FromImport { template, .. } => {
                visit_expr(template, keys)
            }
            StmtKind::CallExtension { args, bodies, .. } => {
                args.iter().try_for_each(|e| visit_expr(e, keys))?;
                bodies
                    .iter()
                    .try_for_each(|b| collect_marked_keys(b, keys))
            }
        }
    }

    body.stmts.iter().try_for_each(|s| visit_stmt(s, keys))
}

#[cfg(test)]
mod tests {
    use super::{annotate, CompileHints};
    use crate::ast::StmtKind;
    use crate::parse::{ScriptParser, SyntaxConfig, TemplateParser};

    fn annotate_template(src: &str) -> (crate::ast::Body, super::Annotations) {
        let (body, ids) = TemplateParser::parse(src, &SyntaxConfig::default()).expect("parse");
        let anns = annotate(&body, &ids, &CompileHints::default()).expect("annotate");
        (body, anns)
    }

    #[test]
    fn writes_sum_across_branches() {
        let (body, anns) = annotate_template(
            "{% if c %}{% set x = a() %}{% else %}{% set x = b() %}{% endif %}{{ x }}",
        );
        let if_ann = anns.stmt(body.stmts[0].id);
        assert_eq!(if_ann.writes, vec![(std::rc::Rc::from("x"), 2)]);
        let out_ann = anns.stmt(body.stmts[1].id);
        assert!(out_ann.reads.iter().any(|r| r.as_ref() == "x"));
        assert!(out_ann.is_async, "read of a written name may suspend");
    }

    #[test]
    fn loop_writes_cap_to_one_outside() {
        let (body, anns) = annotate_template(
            "{% set x = 0 %}{% for i in items %}{% set x = x + i %}{% endfor %}",
        );
        let for_ann = anns.stmt(body.stmts[1].id);
        assert_eq!(for_ann.writes, vec![(std::rc::Rc::from("x"), 1)]);
    }

    #[test]
    fn marked_paths_sequence_unmarked_reads_too() {
        let (body, anns) = annotate_template(
            "{% do state!.inc() %}{% do state!.inc() %}{{ state.n }}",
        );
        let key: std::rc::Rc<str> = "!state".into();
        assert_eq!(anns.stmt(body.stmts[0].id).locks, vec![(key.clone(), 1)]);
        let read_ann = anns.stmt(body.stmts[2].id);
        assert_eq!(read_ann.locks, vec![(key, 1)]);
    }

    #[test]
    fn marker_on_local_variable_is_rejected() {
        let (body, ids) = TemplateParser::parse(
            "{% set s = 1 %}{% do s!.op() %}",
            &SyntaxConfig::default(),
        )
        .expect("parse");
        let err = annotate(&body, &ids, &CompileHints::default()).expect_err("reject");
        assert!(err.message.contains("locally-declared"));
    }

    #[test]
    fn script_declaration_conflicts_are_compile_errors() {
        let (body, ids) = ScriptParser::parse("var x = 1\nvar x = 2").expect("parse");
        let err = annotate(&body, &ids, &CompileHints::default()).expect_err("reject");
        assert!(err.message.contains("already declared"));

        let (body, ids) = ScriptParser::parse("y = 1").expect("parse");
        let err = annotate(&body, &ids, &CompileHints::default()).expect_err("reject");
        assert!(err.message.contains("undeclared"));
    }

    #[test]
    fn sync_filters_stay_sync() {
        let mut hints = CompileHints::default();
        hints.sync_filters.insert("upper".to_string());
        let (body, ids) =
            TemplateParser::parse("{{ name | upper }}", &SyntaxConfig::default()).expect("parse");
        let anns = annotate(&body, &ids, &hints).expect("annotate");
        let StmtKind::Output(expr) = &body.stmts[0].kind else {
            panic!("expected output");
        };
        assert!(!anns.expr(expr.id).is_async);
    }
}
