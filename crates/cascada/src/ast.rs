//! The node kinds the async core consumes.
//!
//! The tree is immutable after parsing; the annotation pass stores its
//! results in side tables indexed by the dense per-kind node ids, so shared
//! subtrees (macro and block bodies) can be captured by reference-counted
//! pointer without any rebuilding.

use std::rc::Rc;

pub use crate::error::Pos;

pub type NodeId = u32;

/// Dense id source, one counter per node kind.
#[derive(Default)]
pub struct IdGen {
    stmts: NodeId,
    exprs: NodeId,
    bodies: NodeId,
}

impl IdGen {
    pub fn stmt(&mut self) -> NodeId {
        let id = self.stmts;
        self.stmts += 1;
        id
    }

    pub fn expr(&mut self) -> NodeId {
        let id = self.exprs;
        self.exprs += 1;
        id
    }

    pub fn body(&mut self) -> NodeId {
        let id = self.bodies;
        self.bodies += 1;
        id
    }

    #[must_use]
    pub const fn counts(&self) -> (usize, usize, usize) {
        (self.stmts as usize, self.exprs as usize, self.bodies as usize)
    }
}

/// A statement list sharing one lexical scope.
#[derive(Debug)]
pub struct Body {
    pub id: NodeId,
    pub stmts: Vec<Stmt>,
}

#[derive(Debug)]
pub struct Expr {
    pub id: NodeId,
    pub pos: Pos,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    /// `~` string concatenation.
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug)]
pub enum ExprKind {
    Literal(LiteralValue),
    Symbol {
        name: String,
        /// `name!` — this segment roots an ordered sequence path.
        marked: bool,
    },
    /// Parenthesized tuple; a single element is plain grouping.
    Group(Vec<Expr>),
    Array(Vec<Expr>),
    /// Values sit behind `Rc` so the runtime can capture them in the lazy
    /// per-entry resolvers dict construction attaches.
    Dict(Vec<(Expr, Rc<Expr>)>),
    Lookup {
        obj: Box<Expr>,
        key: Box<Expr>,
        /// `obj.key!` — the path up to and including `key` is the ordered
        /// sequence root.
        marked: bool,
    },
    FunCall {
        callee: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Filter {
        name: String,
        /// First element is the piped value.
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Test {
        expr: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        negated: bool,
    },
    Compare {
        left: Box<Expr>,
        ops: Vec<(CmpOp, Expr)>,
    },
    In {
        left: Box<Expr>,
        right: Box<Expr>,
        negated: bool,
    },
    InlineIf {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Neg(Box<Expr>),
    Pos(Box<Expr>),
}

/// How a `set`-family statement binds its names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    /// Template `set`: assign where declared, else declare here.
    Auto,
    /// Script `var`: declaration; redeclaring is an error.
    Declaration,
    /// Script `=`: assignment; the name must already exist.
    Assignment,
    /// Script `extern`: declaration without a value.
    Extern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// `for`: parallel when the body is independent, sequential when the
    /// body writes outer variables.
    For,
    /// `asyncEach`: explicitly sequential.
    Sequential,
    /// `asyncAll`: explicitly parallel.
    Parallel,
}

#[derive(Debug)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

/// One segment of an output-command path (`@handler.a[0].push(...)`).
#[derive(Debug)]
pub enum PathSeg {
    Key(String),
    Index(Expr),
}

#[derive(Debug)]
pub struct Stmt {
    pub id: NodeId,
    pub pos: Pos,
    pub kind: StmtKind,
}

#[derive(Debug)]
pub enum StmtKind {
    /// Raw template data between tags.
    Text(String),
    /// `{{ expr }}`
    Output(Expr),
    /// `@handler.path.command(args)`
    OutputCommand {
        handler: String,
        subpath: Vec<PathSeg>,
        command: String,
        args: Vec<Expr>,
    },
    /// `:focus` directive / `{% option name = value %}`
    Option { name: String, value: Expr },
    If {
        /// `(condition, body)` for the `if` and each `elif`.
        arms: Vec<(Expr, Body)>,
        alt: Option<Body>,
    },
    Switch {
        subject: Expr,
        /// Each case may list several match expressions.
        cases: Vec<(Vec<Expr>, Body)>,
        default: Option<Body>,
    },
    For {
        targets: Vec<String>,
        iter: Expr,
        body: Body,
        alt: Option<Body>,
        mode: LoopMode,
        /// Optional sliding-window cap for parallel iteration.
        concurrent_limit: Option<Expr>,
    },
    While {
        cond: Expr,
        body: Body,
    },
    Set {
        targets: Vec<String>,
        value: Option<Expr>,
        /// Block capture: `{% set x %}...{% endset %}`.
        body: Option<Body>,
        var_type: VarType,
    },
    Do(Vec<Expr>),
    Macro {
        name: String,
        params: Rc<Vec<Param>>,
        body: Rc<Body>,
    },
    /// `{% call (params) expr %}body{% endcall %}`
    CallBlock {
        call: Expr,
        params: Rc<Vec<Param>>,
        body: Rc<Body>,
    },
    Block {
        name: String,
        body: Rc<Body>,
    },
    Extends(Expr),
    Include {
        template: Expr,
    },
    Import {
        template: Expr,
        alias: String,
        with_context: bool,
    },
    FromImport {
        template: Expr,
        /// `(exported name, local alias)`
        names: Vec<(String, Option<String>)>,
        with_context: bool,
    },
    /// Parser-external custom tag routed to a registered extension.
    CallExtension {
        name: String,
        args: Vec<Expr>,
        bodies: Vec<Rc<Body>>,
    },
}

impl Expr {
    /// Static path of a lookup chain (`a.b.c`), innermost symbol first;
    /// `None` when any segment is computed.
    #[must_use]
    pub fn static_path(&self) -> Option<Vec<&str>> {
        match &self.kind {
            ExprKind::Symbol { name, .. } => Some(vec![name.as_str()]),
            ExprKind::Lookup { obj, key, .. } => {
                let mut path = obj.static_path()?;
                match &key.kind {
                    ExprKind::Literal(LiteralValue::Str(s)) => {
                        path.push(s.as_str());
                        Some(path)
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}
