use crate::ast::{BinOp, CmpOp, Expr, ExprKind, IdGen, LiteralValue};
use crate::error::{CompileError, Pos};

use super::lexer::{TokKind, Token};

/// Token cursor shared by the template, script and expression grammars.
pub(crate) struct Cursor {
    toks: Vec<Token>,
    i: usize,
}

impl Cursor {
    pub fn new(toks: Vec<Token>) -> Self {
        Self { toks, i: 0 }
    }

    pub fn peek(&self) -> &Token {
        &self.toks[self.i.min(self.toks.len() - 1)]
    }

    pub fn peek2(&self) -> &Token {
        &self.toks[(self.i + 1).min(self.toks.len() - 1)]
    }

    pub fn pos(&self) -> Pos {
        self.peek().pos
    }

    pub fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.i < self.toks.len() - 1 {
            self.i += 1;
        }
        tok
    }

    pub fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokKind::Eof)
    }

    pub fn eat_punct(&mut self, p: &str) -> bool {
        if matches!(&self.peek().kind, TokKind::Punct(q) if *q == p) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub fn expect_punct(&mut self, p: &str) -> Result<(), CompileError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(CompileError::new(
                format!("expected {p:?}, found {}", describe(&self.peek().kind)),
                self.pos(),
            ))
        }
    }

    /// Consume `word` when the next token is exactly that identifier.
    pub fn eat_keyword(&mut self, word: &str) -> bool {
        if matches!(&self.peek().kind, TokKind::Ident(s) if s == word) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub fn expect_keyword(&mut self, word: &str) -> Result<(), CompileError> {
        if self.eat_keyword(word) {
            Ok(())
        } else {
            Err(CompileError::new(
                format!("expected {word:?}, found {}", describe(&self.peek().kind)),
                self.pos(),
            ))
        }
    }

    pub fn expect_ident(&mut self) -> Result<(String, Pos), CompileError> {
        let pos = self.pos();
        match self.peek().kind.clone() {
            TokKind::Ident(name) => {
                self.advance();
                Ok((name, pos))
            }
            other => Err(CompileError::new(
                format!("expected identifier, found {}", describe(&other)),
                pos,
            )),
        }
    }

    pub fn expect_eof(&self) -> Result<(), CompileError> {
        if self.at_eof() {
            Ok(())
        } else {
            Err(CompileError::new(
                format!("unexpected {}", describe(&self.peek().kind)),
                self.pos(),
            ))
        }
    }
}

pub(crate) fn describe(kind: &TokKind) -> String {
    match kind {
        TokKind::Ident(s) => format!("identifier {s:?}"),
        TokKind::Int(v) => format!("number {v}"),
        TokKind::Float(v) => format!("number {v}"),
        TokKind::Str(_) => "string literal".to_string(),
        TokKind::Punct(p) => format!("{p:?}"),
        TokKind::Eof => "end of input".to_string(),
    }
}

pub(crate) fn parse_expr(c: &mut Cursor, ids: &mut IdGen) -> Result<Expr, CompileError> {
    parse_inline_if(c, ids)
}

fn node(ids: &mut IdGen, pos: Pos, kind: ExprKind) -> Expr {
    Expr {
        id: ids.expr(),
        pos,
        kind,
    }
}

fn parse_inline_if(c: &mut Cursor, ids: &mut IdGen) -> Result<Expr, CompileError> {
    let then = parse_or(c, ids)?;
    if !c.eat_keyword("if") {
        return Ok(then);
    }
    let pos = then.pos;
    let cond = parse_or(c, ids)?;
    let otherwise = if c.eat_keyword("else") {
        Some(Box::new(parse_inline_if(c, ids)?))
    } else {
        None
    };
    Ok(node(
        ids,
        pos,
        ExprKind::InlineIf {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise,
        },
    ))
}

fn parse_or(c: &mut Cursor, ids: &mut IdGen) -> Result<Expr, CompileError> {
    let mut left = parse_and(c, ids)?;
    while c.eat_keyword("or") {
        let pos = left.pos;
        let right = parse_and(c, ids)?;
        left = node(ids, pos, ExprKind::Or(Box::new(left), Box::new(right)));
    }
    Ok(left)
}

fn parse_and(c: &mut Cursor, ids: &mut IdGen) -> Result<Expr, CompileError> {
    let mut left = parse_not(c, ids)?;
    while c.eat_keyword("and") {
        let pos = left.pos;
        let right = parse_not(c, ids)?;
        left = node(ids, pos, ExprKind::And(Box::new(left), Box::new(right)));
    }
    Ok(left)
}

fn parse_not(c: &mut Cursor, ids: &mut IdGen) -> Result<Expr, CompileError> {
    if matches!(&c.peek().kind, TokKind::Ident(s) if s == "not") {
        let pos = c.pos();
        c.advance();
        let inner = parse_not(c, ids)?;
        return Ok(node(ids, pos, ExprKind::Not(Box::new(inner))));
    }
    parse_comparison(c, ids)
}

fn cmp_op(kind: &TokKind) -> Option<CmpOp> {
    match kind {
        TokKind::Punct("==") => Some(CmpOp::Eq),
        TokKind::Punct("!=") => Some(CmpOp::Ne),
        TokKind::Punct("<") => Some(CmpOp::Lt),
        TokKind::Punct("<=") => Some(CmpOp::Le),
        TokKind::Punct(">") => Some(CmpOp::Gt),
        TokKind::Punct(">=") => Some(CmpOp::Ge),
        _ => None,
    }
}

fn parse_comparison(c: &mut Cursor, ids: &mut IdGen) -> Result<Expr, CompileError> {
    let left = parse_concat(c, ids)?;

    if let Some(op) = cmp_op(&c.peek().kind) {
        c.advance();
        let pos = left.pos;
        let mut ops = vec![(op, parse_concat(c, ids)?)];
        while let Some(op) = cmp_op(&c.peek().kind) {
            c.advance();
            ops.push((op, parse_concat(c, ids)?));
        }
        return Ok(node(
            ids,
            pos,
            ExprKind::Compare {
                left: Box::new(left),
                ops,
            },
        ));
    }

    if c.eat_keyword("in") {
        let pos = left.pos;
        let right = parse_concat(c, ids)?;
        return Ok(node(
            ids,
            pos,
            ExprKind::In {
                left: Box::new(left),
                right: Box::new(right),
                negated: false,
            },
        ));
    }

    if matches!(&c.peek().kind, TokKind::Ident(s) if s == "not")
        && matches!(&c.peek2().kind, TokKind::Ident(s) if s == "in")
    {
        c.advance();
        c.advance();
        let pos = left.pos;
        let right = parse_concat(c, ids)?;
        return Ok(node(
            ids,
            pos,
            ExprKind::In {
                left: Box::new(left),
                right: Box::new(right),
                negated: true,
            },
        ));
    }

    if c.eat_keyword("is") {
        let negated = c.eat_keyword("not");
        let pos = left.pos;
        let (name, _) = c.expect_ident()?;
        let mut args = Vec::new();
        if c.eat_punct("(") {
            while !c.eat_punct(")") {
                args.push(parse_expr(c, ids)?);
                if !c.eat_punct(",") {
                    c.expect_punct(")")?;
                    break;
                }
            }
        }
        return Ok(node(
            ids,
            pos,
            ExprKind::Test {
                expr: Box::new(left),
                name,
                args,
                negated,
            },
        ));
    }

    Ok(left)
}

fn parse_concat(c: &mut Cursor, ids: &mut IdGen) -> Result<Expr, CompileError> {
    let mut left = parse_add_sub(c, ids)?;
    while c.eat_punct("~") {
        let pos = left.pos;
        let right = parse_add_sub(c, ids)?;
        left = node(
            ids,
            pos,
            ExprKind::BinOp {
                op: BinOp::Concat,
                left: Box::new(left),
                right: Box::new(right),
            },
        );
    }
    Ok(left)
}

fn parse_add_sub(c: &mut Cursor, ids: &mut IdGen) -> Result<Expr, CompileError> {
    let mut left = parse_mul_div(c, ids)?;
    loop {
        let op = match &c.peek().kind {
            TokKind::Punct("+") => BinOp::Add,
            TokKind::Punct("-") => BinOp::Sub,
            _ => break,
        };
        c.advance();
        let pos = left.pos;
        let right = parse_mul_div(c, ids)?;
        left = node(
            ids,
            pos,
            ExprKind::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        );
    }
    Ok(left)
}

fn parse_mul_div(c: &mut Cursor, ids: &mut IdGen) -> Result<Expr, CompileError> {
    let mut left = parse_unary(c, ids)?;
    loop {
        let op = match &c.peek().kind {
            TokKind::Punct("*") => BinOp::Mul,
            TokKind::Punct("/") => BinOp::Div,
            TokKind::Punct("//") => BinOp::FloorDiv,
            TokKind::Punct("%") => BinOp::Mod,
            _ => break,
        };
        c.advance();
        let pos = left.pos;
        let right = parse_unary(c, ids)?;
        left = node(
            ids,
            pos,
            ExprKind::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        );
    }
    Ok(left)
}

fn parse_unary(c: &mut Cursor, ids: &mut IdGen) -> Result<Expr, CompileError> {
    let pos = c.pos();
    if c.eat_punct("-") {
        let inner = parse_unary(c, ids)?;
        return Ok(node(ids, pos, ExprKind::Neg(Box::new(inner))));
    }
    if c.eat_punct("+") {
        let inner = parse_unary(c, ids)?;
        return Ok(node(ids, pos, ExprKind::Pos(Box::new(inner))));
    }
    parse_power(c, ids)
}

fn parse_power(c: &mut Cursor, ids: &mut IdGen) -> Result<Expr, CompileError> {
    let base = parse_postfix(c, ids)?;
    if c.eat_punct("**") {
        let pos = base.pos;
        let exp = parse_unary(c, ids)?;
        return Ok(node(
            ids,
            pos,
            ExprKind::BinOp {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exp),
            },
        ));
    }
    Ok(base)
}

/// Parse call arguments up to and including the closing `)`.
pub(crate) fn parse_call_args(
    c: &mut Cursor,
    ids: &mut IdGen,
) -> Result<(Vec<Expr>, Vec<(String, Expr)>), CompileError> {
    let mut args = Vec::new();
    let mut kwargs = Vec::new();
    loop {
        if c.eat_punct(")") {
            break;
        }
        let is_kwarg = matches!(&c.peek().kind, TokKind::Ident(_))
            && matches!(&c.peek2().kind, TokKind::Punct("="));
        if is_kwarg {
            let (name, _) = c.expect_ident()?;
            c.expect_punct("=")?;
            kwargs.push((name, parse_expr(c, ids)?));
        } else {
            args.push(parse_expr(c, ids)?);
        }
        if !c.eat_punct(",") {
            c.expect_punct(")")?;
            break;
        }
    }
    Ok((args, kwargs))
}

fn mark_tail(expr: &mut Expr, pos: Pos) -> Result<(), CompileError> {
    match &mut expr.kind {
        ExprKind::Symbol { marked, .. } | ExprKind::Lookup { marked, .. } => {
            *marked = true;
            Ok(())
        }
        _ => Err(CompileError::new(
            "'!' sequence marker must follow a name or member path",
            pos,
        )),
    }
}

fn parse_postfix(c: &mut Cursor, ids: &mut IdGen) -> Result<Expr, CompileError> {
    let mut expr = parse_primary(c, ids)?;
    loop {
        let pos = c.pos();
        if c.eat_punct("!") {
            mark_tail(&mut expr, pos)?;
        } else if c.eat_punct(".") {
            let (name, key_pos) = c.expect_ident()?;
            let key = node(ids, key_pos, ExprKind::Literal(LiteralValue::Str(name)));
            expr = node(
                ids,
                expr.pos,
                ExprKind::Lookup {
                    obj: Box::new(expr),
                    key: Box::new(key),
                    marked: false,
                },
            );
        } else if c.eat_punct("[") {
            let key = parse_expr(c, ids)?;
            c.expect_punct("]")?;
            expr = node(
                ids,
                expr.pos,
                ExprKind::Lookup {
                    obj: Box::new(expr),
                    key: Box::new(key),
                    marked: false,
                },
            );
        } else if c.eat_punct("(") {
            let (args, kwargs) = parse_call_args(c, ids)?;
            expr = node(
                ids,
                expr.pos,
                ExprKind::FunCall {
                    callee: Box::new(expr),
                    args,
                    kwargs,
                },
            );
        } else if c.eat_punct("|") {
            let (name, _) = c.expect_ident()?;
            let mut args = vec![expr];
            let mut kwargs = Vec::new();
            if c.eat_punct("(") {
                let (extra, kw) = parse_call_args(c, ids)?;
                args.extend(extra);
                kwargs = kw;
            }
            expr = node(ids, args[0].pos, ExprKind::Filter { name, args, kwargs });
        } else {
            break;
        }
    }
    Ok(expr)
}

fn parse_primary(c: &mut Cursor, ids: &mut IdGen) -> Result<Expr, CompileError> {
    let pos = c.pos();
    match c.peek().kind.clone() {
        TokKind::Int(v) => {
            c.advance();
            Ok(node(ids, pos, ExprKind::Literal(LiteralValue::Int(v))))
        }
        TokKind::Float(v) => {
            c.advance();
            Ok(node(ids, pos, ExprKind::Literal(LiteralValue::Float(v))))
        }
        TokKind::Str(s) => {
            c.advance();
            Ok(node(ids, pos, ExprKind::Literal(LiteralValue::Str(s))))
        }
        TokKind::Ident(name) => {
            c.advance();
            let kind = match name.as_str() {
                "true" | "True" => ExprKind::Literal(LiteralValue::Bool(true)),
                "false" | "False" => ExprKind::Literal(LiteralValue::Bool(false)),
                "none" | "None" | "null" => ExprKind::Literal(LiteralValue::None),
                _ => ExprKind::Symbol {
                    name,
                    marked: false,
                },
            };
            Ok(node(ids, pos, kind))
        }
        TokKind::Punct("(") => {
            c.advance();
            let mut items = vec![parse_expr(c, ids)?];
            while c.eat_punct(",") {
                if matches!(&c.peek().kind, TokKind::Punct(")")) {
                    break;
                }
                items.push(parse_expr(c, ids)?);
            }
            c.expect_punct(")")?;
            let single = if items.len() == 1 { items.pop() } else { None };
            match single {
                Some(expr) => Ok(expr),
                None => Ok(node(ids, pos, ExprKind::Group(items))),
            }
        }
        TokKind::Punct("[") => {
            c.advance();
            let mut items = Vec::new();
            while !c.eat_punct("]") {
                items.push(parse_expr(c, ids)?);
                if !c.eat_punct(",") {
                    c.expect_punct("]")?;
                    break;
                }
            }
            Ok(node(ids, pos, ExprKind::Array(items)))
        }
        TokKind::Punct("{") => {
            c.advance();
            let mut entries = Vec::new();
            while !c.eat_punct("}") {
                let key_pos = c.pos();
                let key = match c.peek().kind.clone() {
                    TokKind::Ident(name) => {
                        c.advance();
                        node(ids, key_pos, ExprKind::Literal(LiteralValue::Str(name)))
                    }
                    TokKind::Str(s) => {
                        c.advance();
                        node(ids, key_pos, ExprKind::Literal(LiteralValue::Str(s)))
                    }
                    _ => parse_expr(c, ids)?,
                };
                c.expect_punct(":")?;
                let value = parse_expr(c, ids)?;
                entries.push((key, std::rc::Rc::new(value)));
                if !c.eat_punct(",") {
                    c.expect_punct("}")?;
                    break;
                }
            }
            Ok(node(ids, pos, ExprKind::Dict(entries)))
        }
        other => Err(CompileError::new(
            format!("expected expression, found {}", describe(&other)),
            pos,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_expr, Cursor};
    use crate::ast::{ExprKind, IdGen};
    use crate::error::Pos;
    use crate::parse::lexer::tokenize;

    fn parse(src: &str) -> crate::ast::Expr {
        let toks = tokenize(src, Pos::new(1, 1)).expect("tokenize");
        let mut c = Cursor::new(toks);
        let mut ids = IdGen::default();
        let e = parse_expr(&mut c, &mut ids).expect("parse");
        c.expect_eof().expect("fully consumed");
        e
    }

    #[test]
    fn precedence_add_mul() {
        let e = parse("1 + 2 * 3");
        let ExprKind::BinOp { op, .. } = &e.kind else {
            panic!("expected binop");
        };
        assert_eq!(*op, crate::ast::BinOp::Add);
    }

    #[test]
    fn sequence_marker_lands_on_path_segment() {
        let e = parse("state!.inc()");
        let ExprKind::FunCall { callee, .. } = &e.kind else {
            panic!("expected call");
        };
        let ExprKind::Lookup { obj, .. } = &callee.kind else {
            panic!("expected lookup");
        };
        assert!(matches!(&obj.kind, ExprKind::Symbol { marked: true, .. }));
    }

    #[test]
    fn filters_and_kwargs() {
        let e = parse("name | default(fallback = 'x') | upper");
        let ExprKind::Filter { name, args, .. } = &e.kind else {
            panic!("expected filter");
        };
        assert_eq!(name, "upper");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn inline_if_and_tests() {
        let e = parse("a if b is defined else c");
        assert!(matches!(e.kind, ExprKind::InlineIf { .. }));
    }

    #[test]
    fn dict_with_bare_keys() {
        let e = parse("{a: 1, 'b': 2}");
        let ExprKind::Dict(entries) = &e.kind else {
            panic!("expected dict");
        };
        assert_eq!(entries.len(), 2);
    }
}
