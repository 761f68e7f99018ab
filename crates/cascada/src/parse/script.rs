//! Line-oriented script dialect.
//!
//! Scripts share the expression grammar with templates but drop the tag
//! delimiters: each non-blank line is one statement. Output is a command
//! stream (`@handler...`) rather than text, with `print` for free text.

use crate::ast::{Body, ExprKind, IdGen, LiteralValue, LoopMode, PathSeg, Stmt, StmtKind, VarType};
use crate::error::{CompileError, Pos};

use super::expr::{parse_call_args, parse_expr, Cursor};
use super::lexer::{tokenize, TokKind};

struct Line {
    cursor: Cursor,
    /// Leading keyword when the line starts with an identifier.
    head: Option<String>,
    pos: Pos,
}

pub(crate) struct ScriptParser {
    lines: std::vec::IntoIter<Line>,
    pub ids: IdGen,
}

impl ScriptParser {
    pub fn parse(src: &str) -> Result<(Body, IdGen), CompileError> {
        let mut lines = Vec::new();
        for (idx, raw) in src.lines().enumerate() {
            let trimmed = raw.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let line_no = u32::try_from(idx + 1).unwrap_or(u32::MAX);
            let col = u32::try_from(raw.len() - trimmed.len() + 1).unwrap_or(1);
            let pos = Pos::new(line_no, col);
            let cursor = Cursor::new(tokenize(trimmed, pos)?);
            let head = match &cursor.peek().kind {
                TokKind::Ident(name) => Some(name.clone()),
                _ => None,
            };
            lines.push(Line { cursor, head, pos });
        }

        let mut parser = Self {
            lines: lines.into_iter(),
            ids: IdGen::default(),
        };
        let (body, stray) = parser.parse_block(&[])?;
        if let Some(line) = stray {
            return Err(CompileError::new(
                format!("unexpected {:?}", line.head.unwrap_or_default()),
                line.pos,
            ));
        }
        Ok((body, parser.ids))
    }

    fn parse_block(&mut self, until: &[&str]) -> Result<(Body, Option<Line>), CompileError> {
        let mut stmts = Vec::new();
        loop {
            let Some(line) = self.lines.next() else {
                if until.is_empty() {
                    return Ok((self.make_body(stmts), None));
                }
                return Err(CompileError::new(
                    format!("missing closing statement, expected one of {until:?}"),
                    Pos::new(1, 1),
                ));
            };
            if let Some(head) = &line.head {
                if until.contains(&head.as_str()) {
                    return Ok((self.make_body(stmts), Some(line)));
                }
            }
            stmts.push(self.parse_line(line)?);
        }
    }

    fn make_body(&mut self, stmts: Vec<Stmt>) -> Body {
        Body {
            id: self.ids.body(),
            stmts,
        }
    }

    fn stmt(&mut self, pos: Pos, kind: StmtKind) -> Stmt {
        Stmt {
            id: self.ids.stmt(),
            pos,
            kind,
        }
    }

    #[allow(clippy::too_many_lines)]
    fn parse_line(&mut self, mut line: Line) -> Result<Stmt, CompileError> {
        let pos = line.pos;
        let c = &mut line.cursor;

        if c.eat_punct(":") {
            let (name, _) = c.expect_ident()?;
            c.expect_eof()?;
            let value = crate::ast::Expr {
                id: self.ids.expr(),
                pos,
                kind: ExprKind::Literal(LiteralValue::Str(name)),
            };
            return Ok(self.stmt(
                pos,
                StmtKind::Option {
                    name: "focus".to_string(),
                    value,
                },
            ));
        }

        if c.eat_punct("@") {
            return self.parse_command(line);
        }

        let Some(head) = line.head.clone() else {
            return Err(CompileError::new("expected a script statement", pos));
        };

        match head.as_str() {
            "var" | "extern" => {
                c.advance();
                let var_type = if head == "var" {
                    VarType::Declaration
                } else {
                    VarType::Extern
                };
                let mut targets = vec![c.expect_ident()?.0];
                while c.eat_punct(",") {
                    targets.push(c.expect_ident()?.0);
                }
                let value = if c.eat_punct("=") {
                    if var_type == VarType::Extern {
                        return Err(CompileError::new(
                            "extern declares a name without a value",
                            pos,
                        ));
                    }
                    Some(parse_expr(c, &mut self.ids)?)
                } else {
                    None
                };
                c.expect_eof()?;
                Ok(self.stmt(
                    pos,
                    StmtKind::Set {
                        targets,
                        value,
                        body: None,
                        var_type,
                    },
                ))
            }
            "if" => {
                c.advance();
                let mut cond = parse_expr(c, &mut self.ids)?;
                c.expect_eof()?;
                let mut arms = Vec::new();
                let mut alt = None;
                loop {
                    let (body, end) = self.parse_block(&["elif", "else", "endif"])?;
                    let mut end = end.ok_or_else(|| {
                        CompileError::new("missing endif", pos)
                    })?;
                    arms.push((cond, body));
                    end.cursor.advance();
                    match end.head.as_deref() {
                        Some("elif") => {
                            cond = parse_expr(&mut end.cursor, &mut self.ids)?;
                            end.cursor.expect_eof()?;
                        }
                        Some("else") => {
                            end.cursor.expect_eof()?;
                            let (body, close) = self.parse_block(&["endif"])?;
                            let mut close =
                                close.ok_or_else(|| CompileError::new("missing endif", pos))?;
                            close.cursor.advance();
                            close.cursor.expect_eof()?;
                            alt = Some(body);
                            break;
                        }
                        _ => {
                            end.cursor.expect_eof()?;
                            break;
                        }
                    }
                }
                Ok(self.stmt(pos, StmtKind::If { arms, alt }))
            }
            "for" | "each" | "all" => {
                c.advance();
                let mode = match head.as_str() {
                    "all" => LoopMode::Parallel,
                    "each" => LoopMode::Sequential,
                    _ => LoopMode::For,
                };
                let mut targets = vec![c.expect_ident()?.0];
                while c.eat_punct(",") {
                    targets.push(c.expect_ident()?.0);
                }
                c.expect_keyword("in")?;
                let iter = parse_expr(c, &mut self.ids)?;
                let concurrent_limit = if c.eat_keyword("limit") {
                    Some(parse_expr(c, &mut self.ids)?)
                } else {
                    None
                };
                c.expect_eof()?;
                let (body, end) = self.parse_block(&["else", "endfor"])?;
                let mut end = end.ok_or_else(|| CompileError::new("missing endfor", pos))?;
                end.cursor.advance();
                let alt = if end.head.as_deref() == Some("else") {
                    end.cursor.expect_eof()?;
                    let (alt, close) = self.parse_block(&["endfor"])?;
                    let mut close =
                        close.ok_or_else(|| CompileError::new("missing endfor", pos))?;
                    close.cursor.advance();
                    close.cursor.expect_eof()?;
                    Some(alt)
                } else {
                    end.cursor.expect_eof()?;
                    None
                };
                Ok(self.stmt(
                    pos,
                    StmtKind::For {
                        targets,
                        iter,
                        body,
                        alt,
                        mode,
                        concurrent_limit,
                    },
                ))
            }
            "while" => {
                c.advance();
                let cond = parse_expr(c, &mut self.ids)?;
                c.expect_eof()?;
                let (body, end) = self.parse_block(&["endwhile"])?;
                let mut end = end.ok_or_else(|| CompileError::new("missing endwhile", pos))?;
                end.cursor.advance();
                end.cursor.expect_eof()?;
                Ok(self.stmt(pos, StmtKind::While { cond, body }))
            }
            "do" => {
                c.advance();
                let mut exprs = vec![parse_expr(c, &mut self.ids)?];
                while c.eat_punct(",") {
                    exprs.push(parse_expr(c, &mut self.ids)?);
                }
                c.expect_eof()?;
                Ok(self.stmt(pos, StmtKind::Do(exprs)))
            }
            "print" => {
                c.advance();
                let expr = parse_expr(c, &mut self.ids)?;
                c.expect_eof()?;
                Ok(self.stmt(pos, StmtKind::Output(expr)))
            }
            _ => {
                // `name = expr` assignment into an existing declaration.
                if matches!(&c.peek2().kind, TokKind::Punct("=")) {
                    let (name, _) = c.expect_ident()?;
                    c.expect_punct("=")?;
                    let value = parse_expr(c, &mut self.ids)?;
                    c.expect_eof()?;
                    return Ok(self.stmt(
                        pos,
                        StmtKind::Set {
                            targets: vec![name],
                            value: Some(value),
                            body: None,
                            var_type: VarType::Assignment,
                        },
                    ));
                }
                Err(CompileError::new(
                    format!("unknown script statement {head:?}"),
                    pos,
                ))
            }
        }
    }

    /// `@handler[.seg|[idx]]*.command(args)` — the cursor sits after `@`.
    fn parse_command(&mut self, mut line: Line) -> Result<Stmt, CompileError> {
        let pos = line.pos;
        let c = &mut line.cursor;
        let (handler, _) = c.expect_ident()?;
        let mut segments: Vec<PathSeg> = Vec::new();
        loop {
            if c.eat_punct(".") {
                let (name, _) = c.expect_ident()?;
                segments.push(PathSeg::Key(name));
            } else if c.eat_punct("[") {
                let index = parse_expr(c, &mut self.ids)?;
                c.expect_punct("]")?;
                segments.push(PathSeg::Index(index));
            } else if c.eat_punct("(") {
                let Some(PathSeg::Key(command)) = segments.pop() else {
                    return Err(CompileError::new(
                        "command name must be a plain identifier",
                        pos,
                    ));
                };
                let (args, _) = parse_call_args(c, &mut self.ids)?;
                c.expect_eof()?;
                return Ok(self.stmt(
                    pos,
                    StmtKind::OutputCommand {
                        handler,
                        subpath: segments,
                        command,
                        args,
                    },
                ));
            } else {
                return Err(CompileError::new(
                    "output command must end in a call",
                    c.pos(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ScriptParser;
    use crate::ast::{PathSeg, StmtKind, VarType};

    #[test]
    fn parses_data_commands() {
        let (body, _) = ScriptParser::parse(":data\n@data.list.push(1)\n@data.obj.merge({a: 1})")
            .expect("parse");
        assert_eq!(body.stmts.len(), 3);
        assert!(matches!(body.stmts[0].kind, StmtKind::Option { .. }));
        let StmtKind::OutputCommand {
            handler,
            subpath,
            command,
            args,
        } = &body.stmts[1].kind
        else {
            panic!("expected command");
        };
        assert_eq!(handler, "data");
        assert!(matches!(&subpath[0], PathSeg::Key(k) if k == "list"));
        assert_eq!(command, "push");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn declaration_kinds() {
        let (body, _) = ScriptParser::parse("var x = 1\nx = 2\nextern y").expect("parse");
        let kinds: Vec<_> = body
            .stmts
            .iter()
            .map(|s| match &s.kind {
                StmtKind::Set { var_type, .. } => *var_type,
                _ => panic!("expected set"),
            })
            .collect();
        assert_eq!(
            kinds,
            [
                VarType::Declaration,
                VarType::Assignment,
                VarType::Extern
            ]
        );
    }

    #[test]
    fn control_flow_lines() {
        let (body, _) = ScriptParser::parse(
            "var total = 0\nfor x in items\n  total = total + x\nendfor\nprint total",
        )
        .expect("parse");
        assert_eq!(body.stmts.len(), 3);
        assert!(matches!(body.stmts[1].kind, StmtKind::For { .. }));
    }
}
