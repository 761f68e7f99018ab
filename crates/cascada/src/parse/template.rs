use std::rc::Rc;

use crate::ast::{Body, Expr, ExprKind, IdGen, LoopMode, Param, Stmt, StmtKind, VarType};
use crate::error::{CompileError, Pos};

use super::expr::{parse_call_args, parse_expr, Cursor};
use super::lexer::{advance_pos, tokenize};

/// Delimiters and whitespace handling; a parser concern configured on the
/// environment.
#[derive(Debug, Clone)]
pub struct SyntaxConfig {
    pub block_start: String,
    pub block_end: String,
    pub variable_start: String,
    pub variable_end: String,
    pub comment_start: String,
    pub comment_end: String,
    pub trim_blocks: bool,
    pub lstrip_blocks: bool,
}

impl Default for SyntaxConfig {
    fn default() -> Self {
        Self {
            block_start: "{%".to_string(),
            block_end: "%}".to_string(),
            variable_start: "{{".to_string(),
            variable_end: "}}".to_string(),
            comment_start: "{#".to_string(),
            comment_end: "#}".to_string(),
            trim_blocks: false,
            lstrip_blocks: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegKind {
    Text,
    Var,
    Block,
    Comment,
}

#[derive(Debug)]
struct Segment {
    kind: SegKind,
    content: String,
    pos: Pos,
}

fn scan(src: &str, cfg: &SyntaxConfig) -> Result<Vec<Segment>, CompileError> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut pos = Pos::new(1, 1);
    let mut rest = src;

    while !rest.is_empty() {
        let starts = [
            (SegKind::Var, cfg.variable_start.as_str(), cfg.variable_end.as_str()),
            (SegKind::Block, cfg.block_start.as_str(), cfg.block_end.as_str()),
            (SegKind::Comment, cfg.comment_start.as_str(), cfg.comment_end.as_str()),
        ];
        let next = starts
            .iter()
            .filter_map(|(kind, open, close)| rest.find(open).map(|at| (at, *kind, *open, *close)))
            .min_by_key(|(at, ..)| *at);

        let Some((at, kind, open, close)) = next else {
            segments.push(Segment {
                kind: SegKind::Text,
                content: rest.to_string(),
                pos,
            });
            break;
        };

        if at > 0 {
            segments.push(Segment {
                kind: SegKind::Text,
                content: rest[..at].to_string(),
                pos,
            });
            pos = advance_pos(pos, &rest[..at]);
        }

        let tag_pos = pos;
        let after_open = &rest[at + open.len()..];
        let trim_before = after_open.starts_with('-');
        let inner_start = usize::from(trim_before);
        let Some(end) = after_open.find(close) else {
            return Err(CompileError::new(format!("unclosed {open:?} tag"), tag_pos));
        };
        let mut inner = &after_open[inner_start..end];
        let trim_after = inner.ends_with('-');
        if trim_after {
            inner = &inner[..inner.len() - 1];
        }

        if trim_before {
            if let Some(prev) = segments.last_mut() {
                if prev.kind == SegKind::Text {
                    prev.content.truncate(prev.content.trim_end().len());
                }
            }
        } else if cfg.lstrip_blocks && kind == SegKind::Block {
            if let Some(prev) = segments.last_mut() {
                if prev.kind == SegKind::Text {
                    let stripped = prev.content.trim_end_matches([' ', '\t']).len();
                    if stripped == 0 || prev.content[..stripped].ends_with('\n') {
                        prev.content.truncate(stripped);
                    }
                }
            }
        }

        let content_pos = advance_pos(tag_pos, &rest[at..at + open.len() + inner_start]);
        segments.push(Segment {
            kind,
            content: inner.to_string(),
            pos: content_pos,
        });

        let consumed = at + open.len() + end + close.len();
        pos = advance_pos(pos, &rest[at..consumed]);
        rest = &rest[consumed..];

        if trim_after {
            let trimmed = rest.trim_start();
            pos = advance_pos(pos, &rest[..rest.len() - trimmed.len()]);
            rest = trimmed;
        } else if cfg.trim_blocks && kind == SegKind::Block {
            if let Some(stripped) = rest.strip_prefix("\r\n") {
                pos = advance_pos(pos, "\r\n");
                rest = stripped;
            } else if let Some(stripped) = rest.strip_prefix('\n') {
                pos = advance_pos(pos, "\n");
                rest = stripped;
            }
        }
    }

    Ok(segments)
}

/// A block tag whose name has been consumed; the cursor sits on its
/// arguments.
struct Tag {
    name: String,
    cursor: Cursor,
    pos: Pos,
}

pub(crate) struct TemplateParser {
    segments: std::vec::IntoIter<Segment>,
    pub ids: IdGen,
}

impl TemplateParser {
    pub fn parse(src: &str, cfg: &SyntaxConfig) -> Result<(Body, IdGen), CompileError> {
        let mut parser = Self {
            segments: scan(src, cfg)?.into_iter(),
            ids: IdGen::default(),
        };
        let body = parser.parse_root()?;
        Ok((body, parser.ids))
    }

    fn next_tag(seg: &Segment) -> Result<Tag, CompileError> {
        let mut cursor = Cursor::new(tokenize(&seg.content, seg.pos)?);
        let (name, pos) = cursor
            .expect_ident()
            .map_err(|_| CompileError::new("expected tag name", seg.pos))?;
        Ok(Tag { name, cursor, pos })
    }

    fn parse_root(&mut self) -> Result<Body, CompileError> {
        let (body, end) = self.parse_stmts(&[])?;
        if let Some(tag) = end {
            return Err(CompileError::new(
                format!("unexpected tag {:?}", tag.name),
                tag.pos,
            ));
        }
        Ok(body)
    }

    /// Parse until a tag named in `until`; errors on end of input.
    fn parse_until(&mut self, until: &[&str]) -> Result<(Body, Tag), CompileError> {
        let (body, end) = self.parse_stmts(until)?;
        end.map_or_else(
            || {
                Err(CompileError::new(
                    format!("missing closing tag, expected one of {until:?}"),
                    Pos::new(1, 1),
                ))
            },
            |tag| Ok((body, tag)),
        )
    }

    fn parse_stmts(&mut self, until: &[&str]) -> Result<(Body, Option<Tag>), CompileError> {
        let mut stmts = Vec::new();
        loop {
            let Some(seg) = self.segments.next() else {
                return Ok((self.make_body(stmts), None));
            };
            match seg.kind {
                SegKind::Comment => {}
                SegKind::Text => {
                    if !seg.content.is_empty() {
                        stmts.push(Stmt {
                            id: self.ids.stmt(),
                            pos: seg.pos,
                            kind: StmtKind::Text(seg.content),
                        });
                    }
                }
                SegKind::Var => {
                    let mut cursor = Cursor::new(tokenize(&seg.content, seg.pos)?);
                    let expr = parse_expr(&mut cursor, &mut self.ids)?;
                    cursor.expect_eof()?;
                    stmts.push(Stmt {
                        id: self.ids.stmt(),
                        pos: seg.pos,
                        kind: StmtKind::Output(expr),
                    });
                }
                SegKind::Block => {
                    let tag = Self::next_tag(&seg)?;
                    if until.contains(&tag.name.as_str()) {
                        return Ok((self.make_body(stmts), Some(tag)));
                    }
                    stmts.push(self.parse_stmt(tag)?);
                }
            }
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
    fn parse_stmt(&mut self, mut tag: Tag) -> Result<Stmt, CompileError> {
        let pos = tag.pos;
        match tag.name.as_str() {
            "if" => {
                let mut cond = parse_expr(&mut tag.cursor, &mut self.ids)?;
                tag.cursor.expect_eof()?;
                let mut arms = Vec::new();
                let mut alt = None;
                loop {
                    let (body, mut end) = self.parse_until(&["elif", "else", "endif"])?;
                    arms.push((cond, body));
                    match end.name.as_str() {
                        "elif" => {
                            cond = parse_expr(&mut end.cursor, &mut self.ids)?;
                            end.cursor.expect_eof()?;
                        }
                        "else" => {
                            end.cursor.expect_eof()?;
                            let (body, close) = self.parse_until(&["endif"])?;
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
            "switch" => {
                let subject = parse_expr(&mut tag.cursor, &mut self.ids)?;
                tag.cursor.expect_eof()?;
                let (lead, mut end_tag) = self.parse_until(&["case", "default", "endswitch"])?;
                for s in &lead.stmts {
                    if !matches!(&s.kind, StmtKind::Text(t) if t.trim().is_empty()) {
                        return Err(CompileError::new(
                            "content is not allowed between switch and the first case",
                            s.pos,
                        ));
                    }
                }
                let mut cases = Vec::new();
                let mut default = None;
                loop {
                    match end_tag.name.as_str() {
                        "case" => {
                            let mut match_exprs =
                                vec![parse_expr(&mut end_tag.cursor, &mut self.ids)?];
                            while end_tag.cursor.eat_punct(",") {
                                match_exprs.push(parse_expr(&mut end_tag.cursor, &mut self.ids)?);
                            }
                            end_tag.cursor.expect_eof()?;
                            let (body, next) =
                                self.parse_until(&["case", "default", "endswitch"])?;
                            cases.push((match_exprs, body));
                            end_tag = next;
                        }
                        "default" => {
                            end_tag.cursor.expect_eof()?;
                            let (body, next) = self.parse_until(&["endswitch"])?;
                            default = Some(body);
                            end_tag = next;
                        }
                        _ => {
                            end_tag.cursor.expect_eof()?;
                            break;
                        }
                    }
                }
                Ok(self.stmt(
                    pos,
                    StmtKind::Switch {
                        subject,
                        cases,
                        default,
                    },
                ))
            }
            "for" | "each" | "asyncEach" | "asyncAll" => {
                let mode = match tag.name.as_str() {
                    "asyncAll" => LoopMode::Parallel,
                    "each" | "asyncEach" => LoopMode::Sequential,
                    _ => LoopMode::For,
                };
                let mut targets = vec![tag.cursor.expect_ident()?.0];
                while tag.cursor.eat_punct(",") {
                    targets.push(tag.cursor.expect_ident()?.0);
                }
                tag.cursor.expect_keyword("in")?;
                let iter = parse_expr(&mut tag.cursor, &mut self.ids)?;
                let concurrent_limit = if tag.cursor.eat_keyword("limit") {
                    Some(parse_expr(&mut tag.cursor, &mut self.ids)?)
                } else {
                    None
                };
                tag.cursor.expect_eof()?;
                let enders = ["else", "endfor", "endeach", "endall"];
                let (body, mut end) = self.parse_until(&enders)?;
                let alt = if end.name == "else" {
                    end.cursor.expect_eof()?;
                    let (alt, close) = self.parse_until(&["endfor", "endeach", "endall"])?;
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
                let cond = parse_expr(&mut tag.cursor, &mut self.ids)?;
                tag.cursor.expect_eof()?;
                let (body, close) = self.parse_until(&["endwhile"])?;
                close.cursor.expect_eof()?;
                Ok(self.stmt(pos, StmtKind::While { cond, body }))
            }
            "set" => {
                let mut targets = vec![tag.cursor.expect_ident()?.0];
                while tag.cursor.eat_punct(",") {
                    targets.push(tag.cursor.expect_ident()?.0);
                }
                if tag.cursor.eat_punct("=") {
                    let value = parse_expr(&mut tag.cursor, &mut self.ids)?;
                    tag.cursor.expect_eof()?;
                    Ok(self.stmt(
                        pos,
                        StmtKind::Set {
                            targets,
                            value: Some(value),
                            body: None,
                            var_type: VarType::Auto,
                        },
                    ))
                } else {
                    tag.cursor.expect_eof()?;
                    let (body, close) = self.parse_until(&["endset"])?;
                    close.cursor.expect_eof()?;
                    Ok(self.stmt(
                        pos,
                        StmtKind::Set {
                            targets,
                            value: None,
                            body: Some(body),
                            var_type: VarType::Auto,
                        },
                    ))
                }
            }
            "do" => {
                let mut exprs = vec![parse_expr(&mut tag.cursor, &mut self.ids)?];
                while tag.cursor.eat_punct(",") {
                    exprs.push(parse_expr(&mut tag.cursor, &mut self.ids)?);
                }
                tag.cursor.expect_eof()?;
                Ok(self.stmt(pos, StmtKind::Do(exprs)))
            }
            "macro" => {
                let (name, _) = tag.cursor.expect_ident()?;
                tag.cursor.expect_punct("(")?;
                let params = self.parse_params(&mut tag.cursor)?;
                tag.cursor.expect_eof()?;
                let (body, close) = self.parse_until(&["endmacro"])?;
                close.cursor.expect_eof()?;
                Ok(self.stmt(
                    pos,
                    StmtKind::Macro {
                        name,
                        params: Rc::new(params),
                        body: Rc::new(body),
                    },
                ))
            }
            "call" => {
                let params = if tag.cursor.eat_punct("(") {
                    self.parse_params(&mut tag.cursor)?
                } else {
                    Vec::new()
                };
                let call = parse_expr(&mut tag.cursor, &mut self.ids)?;
                tag.cursor.expect_eof()?;
                if !matches!(call.kind, ExprKind::FunCall { .. }) {
                    return Err(CompileError::new(
                        "call block expects a call expression",
                        pos,
                    ));
                }
                let (body, close) = self.parse_until(&["endcall"])?;
                close.cursor.expect_eof()?;
                Ok(self.stmt(
                    pos,
                    StmtKind::CallBlock {
                        call,
                        params: Rc::new(params),
                        body: Rc::new(body),
                    },
                ))
            }
            "block" => {
                let (name, _) = tag.cursor.expect_ident()?;
                tag.cursor.expect_eof()?;
                let (body, mut close) = self.parse_until(&["endblock"])?;
                let _ = close.cursor.eat_keyword(&name);
                close.cursor.expect_eof()?;
                Ok(self.stmt(
                    pos,
                    StmtKind::Block {
                        name,
                        body: Rc::new(body),
                    },
                ))
            }
            "extends" => {
                let template = parse_expr(&mut tag.cursor, &mut self.ids)?;
                tag.cursor.expect_eof()?;
                Ok(self.stmt(pos, StmtKind::Extends(template)))
            }
            "include" => {
                let template = parse_expr(&mut tag.cursor, &mut self.ids)?;
                tag.cursor.expect_eof()?;
                Ok(self.stmt(pos, StmtKind::Include { template }))
            }
            "import" => {
                let template = parse_expr(&mut tag.cursor, &mut self.ids)?;
                tag.cursor.expect_keyword("as")?;
                let (alias, _) = tag.cursor.expect_ident()?;
                let with_context = Self::parse_context_modifier(&mut tag.cursor)?;
                Ok(self.stmt(
                    pos,
                    StmtKind::Import {
                        template,
                        alias,
                        with_context,
                    },
                ))
            }
            "from" => {
                let template = parse_expr(&mut tag.cursor, &mut self.ids)?;
                tag.cursor.expect_keyword("import")?;
                let mut names = Vec::new();
                loop {
                    let (name, _) = tag.cursor.expect_ident()?;
                    let alias = if tag.cursor.eat_keyword("as") {
                        Some(tag.cursor.expect_ident()?.0)
                    } else {
                        None
                    };
                    names.push((name, alias));
                    if !tag.cursor.eat_punct(",") {
                        break;
                    }
                }
                let with_context = Self::parse_context_modifier(&mut tag.cursor)?;
                Ok(self.stmt(
                    pos,
                    StmtKind::FromImport {
                        template,
                        names,
                        with_context,
                    },
                ))
            }
            "option" => {
                let (name, _) = tag.cursor.expect_ident()?;
                tag.cursor.expect_punct("=")?;
                let value = parse_expr(&mut tag.cursor, &mut self.ids)?;
                tag.cursor.expect_eof()?;
                Ok(self.stmt(pos, StmtKind::Option { name, value }))
            }
            "ext" => {
                let (name, _) = tag.cursor.expect_ident()?;
                let mut args = Vec::new();
                if tag.cursor.eat_punct("(") {
                    let (positional, _) = parse_call_args(&mut tag.cursor, &mut self.ids)?;
                    args = positional;
                }
                tag.cursor.expect_eof()?;
                let (body, close) = self.parse_until(&["endext"])?;
                close.cursor.expect_eof()?;
                Ok(self.stmt(
                    pos,
                    StmtKind::CallExtension {
                        name,
                        args,
                        bodies: vec![Rc::new(body)],
                    },
                ))
            }
            other => Err(CompileError::new(format!("unknown tag {other:?}"), pos)),
        }
    }

    fn parse_context_modifier(cursor: &mut Cursor) -> Result<bool, CompileError> {
        if cursor.eat_keyword("with") {
            cursor.expect_keyword("context")?;
            cursor.expect_eof()?;
            Ok(true)
        } else if cursor.eat_keyword("without") {
            cursor.expect_keyword("context")?;
            cursor.expect_eof()?;
            Ok(false)
        } else {
            cursor.expect_eof()?;
            Ok(false)
        }
    }

    /// Parse `name[, name = default]*)`, consuming the closing paren.
    fn parse_params(&mut self, cursor: &mut Cursor) -> Result<Vec<Param>, CompileError> {
        let mut params = Vec::new();
        while !cursor.eat_punct(")") {
            let (name, _) = cursor.expect_ident()?;
            let default = if cursor.eat_punct("=") {
                Some(parse_expr(cursor, &mut self.ids)?)
            } else {
                None
            };
            params.push(Param { name, default });
            if !cursor.eat_punct(",") {
                cursor.expect_punct(")")?;
                break;
            }
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::{SyntaxConfig, TemplateParser};
    use crate::ast::StmtKind;

    #[test]
    fn parses_mixed_content() {
        let (body, _) = TemplateParser::parse(
            "Hello {{ name }}!{% if x %}yes{% else %}no{% endif %}",
            &SyntaxConfig::default(),
        )
        .expect("parse");
        assert_eq!(body.stmts.len(), 4);
        assert!(matches!(body.stmts[1].kind, StmtKind::Output(_)));
        assert!(matches!(body.stmts[3].kind, StmtKind::If { .. }));
    }

    #[test]
    fn parses_loop_variants() {
        let (body, _) = TemplateParser::parse(
            "{% asyncAll item in items limit 4 %}{{ item }}{% endall %}",
            &SyntaxConfig::default(),
        )
        .expect("parse");
        let StmtKind::For {
            mode,
            concurrent_limit,
            ..
        } = &body.stmts[0].kind
        else {
            panic!("expected for");
        };
        assert_eq!(*mode, crate::ast::LoopMode::Parallel);
        assert!(concurrent_limit.is_some());
    }

    #[test]
    fn custom_delimiters() {
        let cfg = SyntaxConfig {
            variable_start: "<<".to_string(),
            variable_end: ">>".to_string(),
            ..SyntaxConfig::default()
        };
        let (body, _) = TemplateParser::parse("a << x >> b", &cfg).expect("parse");
        assert_eq!(body.stmts.len(), 3);
    }

    #[test]
    fn comment_is_dropped() {
        let (body, _) =
            TemplateParser::parse("a{# note #}b", &SyntaxConfig::default()).expect("parse");
        assert_eq!(body.stmts.len(), 2);
    }

    #[test]
    fn whitespace_control_trims() {
        let (body, _) =
            TemplateParser::parse("a  {%- if x %}b{% endif -%}  c", &SyntaxConfig::default())
                .expect("parse");
        let StmtKind::Text(first) = &body.stmts[0].kind else {
            panic!("expected text");
        };
        assert_eq!(first, "a");
    }
}
