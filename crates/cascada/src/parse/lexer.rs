use crate::error::{CompileError, Pos};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub kind: TokKind,
    pub pos: Pos,
}

/// Advance a position across `text`.
pub(crate) fn advance_pos(mut pos: Pos, text: &str) -> Pos {
    for ch in text.chars() {
        if ch == '\n' {
            pos.line += 1;
            pos.col = 1;
        } else {
            pos.col += 1;
        }
    }
    pos
}

const TWO_CHAR: &[&str] = &["**", "//", "==", "!=", "<=", ">="];
const ONE_CHAR: &[&str] = &[
    "(", ")", "[", "]", "{", "}", ",", ":", ".", "|", "~", "+", "-", "*", "/", "%", "<", ">", "=",
    "!", "@",
];

/// Tokenize one expression/tag/line. `base` is the source position of the
/// first byte of `src`.
pub(crate) fn tokenize(src: &str, base: Pos) -> Result<Vec<Token>, CompileError> {
    let mut tokens = Vec::new();
    let bytes = src.as_bytes();
    let mut i = 0;
    let mut pos = base;

    while i < bytes.len() {
        let rest = &src[i..];
        let ch = rest.chars().next().unwrap_or('\0');

        if ch.is_whitespace() {
            let mut end = 0;
            for c in rest.chars() {
                if !c.is_whitespace() {
                    break;
                }
                end += c.len_utf8();
            }
            pos = advance_pos(pos, &rest[..end]);
            i += end;
            continue;
        }

        if ch == '"' || ch == '\'' {
            let (s, consumed) = scan_string(rest, pos)?;
            tokens.push(Token {
                kind: TokKind::Str(s),
                pos,
            });
            pos = advance_pos(pos, &rest[..consumed]);
            i += consumed;
            continue;
        }

        if ch.is_ascii_digit() {
            let (kind, consumed) = scan_number(rest, pos)?;
            tokens.push(Token { kind, pos });
            pos = advance_pos(pos, &rest[..consumed]);
            i += consumed;
            continue;
        }

        if ch.is_alphabetic() || ch == '_' {
            let mut end = 0;
            for c in rest.chars() {
                if !c.is_alphanumeric() && c != '_' {
                    break;
                }
                end += c.len_utf8();
            }
            tokens.push(Token {
                kind: TokKind::Ident(rest[..end].to_string()),
                pos,
            });
            pos = advance_pos(pos, &rest[..end]);
            i += end;
            continue;
        }

        if let Some(p) = TWO_CHAR.iter().find(|p| rest.starts_with(**p)) {
            tokens.push(Token {
                kind: TokKind::Punct(p),
                pos,
            });
            pos = advance_pos(pos, p);
            i += p.len();
            continue;
        }

        if let Some(p) = ONE_CHAR.iter().find(|p| rest.starts_with(**p)) {
            tokens.push(Token {
                kind: TokKind::Punct(p),
                pos,
            });
            pos = advance_pos(pos, p);
            i += p.len();
            continue;
        }

        return Err(CompileError::new(
            format!("unexpected character {ch:?}"),
            pos,
        ));
    }

    tokens.push(Token {
        kind: TokKind::Eof,
        pos,
    });
    Ok(tokens)
}

fn scan_string(rest: &str, pos: Pos) -> Result<(String, usize), CompileError> {
    let mut chars = rest.char_indices();
    let Some((_, quote)) = chars.next() else {
        return Err(CompileError::new("unterminated string literal", pos));
    };
    let mut out = String::new();
    while let Some((idx, ch)) = chars.next() {
        match ch {
            c if c == quote => return Ok((out, idx + c.len_utf8())),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, c)) if c == quote => out.push(c),
                Some((_, c)) => {
                    out.push('\\');
                    out.push(c);
                }
                None => break,
            },
            c => out.push(c),
        }
    }
    Err(CompileError::new("unterminated string literal", pos))
}

fn scan_number(rest: &str, pos: Pos) -> Result<(TokKind, usize), CompileError> {
    let mut end = 0;
    let mut saw_dot = false;
    let bytes = rest.as_bytes();
    while end < bytes.len() {
        let c = bytes[end] as char;
        if c.is_ascii_digit() {
            end += 1;
        } else if c == '.' && !saw_dot && bytes.get(end + 1).is_some_and(u8::is_ascii_digit) {
            saw_dot = true;
            end += 1;
        } else {
            break;
        }
    }
    let text = &rest[..end];
    if saw_dot {
        let value: f64 = text
            .parse()
            .map_err(|_| CompileError::new(format!("invalid number {text:?}"), pos))?;
        Ok((TokKind::Float(value), end))
    } else {
        match text.parse::<i64>() {
            Ok(value) => Ok((TokKind::Int(value), end)),
            Err(_) => {
                let value: f64 = text
                    .parse()
                    .map_err(|_| CompileError::new(format!("invalid number {text:?}"), pos))?;
                Ok((TokKind::Float(value), end))
            }
        }
    }
}
