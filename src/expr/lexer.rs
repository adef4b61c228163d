//! Tokenizer for band-math expressions.
//!
//! The lexer accepts a superset of what the evaluator allows (strings,
//! brackets, dots, assignment) so that unsupported constructs are reported
//! as disallowed syntax rather than as confusing parse errors.

use crate::error::ExpressionError;

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Ident(String),
    Str(String),
    /// Operator or punctuation, e.g. `**`, `<=`, `(`
    Punct(&'static str),
    /// Statement separator: `;` or a newline
    Separator,
    End,
}

/// A token and its byte offset in the source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

// Longest first so that `**` wins over `*`
const PUNCTUATION: &[&str] = &[
    "**", "//", "<<", ">>", "<=", ">=", "==", "!=", "+", "-", "*", "/", "%", "~", "&", "|", "^",
    "<", ">", "(", ")", "[", "]", "{", "}", ",", ".", ":", "=", "@",
];

fn parse_error(position: usize, message: impl Into<String>) -> ExpressionError {
    ExpressionError::Parse {
        position,
        message: message.into(),
    }
}

/// Split `source` into tokens, ending with [`Token::End`].
pub fn tokenize(source: &str) -> Result<Vec<Spanned>, ExpressionError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let ch = bytes[pos];

        if ch == b'\n' || ch == b';' {
            tokens.push(Spanned {
                token: Token::Separator,
                position: pos,
            });
            pos += 1;
            continue;
        }
        if ch.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        let start = pos;

        if ch.is_ascii_digit() || (ch == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit))
        {
            pos = scan_number(bytes, pos);
            let text = &source[start..pos];
            let value = text
                .parse::<f64>()
                .map_err(|_| parse_error(start, format!("invalid number literal '{}'", text)))?;
            tokens.push(Spanned {
                token: Token::Number(value),
                position: start,
            });
            continue;
        }

        if ch.is_ascii_alphabetic() || ch == b'_' {
            while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                pos += 1;
            }
            tokens.push(Spanned {
                token: Token::Ident(source[start..pos].to_string()),
                position: start,
            });
            continue;
        }

        if ch == b'"' || ch == b'\'' {
            pos += 1;
            while pos < bytes.len() && bytes[pos] != ch {
                pos += if bytes[pos] == b'\\' { 2 } else { 1 };
            }
            if pos >= bytes.len() {
                return Err(parse_error(start, "unterminated string literal"));
            }
            pos += 1;
            tokens.push(Spanned {
                token: Token::Str(source[start + 1..pos - 1].to_string()),
                position: start,
            });
            continue;
        }

        match PUNCTUATION
            .iter()
            .find(|p| source[pos..].starts_with(**p))
        {
            Some(p) => {
                tokens.push(Spanned {
                    token: Token::Punct(p),
                    position: start,
                });
                pos += p.len();
            }
            None => {
                let unexpected = source[pos..].chars().next().unwrap_or('?');
                return Err(parse_error(
                    start,
                    format!("unexpected character '{}'", unexpected),
                ));
            }
        }
    }

    tokens.push(Spanned {
        token: Token::End,
        position: bytes.len(),
    });
    Ok(tokens)
}

/// End offset of the number literal starting at `pos`.
fn scan_number(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos < bytes.len() && bytes[pos] == b'.' {
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
    }
    if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
        let mut exp = pos + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            pos = exp;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
        }
    }
    pos
}
