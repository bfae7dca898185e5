#![forbid(unsafe_code)]

//! Path tokenizer.
//!
//! Grammar: `ident ( "." ident | "[" digits "]" | "[" quoted "]" )*` where
//! `ident` is `[A-Za-z0-9_$-]+` and `quoted` is a `"` or `'` delimited
//! string in which a backslash escapes the next character.
//!
//! The tokenizer only checks syntax. Whether the addressed value exists is
//! the resolver's concern.

use std::fmt;

use crate::error::PathSyntaxError;

/// One segment after the top-level key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Token {
    /// `.name`
    Prop(String),
    /// `[3]`
    Index(usize),
    /// `["key"]`
    Key(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prop(name) => write!(f, ".{name}"),
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Key(key) => {
                f.write_str("[\"")?;
                for c in key.chars() {
                    if matches!(c, '"' | '\\') {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"]")
            }
        }
    }
}

/// A tokenized path: the top-level key plus the remaining segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParsedPath {
    pub top: String,
    pub rest: Vec<Token>,
}

impl ParsedPath {
    #[must_use]
    pub fn key(top: impl Into<String>) -> Self {
        Self {
            top: top.into(),
            rest: Vec::new(),
        }
    }

    /// Whether the path names a single top-level key.
    #[must_use]
    pub fn is_simple(&self) -> bool {
        self.rest.is_empty()
    }

    /// Number of segments including the top-level key.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rest.len() + 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Display form of every segment, top first.
    #[must_use]
    pub fn segments(&self) -> Vec<String> {
        std::iter::once(self.top.clone())
            .chain(self.rest.iter().map(ToString::to_string))
            .collect()
    }
}

impl fmt::Display for ParsedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.top)?;
        for token in &self.rest {
            write!(f, "{token}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ParsedPath {
    type Err = PathSyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_path(s)
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'$' | b'-')
}

fn ident(input: &str, pos: &mut usize) -> Result<String, PathSyntaxError> {
    let start = *pos;
    let bytes = input.as_bytes();
    while *pos < bytes.len() && is_ident_byte(bytes[*pos]) {
        *pos += 1;
    }
    if *pos == start {
        return Err(PathSyntaxError::new(input, start, "expected identifier"));
    }
    Ok(input[start..*pos].to_string())
}

fn quoted(input: &str, pos: &mut usize, quote: char) -> Result<String, PathSyntaxError> {
    let open = *pos;
    let mut out = String::new();
    let mut chars = input[open + 1..].char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, escaped)) => out.push(escaped),
                None => break,
            },
            c if c == quote => {
                *pos = open + 1 + i + c.len_utf8();
                return Ok(out);
            }
            c => out.push(c),
        }
    }
    Err(PathSyntaxError::new(input, open, "unterminated quoted key"))
}

fn close_bracket(input: &str, pos: &mut usize, open: usize) -> Result<(), PathSyntaxError> {
    match input.as_bytes().get(*pos) {
        Some(b']') => {
            *pos += 1;
            Ok(())
        }
        Some(_) => Err(PathSyntaxError::new(input, *pos, "expected ']'")),
        None => Err(PathSyntaxError::new(input, open, "unterminated bracket")),
    }
}

/// Tokenize `input`.
pub fn parse_path(input: &str) -> Result<ParsedPath, PathSyntaxError> {
    let bytes = input.as_bytes();
    let mut pos = 0;
    let top = ident(input, &mut pos)?;
    let mut rest = Vec::new();

    while pos < bytes.len() {
        match bytes[pos] {
            b'.' => {
                pos += 1;
                rest.push(Token::Prop(ident(input, &mut pos)?));
            }
            b'[' => {
                let open = pos;
                pos += 1;
                match bytes.get(pos) {
                    Some(&q @ (b'"' | b'\'')) => {
                        let key = quoted(input, &mut pos, char::from(q))?;
                        close_bracket(input, &mut pos, open)?;
                        rest.push(Token::Key(key));
                    }
                    Some(b) if b.is_ascii_digit() => {
                        let start = pos;
                        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                            pos += 1;
                        }
                        let index = input[start..pos]
                            .parse::<usize>()
                            .map_err(|_| PathSyntaxError::new(input, start, "index too large"))?;
                        close_bracket(input, &mut pos, open)?;
                        rest.push(Token::Index(index));
                    }
                    Some(b']') => return Err(PathSyntaxError::new(input, pos, "empty brackets")),
                    Some(_) => {
                        return Err(PathSyntaxError::new(
                            input,
                            pos,
                            "index must be digits or a quoted key",
                        ));
                    }
                    None => return Err(PathSyntaxError::new(input, open, "unterminated bracket")),
                }
            }
            _ => {
                let c = input[pos..].chars().next().unwrap_or_default();
                return Err(PathSyntaxError::new(
                    input,
                    pos,
                    format!("unexpected character '{c}'"),
                ));
            }
        }
    }
    Ok(ParsedPath { top, rest })
}
