// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The argument grammar shared by both protocol directions.
//!
//! Values are Python-repr-compatible: `'…'` or `"…"` strings with the
//! escapes `\n \r \t \\ \' \" \xHH`, decimal integers, and floats with an
//! optional exponent. Tokens are separated by whitespace. Malformed input
//! is reported through a parser-error list; scanning continues past the
//! bad token so one garbled argument does not take down the whole line.

use std::fmt;
use thiserror::Error;

/// A single protocol value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// A string.
    Str(String),
    /// A decimal integer.
    Int(i64),
    /// A float, possibly with an exponent.
    Float(f64),
}

impl Value {
    /// Convenience constructor from anything string-like.
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Returns the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    /// Renders the value in its wire form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(&render_str(s)),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => f.write_str(&render_float(*x)),
        }
    }
}

/// A recoverable problem found while scanning an argument list.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ParseError {
    /// Human-readable description of the problem.
    pub message: String,
}

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The outcome of scanning an argument list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Parsed {
    /// The values that scanned cleanly, in input order.
    pub values: Vec<Value>,
    /// Problems encountered along the way.
    pub errors: Vec<ParseError>,
}

enum State {
    Idle,
    Str { delim: char, token: String, escape: Escape },
    Number { token: String },
}

enum Escape {
    None,
    Backslash,
    Hex(String),
}

/// Scans an argument list.
pub fn parse_args(input: &str) -> Parsed {
    let mut out = Parsed::default();
    let mut state = State::Idle;

    for ch in input.chars() {
        state = step(state, ch, &mut out);
    }

    // End of line: numbers complete implicitly, strings do not.
    match state {
        State::Idle => {}
        State::Number { token } => finish_number(&token, &mut out),
        State::Str { token, escape, .. } => {
            if !matches!(escape, Escape::None) {
                out.errors
                    .push(ParseError::new("dangling escape at end of line"));
            }
            out.errors.push(ParseError::new(format!(
                "unterminated string at end of line: {token:?}"
            )));
            out.values.push(Value::Str(token));
        }
    }

    out
}

fn step(state: State, ch: char, out: &mut Parsed) -> State {
    match state {
        State::Idle => match ch {
            ' ' | '\t' | '\r' | '\n' => State::Idle,
            '\'' | '"' => State::Str {
                delim: ch,
                token: String::new(),
                escape: Escape::None,
            },
            '-' | '.' | '0'..='9' => State::Number {
                token: ch.to_string(),
            },
            '\\' => {
                out.errors
                    .push(ParseError::new("invalid position for backslash, ignored"));
                State::Idle
            }
            other => {
                out.errors.push(ParseError::new(format!(
                    "invalid character outside of token: {other:?}"
                )));
                State::Idle
            }
        },

        State::Number { mut token } => match ch {
            '0'..='9' | '.' | 'e' | 'E' | '+' | '-' => {
                token.push(ch);
                State::Number { token }
            }
            ' ' | '\t' | '\r' | '\n' => {
                finish_number(&token, out);
                State::Idle
            }
            // A quote while scanning a number is the grammar's ambiguous
            // leading-digit case; the number token is abandoned and the
            // quote starts a fresh string.
            '\'' | '"' => {
                out.errors.push(ParseError::new(format!(
                    "quote inside number token {token:?}"
                )));
                State::Str {
                    delim: ch,
                    token: String::new(),
                    escape: Escape::None,
                }
            }
            other => {
                out.errors.push(ParseError::new(format!(
                    "invalid character in number token: {other:?}"
                )));
                State::Number { token }
            }
        },

        State::Str {
            delim,
            mut token,
            escape,
        } => {
            let escape = match escape {
                Escape::Hex(mut hex) => {
                    if ch.is_ascii_hexdigit() {
                        hex.push(ch);
                        if hex.len() == 2 {
                            // Two hex digits always form a valid byte.
                            let byte = u8::from_str_radix(&hex, 16)
                                .expect("two hex digits parse as a byte");
                            token.push(char::from(byte));
                            Escape::None
                        } else {
                            Escape::Hex(hex)
                        }
                    } else {
                        out.errors.push(ParseError::new(format!(
                            "invalid hex escape digit: {ch:?}"
                        )));
                        Escape::None
                    }
                }
                Escape::Backslash => {
                    match ch {
                        'n' => token.push('\n'),
                        'r' => token.push('\r'),
                        't' => token.push('\t'),
                        '\\' => token.push('\\'),
                        '\'' => token.push('\''),
                        '"' => token.push('"'),
                        'x' => return State::Str {
                            delim,
                            token,
                            escape: Escape::Hex(String::new()),
                        },
                        other => {
                            out.errors.push(ParseError::new(format!(
                                "unknown escape character: {other:?}"
                            )));
                        }
                    }
                    Escape::None
                }
                Escape::None => {
                    if ch == '\\' {
                        Escape::Backslash
                    } else if ch == delim {
                        out.values.push(Value::Str(token));
                        return State::Idle;
                    } else {
                        token.push(ch);
                        Escape::None
                    }
                }
            };
            State::Str {
                delim,
                token,
                escape,
            }
        }
    }
}

fn finish_number(token: &str, out: &mut Parsed) {
    let looks_float = token.contains(['.', 'e', 'E']);
    if looks_float {
        match token.parse::<f64>() {
            Ok(x) => out.values.push(Value::Float(x)),
            Err(_) => out
                .errors
                .push(ParseError::new(format!("malformed number: {token:?}"))),
        }
    } else {
        match token.parse::<i64>() {
            Ok(n) => out.values.push(Value::Int(n)),
            Err(_) => out
                .errors
                .push(ParseError::new(format!("malformed number: {token:?}"))),
        }
    }
}

/// Renders a space-separated argument list.
pub fn render_args(values: &[Value]) -> String {
    let mut out = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&value.to_string());
    }
    out
}

fn render_str(s: &str) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\'' => out.push_str("\\'"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn render_float(x: f64) -> String {
    let s = format!("{x}");
    // A float must reparse as a float, so force a decimal point onto
    // integral values.
    if s.contains(['.', 'e', 'E']) {
        s
    } else {
        format!("{s}.0")
    }
}
