//! Script parser.
//!
//! Scripts are read line by line. Blank lines, `#` comments and `connect`
//! lines are skipped; command lines have the form
//! `tcf <service> <command> <arguments...>`.
//!
//! Arguments are split on whitespace. A quoted segment (`"..."`) or a
//! structured segment (`{...}`, `[...]`) keeps absorbing the following
//! pieces until its delimiters balance. Bare pieces are tried as `null`, a
//! boolean, a 32-bit then 64-bit integer, a float then a double, and are
//! otherwise taken as plain strings.

use std::{str::SplitWhitespace, sync::LazyLock};

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::token::{Argument, Token};

// The patterns are literals; compiling them cannot fail.
static EMPTY_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*$").expect("valid regex"));
static COMMENT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#").expect("valid regex"));
static CONNECT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*connect\s+").expect("valid regex"));
static COMMAND_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*tcf\s+(\w+)\s+(\w+)(.*)$").expect("valid regex"));

/// Script parse error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Line {line}: not a command: {text}")]
    NotACommand { line: usize, text: String },
    #[error("Line {line}: unbalanced {delimiter} in '{segment}'")]
    Unbalanced {
        line: usize,
        delimiter: char,
        segment: String,
    },
    #[error("Line {line}: invalid structured argument '{segment}': {message}")]
    InvalidStructure {
        line: usize,
        segment: String,
        message: String,
    },
}

impl ParseError {
    /// 1-based line the error was found on.
    #[must_use]
    pub const fn line(&self) -> usize {
        match self {
            Self::NotACommand { line, .. }
            | Self::Unbalanced { line, .. }
            | Self::InvalidStructure { line, .. } => *line,
        }
    }
}

/// Whether `segment` contains at least one `opening` marker and as many
/// `closing` markers.
///
/// When both markers are the same character, occurrences alternate between
/// opening and closing.
#[must_use]
pub fn is_complete(segment: &str, opening: char, closing: char) -> bool {
    let (mut opened, mut closed) = (0usize, 0usize);
    for c in segment.chars() {
        if opening == closing {
            if c == opening {
                if opened > closed {
                    closed += 1;
                } else {
                    opened += 1;
                }
            }
        } else if c == opening {
            opened += 1;
        } else if c == closing {
            closed += 1;
        }
    }
    opened > 0 && opened == closed
}

/// Script parser.
///
/// The lenient parser (the default) skips lines it does not understand and
/// falls back to plain strings for unbalanced or unparseable segments. The
/// strict parser reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Parser {
    strict: bool,
}

impl Parser {
    #[must_use]
    pub const fn lenient() -> Self {
        Self { strict: false }
    }

    #[must_use]
    pub const fn strict() -> Self {
        Self { strict: true }
    }

    #[must_use]
    pub const fn is_strict(&self) -> bool {
        self.strict
    }

    /// Parse `script` into tokens, in script order.
    ///
    /// # Errors
    /// Strict parsers only: returns the first offending line.
    pub fn parse(&self, script: &str) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        for (index, line) in script.lines().enumerate() {
            let number = index + 1;
            if EMPTY_LINE.is_match(line)
                || COMMENT_LINE.is_match(line)
                || CONNECT_LINE.is_match(line)
            {
                continue;
            }
            let Some(captures) = COMMAND_LINE.captures(line) else {
                if self.strict {
                    return Err(ParseError::NotACommand {
                        line: number,
                        text: line.trim().to_string(),
                    });
                }
                continue;
            };
            let arguments = self.parse_arguments(number, &captures[3])?;
            tokens.push(Token::new(&captures[1], &captures[2], arguments));
        }
        Ok(tokens)
    }

    fn parse_arguments(&self, line: usize, text: &str) -> Result<Vec<Argument>, ParseError> {
        let mut arguments = Vec::new();
        let mut pieces = text.split_whitespace();
        while let Some(piece) = pieces.next() {
            let argument = if piece == "null" {
                Argument::Null
            } else if piece.starts_with('"') {
                self.quoted(line, piece, &mut pieces)?
            } else if let Some(simple) = simple(piece) {
                simple
            } else if piece.starts_with('{') {
                self.structured(line, piece, &mut pieces, '{', '}')?
            } else if piece.starts_with('[') {
                self.structured(line, piece, &mut pieces, '[', ']')?
            } else {
                Argument::String(piece.to_string())
            };
            arguments.push(argument);
        }
        Ok(arguments)
    }

    fn quoted(
        &self,
        line: usize,
        first: &str,
        pieces: &mut SplitWhitespace<'_>,
    ) -> Result<Argument, ParseError> {
        let (segment, complete) = accumulate(first, pieces, '"', '"');
        if complete {
            let segment = segment.trim();
            let segment = segment.strip_prefix('"').unwrap_or(segment);
            let segment = segment.strip_suffix('"').unwrap_or(segment);
            return Ok(Argument::String(segment.to_string()));
        }
        if self.strict {
            return Err(ParseError::Unbalanced {
                line,
                delimiter: '"',
                segment,
            });
        }
        Ok(Argument::String(segment))
    }

    fn structured(
        &self,
        line: usize,
        first: &str,
        pieces: &mut SplitWhitespace<'_>,
        opening: char,
        closing: char,
    ) -> Result<Argument, ParseError> {
        let (segment, complete) = accumulate(first, pieces, opening, closing);
        if !complete {
            if self.strict {
                return Err(ParseError::Unbalanced {
                    line,
                    delimiter: opening,
                    segment,
                });
            }
            return Ok(Argument::String(segment));
        }
        match serde_json::from_str::<Value>(&segment) {
            Ok(Value::Object(map)) if opening == '{' => Ok(Argument::Map(map)),
            Ok(Value::Array(list)) if opening == '[' => Ok(Argument::List(list)),
            Ok(_) => self.invalid(line, segment, "unexpected value type".to_string()),
            Err(e) => self.invalid(line, segment, e.to_string()),
        }
    }

    fn invalid(
        &self,
        line: usize,
        segment: String,
        message: String,
    ) -> Result<Argument, ParseError> {
        if self.strict {
            Err(ParseError::InvalidStructure {
                line,
                segment,
                message,
            })
        } else {
            Ok(Argument::String(segment))
        }
    }
}

/// Join pieces with single spaces until the delimiters balance or the line
/// runs out.
fn accumulate(
    first: &str,
    pieces: &mut SplitWhitespace<'_>,
    opening: char,
    closing: char,
) -> (String, bool) {
    let mut segment = first.to_string();
    let mut complete = is_complete(&segment, opening, closing);
    while !complete {
        let Some(next) = pieces.next() else { break };
        segment.push(' ');
        segment.push_str(next);
        complete = is_complete(&segment, opening, closing);
    }
    (segment, complete)
}

/// Booleans and numbers.
fn simple(piece: &str) -> Option<Argument> {
    if piece.eq_ignore_ascii_case("true") {
        return Some(Argument::Bool(true));
    }
    if piece.eq_ignore_ascii_case("false") {
        return Some(Argument::Bool(false));
    }
    if let Some(value) = decode_integer(piece) {
        if let Ok(i) = i32::try_from(value) {
            return Some(Argument::Int(i));
        }
        if let Ok(l) = i64::try_from(value) {
            return Some(Argument::Long(l));
        }
    }
    if !piece.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    if let Ok(f) = piece.parse::<f32>() {
        if f.is_finite() {
            return Some(Argument::Float(f));
        }
    }
    match piece.parse::<f64>() {
        Ok(d) if d.is_finite() => Some(Argument::Double(d)),
        _ => None,
    }
}

/// Decimal, `0x`/`0X`/`#` hexadecimal or leading-zero octal integer with an
/// optional sign.
fn decode_integer(piece: &str) -> Option<i128> {
    let (negative, rest) = match piece.as_bytes().first()? {
        b'-' => (true, &piece[1..]),
        b'+' => (false, &piece[1..]),
        _ => (false, piece),
    };
    let (radix, digits) = if let Some(hex) = rest
        .strip_prefix("0x")
        .or_else(|| rest.strip_prefix("0X"))
        .or_else(|| rest.strip_prefix('#'))
    {
        (16, hex)
    } else if rest.len() > 1 && rest.starts_with('0') {
        (8, &rest[1..])
    } else {
        (10, rest)
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let magnitude = i128::from(u64::from_str_radix(digits, radix).ok()?);
    Some(if negative { -magnitude } else { magnitude })
}
