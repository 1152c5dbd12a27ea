//! Trigger conditions: a small closed predicate language over event fields.
//!
//! Conditions are parsed once into a [`Condition`] tree and evaluated without
//! side effects. There is no general expression interpreter: the only things a
//! condition can do are read `type`, `seq`, or a payload path and compare it
//! against a literal.
//!
//! ```text
//! type == "step_completed" && payload.step_kind == "deploy"
//! exists payload.pr && !(payload.labels contains "wip")
//! event.severity >= 3 || payload.service matches "billing-*"
//! ```
//!
//! `event.<key>` is shorthand for `payload.<key>` (except `event.type` and
//! `event.seq`). A missing field never matches, except under `!=`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConditionError;
use crate::event::Event;

pub type ConditionResult<T> = std::result::Result<T, ConditionError>;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// A field of an event a condition can read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Type,
    Seq,
    /// Dotted path into the payload.
    Payload(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Substring of a string, or element of an array.
    Contains,
    /// Exact match, or prefix glob when the pattern ends in `*`.
    Matches,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Contains => "contains",
            Self::Matches => "matches",
        }
    }
}

/// A compiled trigger condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Matches every event.
    Always,
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    Exists(Field),
    Compare {
        field: Field,
        op: CompareOp,
        value: Value,
    },
}

impl Condition {
    /// Shorthand for `type == "<kind>"`.
    pub fn event_type(kind: &str) -> Self {
        Self::Compare {
            field: Field::Type,
            op: CompareOp::Eq,
            value: Value::String(kind.to_string()),
        }
    }

    /// Evaluate against an event. Errors mean the condition could not be
    /// decided; callers treat that as "does not match".
    pub fn evaluate(&self, event: &Event) -> ConditionResult<bool> {
        match self {
            Self::Always => Ok(true),
            Self::All(parts) => {
                for part in parts {
                    if !part.evaluate(event)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any(parts) => {
                for part in parts {
                    if part.evaluate(event)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not(inner) => Ok(!inner.evaluate(event)?),
            Self::Exists(field) => Ok(resolve(field, event).is_some()),
            Self::Compare { field, op, value } => compare(field, *op, value, event),
        }
    }
}

fn resolve(field: &Field, event: &Event) -> Option<Value> {
    match field {
        Field::Type => Some(Value::String(event.kind.clone())),
        Field::Seq => Some(Value::from(event.seq)),
        Field::Payload(path) => event.payload_path(path).cloned(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(_) => "a boolean".into(),
        Value::Number(_) => "a number".into(),
        Value::String(_) => "a string".into(),
        Value::Array(_) => "an array".into(),
        Value::Object(_) => "an object".into(),
    }
}

fn glob_matches(text: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        text.starts_with(prefix)
    } else {
        text == pattern
    }
}

fn compare(field: &Field, op: CompareOp, literal: &Value, event: &Event) -> ConditionResult<bool> {
    let Some(actual) = resolve(field, event) else {
        return Ok(op == CompareOp::Ne);
    };
    let mismatch = || ConditionError::TypeMismatch {
        field: field.to_string(),
        op: op.symbol(),
        found: describe(&actual),
    };

    match op {
        CompareOp::Eq => Ok(values_equal(&actual, literal)),
        CompareOp::Ne => Ok(!values_equal(&actual, literal)),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let lhs = actual.as_f64().ok_or_else(mismatch)?;
            // The parser only accepts numeric literals for ordering.
            let Some(rhs) = literal.as_f64() else {
                return Ok(false);
            };
            Ok(match op {
                CompareOp::Lt => lhs < rhs,
                CompareOp::Le => lhs <= rhs,
                CompareOp::Gt => lhs > rhs,
                _ => lhs >= rhs,
            })
        }
        CompareOp::Contains => match &actual {
            Value::String(s) => Ok(literal.as_str().is_some_and(|needle| s.contains(needle))),
            Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, literal))),
            _ => Err(mismatch()),
        },
        CompareOp::Matches => match (&actual, literal.as_str()) {
            (Value::String(s), Some(pattern)) => Ok(glob_matches(s, pattern)),
            (Value::String(_), None) => Ok(false),
            _ => Err(mismatch()),
        },
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type => f.write_str("type"),
            Self::Seq => f.write_str("seq"),
            Self::Payload(path) => write!(f, "payload.{}", path.join(".")),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_joined(
            f: &mut fmt::Formatter<'_>,
            parts: &[Condition],
            sep: &str,
            wrap_any: bool,
        ) -> fmt::Result {
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    f.write_str(sep)?;
                }
                let wrap = match part {
                    Condition::Any(_) => wrap_any,
                    Condition::All(_) => !wrap_any,
                    _ => false,
                };
                if wrap {
                    write!(f, "({part})")?;
                } else {
                    write!(f, "{part}")?;
                }
            }
            Ok(())
        }

        match self {
            Self::Always => f.write_str("true"),
            Self::All(parts) => write_joined(f, parts, " && ", true),
            Self::Any(parts) => write_joined(f, parts, " || ", false),
            Self::Not(inner) => match inner.as_ref() {
                Self::All(_) | Self::Any(_) | Self::Compare { .. } => write!(f, "!({inner})"),
                _ => write!(f, "!{inner}"),
            },
            Self::Exists(field) => write!(f, "exists {field}"),
            Self::Compare { field, op, value } => write!(f, "{field} {} {value}", op.symbol()),
        }
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Str(String),
    Num(Value),
    Op(CompareOp),
    And,
    Or,
    Bang,
    LParen,
    RParen,
}

fn parse_err(offset: usize, message: impl Into<String>) -> ConditionError {
    ConditionError::Parse {
        offset,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> ConditionResult<Vec<(usize, Tok)>> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|&(_, c)| c);
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((offset, Tok::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((offset, Tok::RParen));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push((offset, Tok::And));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((offset, Tok::Or));
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push((offset, Tok::Op(CompareOp::Eq)));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((offset, Tok::Op(CompareOp::Ne)));
                i += 2;
            }
            '!' => {
                tokens.push((offset, Tok::Bang));
                i += 1;
            }
            '<' | '>' => {
                let or_equal = next == Some('=');
                let op = match (c, or_equal) {
                    ('<', false) => CompareOp::Lt,
                    ('<', true) => CompareOp::Le,
                    ('>', false) => CompareOp::Gt,
                    _ => CompareOp::Ge,
                };
                tokens.push((offset, Tok::Op(op)));
                i += if or_equal { 2 } else { 1 };
            }
            '"' => {
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&(_, c)) = chars.get(i) else {
                        return Err(parse_err(offset, "unterminated string literal"));
                    };
                    i += 1;
                    match c {
                        '"' => break,
                        '\\' => {
                            let Some(&(esc_at, esc)) = chars.get(i) else {
                                return Err(parse_err(offset, "unterminated string literal"));
                            };
                            i += 1;
                            text.push(match esc {
                                '"' => '"',
                                '\\' => '\\',
                                'n' => '\n',
                                't' => '\t',
                                other => {
                                    return Err(parse_err(
                                        esc_at,
                                        format!("unknown escape `\\{other}`"),
                                    ));
                                }
                            });
                        }
                        c => text.push(c),
                    }
                }
                tokens.push((offset, Tok::Str(text)));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while chars
                    .get(i)
                    .is_some_and(|&(_, c)| c.is_ascii_digit() || c == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|&(_, c)| c).collect();
                let value = if text.contains('.') {
                    text.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                } else {
                    text.parse::<i64>().ok().map(Value::from)
                };
                let value = value.ok_or_else(|| parse_err(offset, format!("bad number `{text}`")))?;
                tokens.push((offset, Tok::Num(value)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|&(_, c)| c.is_alphanumeric() || c == '_' || c == '.' || c == '-')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|&(_, c)| c).collect();
                let tok = match word.as_str() {
                    "contains" => Tok::Op(CompareOp::Contains),
                    "matches" => Tok::Op(CompareOp::Matches),
                    _ => Tok::Word(word),
                };
                tokens.push((offset, tok));
            }
            other => return Err(parse_err(offset, format!("unexpected character `{other}`"))),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Tok)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(o, _)| *o)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> ConditionResult<Condition> {
        let mut parts = vec![self.parse_and()?];
        while self.peek() == Some(&Tok::Or) {
            self.bump();
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Condition::Any(parts)
        })
    }

    fn parse_and(&mut self) -> ConditionResult<Condition> {
        let mut parts = vec![self.parse_unary()?];
        while self.peek() == Some(&Tok::And) {
            self.bump();
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Condition::All(parts)
        })
    }

    fn parse_unary(&mut self) -> ConditionResult<Condition> {
        let offset = self.offset();
        match self.bump() {
            Some(Tok::Bang) => Ok(Condition::Not(Box::new(self.parse_unary()?))),
            Some(Tok::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Tok::RParen) => Ok(inner),
                    _ => Err(parse_err(self.offset(), "expected `)`")),
                }
            }
            Some(Tok::Word(word)) if word == "true" => Ok(Condition::Always),
            Some(Tok::Word(word)) if word == "exists" => {
                let offset = self.offset();
                match self.bump() {
                    Some(Tok::Word(name)) => Ok(Condition::Exists(parse_field(&name, offset)?)),
                    _ => Err(parse_err(offset, "expected a field after `exists`")),
                }
            }
            Some(Tok::Word(name)) => {
                let field = parse_field(&name, offset)?;
                self.parse_comparison(field)
            }
            Some(_) => Err(parse_err(offset, "expected a field, `!`, `(` or `exists`")),
            None => Err(parse_err(offset, "unexpected end of condition")),
        }
    }

    fn parse_comparison(&mut self, field: Field) -> ConditionResult<Condition> {
        let op_offset = self.offset();
        let op = match self.bump() {
            Some(Tok::Op(op)) => op,
            _ => return Err(parse_err(op_offset, "expected a comparison operator")),
        };
        let lit_offset = self.offset();
        let value = match self.bump() {
            Some(Tok::Str(s)) => Value::String(s),
            Some(Tok::Num(n)) => n,
            Some(Tok::Word(w)) if w == "true" => Value::Bool(true),
            Some(Tok::Word(w)) if w == "false" => Value::Bool(false),
            Some(Tok::Word(w)) if w == "null" => Value::Null,
            _ => return Err(parse_err(lit_offset, "expected a literal")),
        };
        let ordering = matches!(
            op,
            CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge
        );
        if ordering && !value.is_number() {
            return Err(parse_err(lit_offset, "ordering operators need a number"));
        }
        if op == CompareOp::Matches && !value.is_string() {
            return Err(parse_err(lit_offset, "`matches` needs a string pattern"));
        }
        Ok(Condition::Compare { field, op, value })
    }
}

fn parse_field(name: &str, offset: usize) -> ConditionResult<Field> {
    let segments: Vec<&str> = name.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(parse_err(offset, format!("malformed field `{name}`")));
    }
    let owned = |rest: &[&str]| rest.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    match segments.as_slice() {
        ["type"] | ["event", "type"] => Ok(Field::Type),
        ["seq"] | ["event", "seq"] => Ok(Field::Seq),
        ["payload", rest @ ..] | ["event", rest @ ..] if !rest.is_empty() => {
            Ok(Field::Payload(owned(rest)))
        }
        _ => Err(parse_err(
            offset,
            format!("unknown field `{name}`; use type, seq, or payload.<key>"),
        )),
    }
}

/// Parse condition source text.
pub fn parse(source: &str) -> ConditionResult<Condition> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(parse_err(0, "empty condition"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: source.len(),
    };
    let condition = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(parse_err(parser.offset(), "unexpected trailing input"));
    }
    Ok(condition)
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}
