//! SQL-like attribute predicates.
//!
//! Used by the source filter (rows matching the predicate are removed from
//! the working copy) and by stores to evaluate row selections.
//!
//! ```text
//! expr    := and (OR and)*
//! and     := not (AND not)*
//! not     := NOT not | primary
//! primary := '(' expr ')'
//!          | field cmp literal
//!          | field [NOT] IN '(' literal (',' literal)* ')'
//!          | field IS [NOT] NULL
//!          | field [NOT] LIKE 'pattern'
//! ```
//!
//! Keywords are case-insensitive. An empty expression is an error; absence
//! of a predicate is expressed as `Option::None` by callers.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PredicateError;
use crate::types::{Feature, Value};

/// A parsed predicate together with its source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Predicate {
    source: String,
    expr: Expr,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Predicate syntax tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
        negated: bool,
    },
    IsNull {
        field: String,
        negated: bool,
    },
    Like {
        field: String,
        pattern: String,
        negated: bool,
    },
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self, PredicateError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(PredicateError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr()?;
        if let Some(tok) = parser.peek() {
            return Err(PredicateError::Trailing {
                found: tok.to_string(),
            });
        }
        Ok(Self {
            source: source.trim().to_owned(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn matches(&self, feature: &Feature) -> bool {
        self.expr.eval(feature)
    }
}

impl FromStr for Predicate {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Predicate {
    type Error = PredicateError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Predicate> for String {
    fn from(p: Predicate) -> Self {
        p.source
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.source.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Expr {
    pub fn eval(&self, feature: &Feature) -> bool {
        match self {
            Expr::Or(a, b) => a.eval(feature) || b.eval(feature),
            Expr::And(a, b) => a.eval(feature) && b.eval(feature),
            Expr::Not(e) => !e.eval(feature),
            Expr::Compare { field, op, value } => {
                let Some(ord) = compare_values(feature.get(field), value) else {
                    return false;
                };
                match op {
                    CompareOp::Eq => ord == Ordering::Equal,
                    CompareOp::Ne => ord != Ordering::Equal,
                    CompareOp::Lt => ord == Ordering::Less,
                    CompareOp::Le => ord != Ordering::Greater,
                    CompareOp::Gt => ord == Ordering::Greater,
                    CompareOp::Ge => ord != Ordering::Less,
                }
            }
            Expr::In {
                field,
                values,
                negated,
            } => {
                let actual = feature.get(field);
                if actual.is_null() {
                    return false;
                }
                let found = values
                    .iter()
                    .any(|v| compare_values(actual, v) == Some(Ordering::Equal));
                found != *negated
            }
            Expr::IsNull { field, negated } => feature.get(field).is_null() != *negated,
            Expr::Like {
                field,
                pattern,
                negated,
            } => match feature.get(field) {
                Value::Text(s) => like(s, pattern) != *negated,
                _ => false,
            },
        }
    }
}

/// Three-way comparison of two attribute values.
///
/// Numbers compare numerically across integer/float; text and booleans
/// compare within their own kind. `None` for Null or mismatched kinds.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

fn like(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    like_at(&t, &p)
}

fn like_at(t: &[char], p: &[char]) -> bool {
    match p.split_first() {
        None => t.is_empty(),
        Some(('%', rest)) => (0..=t.len()).any(|i| like_at(&t[i..], rest)),
        Some(('_', rest)) => !t.is_empty() && like_at(&t[1..], rest),
        Some((c, rest)) => t.first() == Some(c) && like_at(&t[1..], rest),
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Op(CompareOp),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "'{s}'"),
            Token::Str(s) => write!(f, "string '{s}'"),
            Token::Int(i) => write!(f, "number {i}"),
            Token::Float(x) => write!(f, "number {x}"),
            Token::Op(op) => write!(f, "operator {op:?}"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::Comma => write!(f, "','"),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, PredicateError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, ch) = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 1;
            }
            '!' if matches!(chars.get(i + 1), Some((_, '='))) => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '<' => {
                let (op, width) = match chars.get(i + 1).map(|(_, c)| *c) {
                    Some('=') => (CompareOp::Le, 2),
                    Some('>') => (CompareOp::Ne, 2),
                    _ => (CompareOp::Lt, 1),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            '>' => {
                let (op, width) = match chars.get(i + 1).map(|(_, c)| *c) {
                    Some('=') => (CompareOp::Ge, 2),
                    _ => (CompareOp::Gt, 1),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(PredicateError::UnterminatedString { offset }),
                        Some((_, '\'')) if matches!(chars.get(i + 1), Some((_, '\''))) => {
                            s.push('\'');
                            i += 2;
                        }
                        Some((_, '\'')) => {
                            i += 1;
                            break;
                        }
                        Some((_, c)) => {
                            s.push(*c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(PredicateError::UnterminatedString { offset }),
                        Some((_, '"')) => {
                            i += 1;
                            break;
                        }
                        Some((_, c)) => {
                            s.push(*c);
                            i += 1;
                        }
                    }
                }
                // Quoted identifiers never collide with keywords.
                tokens.push(Token::Ident(format!("\"{s}")));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while let Some((_, c)) = chars.get(i) {
                    if c.is_ascii_digit() || *c == '.' || *c == 'e' || *c == 'E' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                if let Ok(n) = text.parse::<i64>() {
                    tokens.push(Token::Int(n));
                } else if let Ok(x) = text.parse::<f64>() {
                    tokens.push(Token::Float(x));
                } else {
                    return Err(PredicateError::UnexpectedChar { ch: c, offset });
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while let Some((_, c)) = chars.get(i) {
                    if c.is_alphanumeric() || *c == '_' || *c == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(
                    chars[start..i].iter().map(|(_, c)| *c).collect(),
                ));
            }
            other => return Err(PredicateError::UnexpectedChar { ch: other, offset }),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn found(&self) -> String {
        self.peek()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "end of input".to_owned())
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &'static str) -> Result<(), PredicateError> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(PredicateError::Unexpected {
                expected: kw,
                found: self.found(),
            })
        }
    }

    fn expect(&mut self, tok: Token, expected: &'static str) -> Result<(), PredicateError> {
        if self.peek() == Some(&tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(PredicateError::Unexpected {
                expected,
                found: self.found(),
            })
        }
    }

    fn or_expr(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.and_expr()?;
        while self.eat_keyword("OR") {
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.not_expr()?;
        while self.eat_keyword("AND") {
            let rhs = self.not_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, PredicateError> {
        if self.eat_keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, PredicateError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.or_expr()?;
            self.expect(Token::RParen, "')'")?;
            return Ok(inner);
        }

        let field = self.field()?;

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Expr::IsNull { field, negated });
        }

        let negated = self.eat_keyword("NOT");
        if self.eat_keyword("IN") {
            self.expect(Token::LParen, "'('")?;
            let mut values = vec![self.literal()?];
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                values.push(self.literal()?);
            }
            self.expect(Token::RParen, "')'")?;
            return Ok(Expr::In {
                field,
                values,
                negated,
            });
        }
        if self.eat_keyword("LIKE") {
            return match self.advance() {
                Some(Token::Str(pattern)) => Ok(Expr::Like {
                    field,
                    pattern,
                    negated,
                }),
                other => Err(PredicateError::Unexpected {
                    expected: "string pattern",
                    found: other.map(|t| t.to_string()).unwrap_or_else(|| "end of input".into()),
                }),
            };
        }
        if negated {
            return Err(PredicateError::Unexpected {
                expected: "IN or LIKE",
                found: self.found(),
            });
        }

        match self.advance() {
            Some(Token::Op(op)) => {
                let value = self.literal()?;
                Ok(Expr::Compare { field, op, value })
            }
            other => Err(PredicateError::Unexpected {
                expected: "comparison operator",
                found: other.map(|t| t.to_string()).unwrap_or_else(|| "end of input".into()),
            }),
        }
    }

    fn field(&mut self) -> Result<String, PredicateError> {
        match self.peek() {
            Some(Token::Ident(name)) if !is_reserved(name) => {
                let name = name.strip_prefix('"').unwrap_or(name).to_owned();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(PredicateError::Unexpected {
                expected: "field name",
                found: self.found(),
            }),
        }
    }

    fn literal(&mut self) -> Result<Value, PredicateError> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Value::Text(s)),
            Some(Token::Int(i)) => Ok(Value::Int(i)),
            Some(Token::Float(x)) => Ok(Value::Float(x)),
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("TRUE") => Ok(Value::Bool(true)),
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("FALSE") => Ok(Value::Bool(false)),
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("NULL") => Ok(Value::Null),
            other => Err(PredicateError::Unexpected {
                expected: "literal",
                found: other.map(|t| t.to_string()).unwrap_or_else(|| "end of input".into()),
            }),
        }
    }
}

fn is_reserved(ident: &str) -> bool {
    const RESERVED: [&str; 9] = ["AND", "OR", "NOT", "IN", "IS", "NULL", "LIKE", "TRUE", "FALSE"];
    RESERVED.iter().any(|kw| ident.eq_ignore_ascii_case(kw))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
