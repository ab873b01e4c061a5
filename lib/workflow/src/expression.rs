//! Restricted expression language.
//!
//! Used for connection conditions, `custom` conditions and `expression`
//! transforms. Expressions are parsed once into an AST and evaluated against
//! a JSON scope; nothing is ever compiled or executed as code.
//!
//! Supported:
//! - Literals: numbers, single or double quoted strings, `true`, `false`, `null`
//! - Paths: `score`, `user.address.city`, `items.0.sku`, optionally marked
//!   as `$score`
//! - Comparisons: `==`, `!=`, `===`, `!==`, `>`, `>=`, `<`, `<=`
//! - Logic: `&&`, `||`, `!` and the keywords `and`, `or`, `not`
//! - Grouping with parentheses
//!
//! Missing paths evaluate to `null`. Numbers compare numerically (`1 == 1.0`).
//! Ordering comparisons between two strings are lexicographic; between any
//! other pair of non-numbers they are false.

use crate::error::ExpressionError;
use copper_relay_core::path::lookup;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(JsonValue),
    Path(String),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
}

impl Expression {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid expression.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(ExpressionError::UnexpectedToken {
                found: token.to_string(),
            });
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Returns the text this expression was parsed from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression to a JSON value.
    #[must_use]
    pub fn evaluate(&self, scope: &JsonValue) -> JsonValue {
        eval(&self.root, scope)
    }

    /// Evaluates the expression and applies truthiness to the result.
    #[must_use]
    pub fn evaluate_bool(&self, scope: &JsonValue) -> bool {
        truthy(&self.evaluate(scope))
    }
}

impl FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// JSON truthiness: `null`, `false`, `0`, `NaN` and `""` are false.
#[must_use]
pub fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

/// Equality with numeric coercion between JSON numbers.
#[must_use]
pub fn loose_eq(left: &JsonValue, right: &JsonValue) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

/// Ordering between two numbers or two strings; `None` for anything else.
#[must_use]
pub fn compare(left: &JsonValue, right: &JsonValue) -> Option<Ordering> {
    match (left, right) {
        (JsonValue::Number(l), JsonValue::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (JsonValue::String(l), JsonValue::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn eval(expr: &Expr, scope: &JsonValue) -> JsonValue {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Path(path) => lookup(scope, path).cloned().unwrap_or(JsonValue::Null),
        Expr::Not(inner) => JsonValue::Bool(!truthy(&eval(inner, scope))),
        Expr::Binary { op, left, right } => {
            let result = match op {
                BinaryOp::And => truthy(&eval(left, scope)) && truthy(&eval(right, scope)),
                BinaryOp::Or => truthy(&eval(left, scope)) || truthy(&eval(right, scope)),
                BinaryOp::Eq => loose_eq(&eval(left, scope), &eval(right, scope)),
                BinaryOp::Ne => !loose_eq(&eval(left, scope), &eval(right, scope)),
                BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le => {
                    let ordering = compare(&eval(left, scope), &eval(right, scope));
                    match (op, ordering) {
                        (_, None) => false,
                        (BinaryOp::Gt, Some(o)) => o == Ordering::Greater,
                        (BinaryOp::Ge, Some(o)) => o != Ordering::Less,
                        (BinaryOp::Lt, Some(o)) => o == Ordering::Less,
                        (_, Some(o)) => o != Ordering::Greater,
                    }
                }
            };
            JsonValue::Bool(result)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Op(BinaryOp),
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(name) => f.write_str(name),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Num(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Null => f.write_str("null"),
            Self::Op(op) => write!(f, "{op:?}"),
            Self::Not => f.write_str("!"),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let at = |i: usize| chars.get(i).copied();

    while let Some(c) = at(i) {
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' | '!' if at(i + 1) == Some('=') => {
                let op = if c == '=' { BinaryOp::Eq } else { BinaryOp::Ne };
                tokens.push(Token::Op(op));
                // `===` and `!==` mean the same as `==` and `!=`.
                i += if at(i + 2) == Some('=') { 3 } else { 2 };
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let or_equal = at(i + 1) == Some('=');
                let op = match (c, or_equal) {
                    ('>', true) => BinaryOp::Ge,
                    ('>', false) => BinaryOp::Gt,
                    (_, true) => BinaryOp::Le,
                    (_, false) => BinaryOp::Lt,
                };
                tokens.push(Token::Op(op));
                i += if or_equal { 2 } else { 1 };
            }
            '&' if at(i + 1) == Some('&') => {
                tokens.push(Token::Op(BinaryOp::And));
                i += 2;
            }
            '|' if at(i + 1) == Some('|') => {
                tokens.push(Token::Op(BinaryOp::Or));
                i += 2;
            }
            '"' | '\'' => {
                let start = i;
                i += 1;
                let mut literal = String::new();
                loop {
                    match at(i) {
                        None => return Err(ExpressionError::UnterminatedString { position: start }),
                        Some(q) if q == c => break,
                        Some('\\') if at(i + 1).is_some() => {
                            literal.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(other) => {
                            literal.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(literal));
                i += 1;
            }
            c if c.is_ascii_digit()
                || (c == '-' && at(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while at(i).is_some_and(|n| n.is_ascii_digit() || n == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::UnexpectedToken { found: text.clone() })?;
                tokens.push(Token::Num(number));
            }
            '$' if at(i + 1).is_some_and(|n| n.is_alphabetic() || n == '_') => {
                // `$path` is the operand marker structured conditions use.
                let start = i + 1;
                i = start;
                while at(i).is_some_and(|n| n.is_alphanumeric() || n == '_' || n == '.') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while at(i).is_some_and(|n| n.is_alphanumeric() || n == '_' || n == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" | "undefined" => Token::Null,
                    "and" => Token::Op(BinaryOp::And),
                    "or" => Token::Op(BinaryOp::Or),
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(ExpressionError::UnexpectedCharacter {
                    character: other,
                    position: i,
                });
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, wanted: &[BinaryOp]) -> Option<BinaryOp> {
        match self.peek() {
            Some(Token::Op(op)) if wanted.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while let Some(op) = self.eat_op(&[BinaryOp::Or]) {
            let right = self.parse_and()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.eat_op(&[BinaryOp::And]) {
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_primary()?;
        let comparisons = [
            BinaryOp::Eq,
            BinaryOp::Ne,
            BinaryOp::Gt,
            BinaryOp::Ge,
            BinaryOp::Lt,
            BinaryOp::Le,
        ];
        match self.eat_op(&comparisons) {
            Some(op) => {
                let right = self.parse_primary()?;
                Ok(binary(op, left, right))
            }
            None => Ok(left),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            None => Err(ExpressionError::UnexpectedEnd),
            Some(Token::Num(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(JsonValue::Null, JsonValue::Number),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(JsonValue::String(s))),
            Some(Token::Bool(b)) => Ok(Expr::Literal(JsonValue::Bool(b))),
            Some(Token::Null) => Ok(Expr::Literal(JsonValue::Null)),
            Some(Token::Ident(path)) => Ok(Expr::Path(path)),
            Some(Token::Not) => {
                let inner = self.parse_primary()?;
                Ok(Expr::Not(Box::new(inner)))
            }
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ExpressionError::UnexpectedToken {
                        found: other.to_string(),
                    }),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Some(other) => Err(ExpressionError::UnexpectedToken {
                found: other.to_string(),
            }),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
