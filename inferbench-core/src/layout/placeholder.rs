//! Symbolic sizes and offsets.
//!
//! A placeholder is an integer expression over named values that are only
//! known once the graph is bound to concrete input shapes. Expressions are
//! parsed into a small AST and evaluated against a [`PlaceholderContext`];
//! the source string is never executed.
//!
//! Grammar:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '//' | '%') unary)*
//! unary   := '-' unary | primary
//! primary := INT | NAME | "placeholders" '[' STRING ']' | '(' expr ')'
//! ```
//!
//! `/` and `//` both floor-divide.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A named, not yet evaluated integer expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PlaceholderRepr", into = "PlaceholderRepr")]
pub struct Placeholder {
    source: String,
    expr: Expr,
}

/// Wire form: `{"eval": "<expression>"}`
#[derive(Serialize, Deserialize)]
struct PlaceholderRepr {
    eval: String,
}

impl TryFrom<PlaceholderRepr> for Placeholder {
    type Error = Error;

    fn try_from(repr: PlaceholderRepr) -> Result<Self> {
        Placeholder::parse(&repr.eval)
    }
}

impl From<Placeholder> for PlaceholderRepr {
    fn from(placeholder: Placeholder) -> Self {
        PlaceholderRepr {
            eval: placeholder.source,
        }
    }
}

impl Placeholder {
    /// Parse an expression
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Placeholder standing for a single named value
    pub fn named(name: &str) -> Self {
        Self {
            source: name.to_string(),
            expr: Expr::Name(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Names referenced by the expression
    pub fn names(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        self.expr.collect_names(&mut names);
        names
    }

    /// Evaluate against the bindings in `ctx`
    pub fn eval(&self, ctx: &PlaceholderContext) -> Result<i64> {
        self.expr.eval(&self.source, ctx)
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Concrete values for placeholder names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaceholderContext {
    bindings: BTreeMap<String, i64>,
}

impl PlaceholderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name`, replacing any previous value
    pub fn bind(&mut self, name: impl Into<String>, value: i64) {
        self.bindings.insert(name.into(), value);
    }

    /// Builder form of [`bind`](Self::bind)
    pub fn with(mut self, name: impl Into<String>, value: i64) -> Self {
        self.bind(name, value);
        self
    }

    /// Bind every entry of `other`, overriding existing values
    pub fn extend(&mut self, other: &PlaceholderContext) {
        for (name, value) in &other.bindings {
            self.bindings.insert(name.clone(), *value);
        }
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.bindings.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl FromIterator<(String, i64)> for PlaceholderContext {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        Self {
            bindings: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Int(i64),
    Name(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn collect_names<'a>(&'a self, names: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Int(_) => {}
            Expr::Name(name) => {
                names.insert(name.as_str());
            }
            Expr::Neg(inner) => inner.collect_names(names),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_names(names);
                rhs.collect_names(names);
            }
        }
    }

    fn eval(&self, source: &str, ctx: &PlaceholderContext) -> Result<i64> {
        let overflow = || Error::InvalidExpression {
            expression: source.to_string(),
            message: "arithmetic overflow".to_string(),
        };

        match self {
            Expr::Int(value) => Ok(*value),
            Expr::Name(name) => ctx.get(name).ok_or_else(|| {
                Error::UnresolvedPlaceholder(format!("'{}' is not bound (in '{}')", name, source))
            }),
            Expr::Neg(inner) => inner.eval(source, ctx)?.checked_neg().ok_or_else(overflow),
            Expr::Binary(op, lhs, rhs) => {
                let a = lhs.eval(source, ctx)?;
                let b = rhs.eval(source, ctx)?;
                match op {
                    BinOp::Add => a.checked_add(b).ok_or_else(overflow),
                    BinOp::Sub => a.checked_sub(b).ok_or_else(overflow),
                    BinOp::Mul => a.checked_mul(b).ok_or_else(overflow),
                    BinOp::Div | BinOp::Rem if b == 0 => Err(Error::InvalidExpression {
                        expression: source.to_string(),
                        message: "division by zero".to_string(),
                    }),
                    BinOp::Div => {
                        let q = a.checked_div(b).ok_or_else(overflow)?;
                        if a % b != 0 && ((a < 0) != (b < 0)) {
                            Ok(q - 1)
                        } else {
                            Ok(q)
                        }
                    }
                    BinOp::Rem => {
                        let r = a.checked_rem(b).ok_or_else(overflow)?;
                        if r != 0 && ((r < 0) != (b < 0)) {
                            Ok(r + b)
                        } else {
                            Ok(r)
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Int(i64),
    Ident(String),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let invalid = |message: String| Error::InvalidExpression {
        expression: source.to_string(),
        message,
    };

    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = i + d.len_utf8();
                    chars.next();
                }
                let literal = &source[start..end];
                let value = literal
                    .parse()
                    .map_err(|_| invalid(format!("integer literal '{}' out of range", literal)))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if !(d.is_ascii_alphanumeric() || d == '_') {
                        break;
                    }
                    end = i + d.len_utf8();
                    chars.next();
                }
                tokens.push(Token::Ident(source[start..end].to_string()));
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, ch)) if ch == quote => break,
                        Some((_, ch)) => value.push(ch),
                        None => return Err(invalid("unterminated string".to_string())),
                    }
                }
                tokens.push(Token::Str(value));
            }
            '/' => {
                chars.next();
                if matches!(chars.peek(), Some(&(_, '/'))) {
                    chars.next();
                }
                tokens.push(Token::Slash);
            }
            _ => {
                let token = match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '%' => Token::Percent,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    other => return Err(invalid(format!("unexpected character '{}'", other))),
                };
                chars.next();
                tokens.push(token);
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> Error {
        Error::InvalidExpression {
            expression: self.source.to_string(),
            message: format!("{} at token {}", message, self.pos),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            _ => Err(self.error(&format!("expected {:?}", expected))),
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Int(value)) => Ok(Expr::Int(value)),
            Some(Token::Ident(name)) if name == "placeholders" => {
                self.expect(Token::LBracket)?;
                let key = match self.next() {
                    Some(Token::Str(key)) => key,
                    _ => return Err(self.error("expected quoted placeholder name")),
                };
                self.expect(Token::RBracket)?;
                Ok(Expr::Name(key))
            }
            Some(Token::Ident(name)) => Ok(Expr::Name(name)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            _ => Err(self.error("expected a number, name or '('")),
        }
    }
}
