//! Filter expressions attached to bindings.
//!
//! A selector is a boolean expression over message headers:
//!
//! ```text
//! region = 'eu' AND (priority > 5 OR urgent) AND kind NOT IN ('test', 'debug')
//! ```
//!
//! Identifiers name headers; a missing header is `NULL`. Evaluation uses three-valued logic and a
//! binding applies only when the whole expression evaluates to `TRUE`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::message::{HeaderValue, Metadata};

/// Longest accepted selector text, in bytes.
pub const MAX_SELECTOR_LEN: usize = 4096;
/// Deepest accepted nesting of parentheses and `NOT`.
pub const MAX_SELECTOR_DEPTH: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected character '{0}' at {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal starting at {0}")]
    UnterminatedString(usize),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unexpected {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("expression is longer than {0} bytes")]
    TooLong(usize),
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Long(i64),
    Double(f64),
    Cmp(CmpOp),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
    Is,
    Null,
    In,
    True,
    False,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier '{s}'"),
            Token::Str(s) => write!(f, "string '{s}'"),
            Token::Long(v) => write!(f, "number {v}"),
            Token::Double(v) => write!(f, "number {v}"),
            Token::Cmp(op) => write!(f, "operator '{op}'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
            Token::And => f.write_str("AND"),
            Token::Or => f.write_str("OR"),
            Token::Not => f.write_str("NOT"),
            Token::Is => f.write_str("IS"),
            Token::Null => f.write_str("NULL"),
            Token::In => f.write_str("IN"),
            Token::True => f.write_str("TRUE"),
            Token::False => f.write_str("FALSE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Ge => ">=",
        })
    }
}

impl CmpOp {
    #[inline]
    fn test(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, SelectorError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 1;
            }
            '<' => match chars.get(i + 1) {
                Some('>') => {
                    tokens.push(Token::Cmp(CmpOp::Ne));
                    i += 2;
                }
                Some('=') => {
                    tokens.push(Token::Cmp(CmpOp::Le));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Cmp(CmpOp::Lt));
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(CmpOp::Gt));
                    i += 1;
                }
            }
            '\'' => {
                let start = i;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(SelectorError::UnterminatedString(start)),
                        // '' is an escaped quote
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(c) => {
                            s.push(*c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let token = if text.contains('.') {
                    text.parse::<f64>().map(Token::Double)
                        .map_err(|_| SelectorError::InvalidNumber(text.clone()))?
                } else {
                    text.parse::<i64>().map(Token::Long).map_err(|_| SelectorError::InvalidNumber(text.clone()))?
                };
                tokens.push(token);
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IS" => Token::Is,
                    "NULL" => Token::Null,
                    "IN" => Token::In,
                    "TRUE" => Token::True,
                    "FALSE" => Token::False,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            c => return Err(SelectorError::UnexpectedChar(c, i)),
        }
    }
    Ok(tokens)
}

#[inline]
fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '$' | '-' | '.')
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Str(String),
    Long(i64),
    Double(f64),
    Bool(bool),
}

impl Value {
    #[inline]
    fn from_header(h: &HeaderValue) -> Self {
        match h {
            HeaderValue::String(s) => Value::Str(s.clone()),
            HeaderValue::Long(v) => Value::Long(*v),
            HeaderValue::Double(v) => Value::Double(*v),
            HeaderValue::Bool(v) => Value::Bool(*v),
        }
    }

    #[inline]
    fn truth(b: Option<bool>) -> Self {
        b.map(Value::Bool).unwrap_or(Value::Null)
    }

    #[inline]
    fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// `None` when either side is NULL or the types are not comparable.
    fn compare(&self, op: CmpOp, other: &Value) -> Option<bool> {
        let ord = match (self, other) {
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Long(a), Value::Double(b)) => (*a as f64).partial_cmp(b)?,
            (Value::Double(a), Value::Long(b)) => a.partial_cmp(&(*b as f64))?,
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b)?,
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) if matches!(op, CmpOp::Eq | CmpOp::Ne) => a.cmp(b),
            _ => return None,
        };
        Some(op.test(ord))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ident(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    IsNull { expr: Box<Expr>, negated: bool },
    In { expr: Box<Expr>, list: Vec<Value>, negated: bool },
}

impl Expr {
    fn eval(&self, meta: &Metadata) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Ident(name) => meta.get_header(name).map(Value::from_header).unwrap_or(Value::Null),
            Expr::Not(e) => Value::truth(e.eval(meta).as_bool().map(|b| !b)),
            Expr::And(l, r) => {
                match (l.eval(meta).as_bool(), r.eval(meta).as_bool()) {
                    (Some(false), _) | (_, Some(false)) => Value::Bool(false),
                    (Some(true), Some(true)) => Value::Bool(true),
                    _ => Value::Null,
                }
            }
            Expr::Or(l, r) => {
                match (l.eval(meta).as_bool(), r.eval(meta).as_bool()) {
                    (Some(true), _) | (_, Some(true)) => Value::Bool(true),
                    (Some(false), Some(false)) => Value::Bool(false),
                    _ => Value::Null,
                }
            }
            Expr::Compare(op, l, r) => Value::truth(l.eval(meta).compare(*op, &r.eval(meta))),
            Expr::IsNull { expr, negated } => Value::Bool((expr.eval(meta) == Value::Null) != *negated),
            Expr::In { expr, list, negated } => {
                let v = expr.eval(meta);
                if v == Value::Null {
                    return Value::Null;
                }
                let found = list.iter().any(|item| v.compare(CmpOp::Eq, item) == Some(true));
                Value::Bool(found != *negated)
            }
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    #[inline]
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0, depth: 0 }
    }

    #[inline]
    fn descend(&mut self) -> Result<(), SelectorError> {
        self.depth += 1;
        if self.depth > MAX_SELECTOR_DEPTH {
            return Err(SelectorError::TooDeep(MAX_SELECTOR_DEPTH));
        }
        Ok(())
    }

    #[inline]
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    #[inline]
    fn next(&mut self) -> Result<Token, SelectorError> {
        let t = self.tokens.get(self.pos).cloned().ok_or(SelectorError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(t)
    }

    #[inline]
    fn eat(&mut self, t: &Token) -> bool {
        if self.peek() == Some(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    #[inline]
    fn expect(&mut self, t: Token) -> Result<(), SelectorError> {
        match self.next()? {
            ref got if *got == t => Ok(()),
            got => Err(SelectorError::UnexpectedToken(got.to_string())),
        }
    }

    fn parse(mut self) -> Result<Expr, SelectorError> {
        if self.tokens.is_empty() {
            return Err(SelectorError::Empty);
        }
        let expr = self.or()?;
        match self.peek() {
            None => Ok(expr),
            Some(t) => Err(SelectorError::UnexpectedToken(t.to_string())),
        }
    }

    fn or(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.not()?;
        while self.eat(&Token::And) {
            left = Expr::And(Box::new(left), Box::new(self.not()?));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, SelectorError> {
        if self.eat(&Token::Not) {
            self.descend()?;
            let e = self.not()?;
            self.depth -= 1;
            Ok(Expr::Not(Box::new(e)))
        } else {
            self.cmp()
        }
    }

    fn cmp(&mut self) -> Result<Expr, SelectorError> {
        let left = self.operand()?;
        match self.peek() {
            Some(Token::Cmp(op)) => {
                let op = *op;
                self.pos += 1;
                Ok(Expr::Compare(op, Box::new(left), Box::new(self.operand()?)))
            }
            Some(Token::Is) => {
                self.pos += 1;
                let negated = self.eat(&Token::Not);
                self.expect(Token::Null)?;
                Ok(Expr::IsNull { expr: Box::new(left), negated })
            }
            Some(Token::In) => {
                self.pos += 1;
                self.in_list(left, false)
            }
            Some(Token::Not) if self.tokens.get(self.pos + 1) == Some(&Token::In) => {
                self.pos += 2;
                self.in_list(left, true)
            }
            _ => Ok(left),
        }
    }

    fn in_list(&mut self, expr: Expr, negated: bool) -> Result<Expr, SelectorError> {
        self.expect(Token::LParen)?;
        let mut list = vec![self.literal()?];
        while self.eat(&Token::Comma) {
            list.push(self.literal()?);
        }
        self.expect(Token::RParen)?;
        Ok(Expr::In { expr: Box::new(expr), list, negated })
    }

    fn literal(&mut self) -> Result<Value, SelectorError> {
        match self.next()? {
            Token::Str(s) => Ok(Value::Str(s)),
            Token::Long(v) => Ok(Value::Long(v)),
            Token::Double(v) => Ok(Value::Double(v)),
            Token::True => Ok(Value::Bool(true)),
            Token::False => Ok(Value::Bool(false)),
            t => Err(SelectorError::UnexpectedToken(t.to_string())),
        }
    }

    fn operand(&mut self) -> Result<Expr, SelectorError> {
        match self.peek() {
            Some(Token::Ident(_)) => match self.next()? {
                Token::Ident(name) => Ok(Expr::Ident(name)),
                t => Err(SelectorError::UnexpectedToken(t.to_string())),
            },
            Some(Token::LParen) => {
                self.pos += 1;
                self.descend()?;
                let e = self.or()?;
                self.depth -= 1;
                self.expect(Token::RParen)?;
                Ok(e)
            }
            _ => Ok(Expr::Literal(self.literal()?)),
        }
    }
}

/// A parsed filter expression. Two selectors are equal when their source text is equal.
#[derive(Clone)]
pub struct Selector {
    text: String,
    expr: Expr,
}

impl Selector {
    pub fn parse(text: &str) -> Result<Selector, SelectorError> {
        if text.len() > MAX_SELECTOR_LEN {
            return Err(SelectorError::TooLong(MAX_SELECTOR_LEN));
        }
        let expr = Parser::new(tokenize(text)?).parse()?;
        Ok(Selector { text: text.to_owned(), expr })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// True only if the expression evaluates to TRUE for `meta`.
    #[inline]
    pub fn matches(&self, meta: &Metadata) -> bool {
        self.expr.eval(meta) == Value::Bool(true)
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Selector::parse(s)
    }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Selector {}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({:?})", self.text)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> Metadata {
        Metadata::new(1, "amq.topic", "orders.eu")
            .header("region", "eu")
            .header("priority", 7i64)
            .header("weight", 2.5f64)
            .header("urgent", true)
            .header("x-origin-queue", "orders")
    }

    fn eval(text: &str) -> bool {
        Selector::parse(text).unwrap().matches(&meta())
    }

    #[test]
    fn comparisons() {
        assert!(eval("region = 'eu'"));
        assert!(!eval("region = 'us'"));
        assert!(eval("region <> 'us'"));
        assert!(eval("priority > 5"));
        assert!(eval("priority >= 7 AND priority <= 7"));
        assert!(eval("weight < 3"));
        assert!(eval("priority > 6.5"));
        assert!(eval("urgent"));
        assert!(eval("urgent = TRUE"));
        assert!(eval("x-origin-queue = 'orders'"));
    }

    #[test]
    fn boolean_operators_and_precedence() {
        assert!(eval("region = 'us' OR priority > 5 AND urgent"));
        assert!(!eval("(region = 'us' OR priority > 5) AND NOT urgent"));
        assert!(eval("not region = 'us'"));
    }

    #[test]
    fn null_handling() {
        assert!(eval("missing IS NULL"));
        assert!(eval("region IS NOT NULL"));
        // comparisons with NULL are unknown, so neither branch matches
        assert!(!eval("missing = 'x'"));
        assert!(!eval("NOT missing = 'x'"));
        assert!(eval("missing = 'x' OR urgent"));
        assert!(!eval("missing = 'x' AND urgent"));
        assert!(!eval("missing IN ('a')"));
    }

    #[test]
    fn in_lists() {
        assert!(eval("region IN ('us', 'eu')"));
        assert!(!eval("region NOT IN ('us', 'eu')"));
        assert!(eval("priority IN (1, 7)"));
    }

    #[test]
    fn mismatched_types_are_unknown() {
        assert!(!eval("region > 5"));
        assert!(!eval("urgent > FALSE"));
        assert!(!eval("'text'"));
    }

    #[test]
    fn escaped_quotes() {
        let m = Metadata::new(1, "", "").header("name", "o'brien");
        assert!(Selector::parse("name = 'o''brien'").unwrap().matches(&m));
    }

    #[test]
    fn parse_errors() {
        assert_eq!(Selector::parse("").unwrap_err(), SelectorError::Empty);
        assert_eq!(Selector::parse("   ").unwrap_err(), SelectorError::Empty);
        assert_eq!(Selector::parse("a = 'x").unwrap_err(), SelectorError::UnterminatedString(4));
        assert_eq!(Selector::parse("a ! b").unwrap_err(), SelectorError::UnexpectedChar('!', 2));
        assert_eq!(Selector::parse("a = ").unwrap_err(), SelectorError::UnexpectedEnd);
        assert!(matches!(Selector::parse("a = 1 b"), Err(SelectorError::UnexpectedToken(_))));
        assert!(matches!(Selector::parse("a IN ()"), Err(SelectorError::UnexpectedToken(_))));
        assert!(matches!(Selector::parse("a IS 1"), Err(SelectorError::UnexpectedToken(_))));
    }

    #[test]
    fn nesting_and_length_limits() {
        let nested = format!("{}a = 1{}", "(".repeat(200), ")".repeat(200));
        assert_eq!(Selector::parse(&nested).unwrap_err(), SelectorError::TooDeep(MAX_SELECTOR_DEPTH));
        let nots = format!("{}a = 1", "NOT ".repeat(200));
        assert_eq!(Selector::parse(&nots).unwrap_err(), SelectorError::TooDeep(MAX_SELECTOR_DEPTH));

        let huge = format!("{}a = 1{}", "(".repeat(200_000), ")".repeat(200_000));
        assert_eq!(Selector::parse(&huge).unwrap_err(), SelectorError::TooLong(MAX_SELECTOR_LEN));

        let ok = format!("{}a = 1{}", "(".repeat(MAX_SELECTOR_DEPTH), ")".repeat(MAX_SELECTOR_DEPTH));
        assert!(Selector::parse(&ok).unwrap().matches(&Metadata::new(1, "", "").header("a", 1i64)));
        assert!(eval("NOT NOT urgent"));
    }

    #[test]
    fn equality_is_by_text() {
        assert_eq!(Selector::parse("a = 1").unwrap(), "a = 1".parse().unwrap());
        assert_ne!(Selector::parse("a = 1").unwrap(), Selector::parse("a=1").unwrap());
    }
}
