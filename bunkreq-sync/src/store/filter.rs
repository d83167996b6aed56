//! Filter expression language for record store queries
//!
//! ```text
//! expr     := and_expr ( "||" and_expr )*
//! and_expr := term ( "&&" term )*
//! term     := "(" expr ")" | field ( "=" | "!=" ) literal
//! literal  := "text" | 'text' | integer | decimal | true | false | null
//! ```
//!
//! Strings are always quoted; a bare word on the right-hand side is an
//! error rather than a silently-unquoted string. `null` matches a missing
//! field, a JSON null and an empty string, the way the upstream record
//! store reports unset relations. The field name `id` addresses the
//! record id rather than a data field.

use bunkreq_common::{Error, Result};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Right-hand side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Literal {
    /// Equality against a stored JSON value (None = field absent)
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match (self, value) {
            (Literal::Null, None) | (Literal::Null, Some(Value::Null)) => true,
            (Literal::Null, Some(Value::String(s))) => s.is_empty(),
            (Literal::Null, Some(_)) => false,
            (_, None) | (_, Some(Value::Null)) => false,
            (Literal::Bool(b), Some(Value::Bool(v))) => b == v,
            (Literal::Int(i), Some(Value::Number(n))) => match n.as_i64() {
                Some(v) => v == *i,
                None => n.as_f64() == Some(*i as f64),
            },
            (Literal::Float(f), Some(Value::Number(n))) => n.as_f64() == Some(*f),
            (Literal::Str(s), Some(Value::String(v))) => s == v,
            _ => false,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "null"),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Int(i) => write!(f, "{}", i),
            // Debug keeps the decimal point so the value re-parses as Float
            Literal::Float(v) => write!(f, "{:?}", v),
            Literal::Str(s) => {
                write!(f, "\"")?;
                for ch in s.chars() {
                    if ch == '"' || ch == '\\' {
                        write!(f, "\\")?;
                    }
                    write!(f, "{}", ch)?;
                }
                write!(f, "\"")
            }
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::Str(value.to_string())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Literal::Str(value)
    }
}

impl From<&String> for Literal {
    fn from(value: &String) -> Self {
        Literal::Str(value.clone())
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Int(value)
    }
}

impl From<i32> for Literal {
    fn from(value: i32) -> Self {
        Literal::Int(value as i64)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

impl From<f64> for Literal {
    fn from(value: f64) -> Self {
        Literal::Float(value)
    }
}

impl<T: Into<Literal>> From<Option<T>> for Literal {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Literal::Null)
    }
}

/// Boolean filter over record fields
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Literal),
    Ne(String, Literal),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Literal>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Literal>) -> Self {
        Filter::Ne(field.into(), value.into())
    }

    /// Conjunction, flattening nested `&&` chains
    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut terms) => {
                terms.push(other);
                Filter::And(terms)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    /// Disjunction, flattening nested `||` chains
    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut terms) => {
                terms.push(other);
                Filter::Or(terms)
            }
            first => Filter::Or(vec![first, other]),
        }
    }

    /// `field = v1 || field = v2 || ...`; None when `values` is empty
    pub fn any_of<I, V>(field: &str, values: I) -> Option<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Literal>,
    {
        let mut terms: Vec<Filter> = values
            .into_iter()
            .map(|v| Filter::eq(field, v))
            .collect();
        match terms.len() {
            0 => None,
            1 => terms.pop(),
            _ => Some(Filter::Or(terms)),
        }
    }

    /// Evaluate against one record
    pub fn matches(&self, id: &str, data: &Map<String, Value>) -> bool {
        match self {
            Filter::Eq(field, literal) => field_matches(field, literal, id, data),
            Filter::Ne(field, literal) => !field_matches(field, literal, id, data),
            Filter::And(terms) => terms.iter().all(|t| t.matches(id, data)),
            Filter::Or(terms) => terms.iter().any(|t| t.matches(id, data)),
        }
    }

    /// Parse the textual filter language
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let filter = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::InvalidInput(format!(
                "Unexpected trailing input in filter: {}",
                input
            )));
        }
        Ok(filter)
    }
}

fn field_matches(field: &str, literal: &Literal, id: &str, data: &Map<String, Value>) -> bool {
    if field == "id" {
        literal.matches(Some(&Value::String(id.to_string())))
    } else {
        literal.matches(data.get(field))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Eq(field, literal) => write!(f, "{} = {}", field, literal),
            Filter::Ne(field, literal) => write!(f, "{} != {}", field, literal),
            Filter::And(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, " && ")?;
                    }
                    match term {
                        Filter::Or(_) => write!(f, "({})", term)?,
                        _ => write!(f, "{}", term)?,
                    }
                }
                Ok(())
            }
            Filter::Or(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, " || ")?;
                    }
                    write!(f, "{}", term)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Filter::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Eq,
    Ne,
    And,
    Or,
    LParen,
    RParen,
    Lit(Literal),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
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
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(Error::InvalidInput(format!(
                            "Unterminated string in filter: {}",
                            input
                        )));
                    };
                    if ch == '\\' {
                        if let Some(&escaped) = chars.get(i + 1) {
                            text.push(escaped);
                            i += 2;
                            continue;
                        }
                    }
                    i += 1;
                    if ch == quote {
                        break;
                    }
                    text.push(ch);
                }
                tokens.push(Token::Lit(Literal::Str(text)));
            }
            c if c == '-' || c.is_ascii_digit() => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let literal = if text.contains('.') {
                    text.parse::<f64>().map(Literal::Float).ok()
                } else {
                    text.parse::<i64>().map(Literal::Int).ok()
                };
                match literal {
                    Some(lit) => tokens.push(Token::Lit(lit)),
                    None => {
                        return Err(Error::InvalidInput(format!(
                            "Invalid number '{}' in filter",
                            text
                        )))
                    }
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Lit(Literal::Bool(true)),
                    "false" => Token::Lit(Literal::Bool(false)),
                    "null" => Token::Lit(Literal::Null),
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "Unexpected character '{}' at position {} in filter",
                    other, i
                )))
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

    fn parse_or(&mut self) -> Result<Filter> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(collapse(terms, Filter::Or))
    }

    fn parse_and(&mut self) -> Result<Filter> {
        let mut terms = vec![self.parse_term()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            terms.push(self.parse_term()?);
        }
        Ok(collapse(terms, Filter::And))
    }

    fn parse_term(&mut self) -> Result<Filter> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(Error::InvalidInput("Missing ')' in filter".to_string())),
                }
            }
            Some(Token::Ident(field)) => {
                let op = self.advance();
                let literal = match self.advance() {
                    Some(Token::Lit(lit)) => lit,
                    Some(Token::Ident(word)) => {
                        return Err(Error::InvalidInput(format!(
                            "Unquoted string value '{}' for field '{}'",
                            word, field
                        )))
                    }
                    other => {
                        return Err(Error::InvalidInput(format!(
                            "Expected value for field '{}', found {:?}",
                            field, other
                        )))
                    }
                };
                match op {
                    Some(Token::Eq) => Ok(Filter::Eq(field, literal)),
                    Some(Token::Ne) => Ok(Filter::Ne(field, literal)),
                    other => Err(Error::InvalidInput(format!(
                        "Expected '=' or '!=' after '{}', found {:?}",
                        field, other
                    ))),
                }
            }
            other => Err(Error::InvalidInput(format!(
                "Expected field or '(' in filter, found {:?}",
                other
            ))),
        }
    }
}

fn collapse(mut terms: Vec<Filter>, wrap: fn(Vec<Filter>) -> Filter) -> Filter {
    if terms.len() == 1 {
        terms.remove(0)
    } else {
        wrap(terms)
    }
}
