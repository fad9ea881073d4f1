//! Hand-written lexer, recursive-descent parser and tree-walking
//! evaluator for rule conditions. Deliberately not backed by an
//! `eval()`-style general expression engine: identifiers are restricted
//! at parse time to the field names `ProxyNode::field_as_str`/
//! `field_as_num` know about, so a malformed or malicious rule body fails
//! to parse rather than executing arbitrary code.

use std::fmt;

use crate::domain::ProxyNode;
use crate::error::{ProxyPoolError, Result};

const STRING_FIELDS: &[&str] = &["host", "name", "protocol", "country", "region", "tags"];
const NUMERIC_FIELDS: &[&str] = &[
    "response_time_ms",
    "success_rate",
    "weight",
    "max_connections",
    "current_connections",
    "id",
];

/// A runtime value produced by evaluating an expression. Truthiness
/// follows the same rule Python's `and`/`or`/`not` use: `Null`, `""`, and
/// `0.0` are falsy, everything else is truthy.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Str(s) => !s.is_empty(),
            Value::Num(n) => *n != 0.0,
            Value::Bool(b) => *b,
            Value::Null => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Null => write!(f, "null"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    And,
    Or,
    Not,
    In,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    Eof,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().peekable(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
                self.chars.next();
            }
            let Some(&c) = self.chars.peek() else {
                tokens.push(Token::Eof);
                break;
            };

            match c {
                '(' => {
                    self.chars.next();
                    tokens.push(Token::LParen);
                }
                ')' => {
                    self.chars.next();
                    tokens.push(Token::RParen);
                }
                '\'' | '"' => {
                    tokens.push(Token::Str(self.read_string(c)?));
                }
                '=' => {
                    self.chars.next();
                    if self.chars.peek() == Some(&'=') {
                        self.chars.next();
                    }
                    tokens.push(Token::Eq);
                }
                '!' => {
                    self.chars.next();
                    if self.chars.peek() == Some(&'=') {
                        self.chars.next();
                        tokens.push(Token::Ne);
                    } else {
                        return Err(ProxyPoolError::Internal(
                            "unexpected '!' in rule expression".to_string(),
                        ));
                    }
                }
                '<' => {
                    self.chars.next();
                    if self.chars.peek() == Some(&'=') {
                        self.chars.next();
                        tokens.push(Token::Le);
                    } else {
                        tokens.push(Token::Lt);
                    }
                }
                '>' => {
                    self.chars.next();
                    if self.chars.peek() == Some(&'=') {
                        self.chars.next();
                        tokens.push(Token::Ge);
                    } else {
                        tokens.push(Token::Gt);
                    }
                }
                c if c.is_ascii_digit() || c == '-' => {
                    tokens.push(self.read_number());
                }
                c if c.is_alphabetic() || c == '_' => {
                    let ident = self.read_ident();
                    tokens.push(match ident.as_str() {
                        "and" => Token::And,
                        "or" => Token::Or,
                        "not" => Token::Not,
                        "in" => Token::In,
                        "true" => Token::Num(1.0),
                        "false" => Token::Num(0.0),
                        _ => Token::Ident(ident),
                    });
                }
                other => {
                    return Err(ProxyPoolError::Internal(format!(
                        "unexpected character '{other}' in rule expression"
                    )))
                }
            }
        }
        Ok(tokens)
    }

    fn read_string(&mut self, quote: char) -> Result<String> {
        self.chars.next();
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some(c) if c == quote => break,
                Some(c) => out.push(c),
                None => {
                    return Err(ProxyPoolError::Internal(
                        "unterminated string literal in rule expression".to_string(),
                    ))
                }
            }
        }
        Ok(out)
    }

    fn read_number(&mut self) -> Token {
        let mut out = String::new();
        if self.chars.peek() == Some(&'-') {
            out.push(self.chars.next().unwrap());
        }
        while matches!(self.chars.peek(), Some(c) if c.is_ascii_digit() || *c == '.') {
            out.push(self.chars.next().unwrap());
        }
        Token::Num(out.parse().unwrap_or(0.0))
    }

    fn read_ident(&mut self) -> String {
        let mut out = String::new();
        while matches!(self.chars.peek(), Some(c) if c.is_alphanumeric() || *c == '_') {
            out.push(self.chars.next().unwrap());
        }
        out
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Field(String),
    StrLit(String),
    NumLit(f64),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(ProxyPoolError::Internal(format!(
                "expected {expected:?}, found {:?} in rule expression",
                self.peek()
            )))
        }
    }

    fn parse(mut self) -> Result<Expr> {
        let expr = self.parse_or()?;
        self.expect(&Token::Eof)?;
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while *self.peek() == Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while *self.peek() == Token::And {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if *self.peek() == Token::Not {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_atom()?;
        let op = match self.peek() {
            Token::Eq => Some(CmpOp::Eq),
            Token::Ne => Some(CmpOp::Ne),
            Token::Lt => Some(CmpOp::Lt),
            Token::Le => Some(CmpOp::Le),
            Token::Gt => Some(CmpOp::Gt),
            Token::Ge => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_atom()?;
            return Ok(Expr::Cmp(op, Box::new(left), Box::new(right)));
        }
        if *self.peek() == Token::In {
            self.advance();
            let right = self.parse_atom()?;
            return Ok(Expr::In(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.advance() {
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if !STRING_FIELDS.contains(&name.as_str()) && !NUMERIC_FIELDS.contains(&name.as_str())
                {
                    return Err(ProxyPoolError::Internal(format!(
                        "unknown field '{name}' in rule expression"
                    )));
                }
                Ok(Expr::Field(name))
            }
            Token::Str(s) => Ok(Expr::StrLit(s)),
            Token::Num(n) => Ok(Expr::NumLit(n)),
            other => Err(ProxyPoolError::Internal(format!(
                "unexpected token {other:?} in rule expression"
            ))),
        }
    }
}

/// Parses a rule condition body into an AST, rejecting unknown fields and
/// malformed syntax before the rule is ever stored.
pub fn parse(source: &str) -> Result<Expr> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse()
}

fn resolve(expr: &Expr, node: &ProxyNode) -> Value {
    match expr {
        Expr::Field(name) => {
            if let Some(s) = node.field_as_str(name) {
                Value::Str(s)
            } else if let Some(n) = node.field_as_num(name) {
                Value::Num(n)
            } else {
                Value::Null
            }
        }
        Expr::StrLit(s) => Value::Str(s.clone()),
        Expr::NumLit(n) => Value::Num(*n),
        _ => unreachable!("resolve called on a boolean-combinator node"),
    }
}

fn as_num(v: &Value) -> Option<f64> {
    match v {
        Value::Num(n) => Some(*n),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Value {
    let ordering = match (as_num(left), as_num(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => {
            let l = left.to_string();
            let r = right.to_string();
            l.partial_cmp(&r)
        }
    };
    let Some(ordering) = ordering else {
        return Value::Bool(false);
    };
    use std::cmp::Ordering::*;
    let result = match op {
        CmpOp::Eq => ordering == Equal,
        CmpOp::Ne => ordering != Equal,
        CmpOp::Lt => ordering == Less,
        CmpOp::Le => ordering != Greater,
        CmpOp::Gt => ordering == Greater,
        CmpOp::Ge => ordering != Less,
    };
    Value::Bool(result)
}

/// Evaluates a parsed rule against a node. `and`/`or` are value-level
/// short-circuit operators (mirroring Python's `x or y` idiom rather than
/// strict boolean `&&`/`||`), so `'premium' in (node.tags or '')`-style
/// conditions translate directly.
pub fn eval(expr: &Expr, node: &ProxyNode) -> bool {
    eval_value(expr, node).truthy()
}

fn eval_value(expr: &Expr, node: &ProxyNode) -> Value {
    match expr {
        Expr::Field(_) | Expr::StrLit(_) | Expr::NumLit(_) => resolve(expr, node),
        Expr::Not(inner) => Value::Bool(!eval_value(inner, node).truthy()),
        Expr::And(l, r) => {
            let lv = eval_value(l, node);
            if !lv.truthy() {
                lv
            } else {
                eval_value(r, node)
            }
        }
        Expr::Or(l, r) => {
            let lv = eval_value(l, node);
            if lv.truthy() {
                lv
            } else {
                eval_value(r, node)
            }
        }
        Expr::Cmp(op, l, r) => compare(*op, &eval_value(l, node), &eval_value(r, node)),
        Expr::In(needle, haystack) => {
            let needle = eval_value(needle, node).to_string();
            let haystack = eval_value(haystack, node);
            match haystack {
                Value::Null => Value::Bool(false),
                other => Value::Bool(other.to_string().contains(&needle)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeProtocol;
    use chrono::Utc;

    fn node_with_tags(tags: Option<&str>) -> ProxyNode {
        let now = Utc::now();
        ProxyNode {
            id: 1,
            name: None,
            host: "h".to_string(),
            port: 1,
            protocol: NodeProtocol::Http,
            username: None,
            password: None,
            is_active: true,
            is_healthy: true,
            response_time_ms: 50.0,
            success_rate: 99.0,
            weight: 1,
            max_connections: 100,
            current_connections: 0,
            country: Some("US".to_string()),
            region: None,
            tags: tags.map(str::to_string),
            created_at: now,
            updated_at: now,
            last_check: None,
        }
    }

    #[test]
    fn in_operator_matches_substring() {
        let expr = parse("'premium' in tags").unwrap();
        assert!(eval(&expr, &node_with_tags(Some("premium,fast"))));
        assert!(!eval(&expr, &node_with_tags(Some("basic"))));
    }

    #[test]
    fn in_operator_treats_missing_tags_as_falsy() {
        let expr = parse("'premium' in tags").unwrap();
        assert!(!eval(&expr, &node_with_tags(None)));
    }

    #[test]
    fn numeric_comparison_and_boolean_and() {
        let expr = parse("success_rate >= 95 and response_time_ms < 100").unwrap();
        assert!(eval(&expr, &node_with_tags(None)));
    }

    #[test]
    fn string_equality_on_country() {
        let expr = parse("country == 'US'").unwrap();
        assert!(eval(&expr, &node_with_tags(None)));
        let expr = parse("country == 'DE'").unwrap();
        assert!(!eval(&expr, &node_with_tags(None)));
    }

    #[test]
    fn unknown_field_fails_to_parse() {
        assert!(parse("bogus_field == 1").is_err());
    }

    #[test]
    fn not_and_parentheses() {
        let expr = parse("not (country == 'DE')").unwrap();
        assert!(eval(&expr, &node_with_tags(None)));
    }
}
