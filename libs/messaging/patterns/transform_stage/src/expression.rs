//! Per-record expressions
//!
//! A deliberately small language for picking values out of a [`Record`]:
//!
//! - roots: `payload`, `headers`, `'text'` / `"text"`, integers, `true`, `false`, `null`
//! - accessors: `.field`, `['key']`, `[0]`
//! - methods: `.split(sep)`, `.toUpperCase()`, `.toLowerCase()`, `.trim()`, `.length()`
//! - concatenation: `headers['prefix'] + '.' + payload.id`
//!
//! Expressions are parsed once, when configuration is loaded, and evaluated
//! per record. Missing headers and fields evaluate to `null`.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::{Record, StageError};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Plus,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(format!("unterminated string starting at {}", i)),
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some(&escaped) => text.push(escaped),
                                None => return Err("dangling escape at end of input".to_string()),
                            }
                            i += 2;
                        }
                        // A doubled quote is a literal quote
                        Some(&ch) if ch == quote && chars.get(i + 1) == Some(&quote) => {
                            text.push(quote);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = chars[start..i].iter().collect();
                let n = digits
                    .parse::<i64>()
                    .map_err(|e| format!("invalid integer '{}': {}", digits, e))?;
                tokens.push(Token::Int(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}' at {}", other, i)),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Split,
    ToUpperCase,
    ToLowerCase,
    Trim,
    Length,
}

impl Method {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "split" => Some(Method::Split),
            "toUpperCase" => Some(Method::ToUpperCase),
            "toLowerCase" => Some(Method::ToLowerCase),
            "trim" => Some(Method::Trim),
            "length" | "size" => Some(Method::Length),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            Method::Split => 1,
            _ => 0,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Method::Split => "split",
            Method::ToUpperCase => "toUpperCase",
            Method::ToLowerCase => "toLowerCase",
            Method::Trim => "trim",
            Method::Length => "length",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Payload,
    Headers,
    Literal(Value),
    Field(Box<Node>, String),
    Index(Box<Node>, Value),
    Call(Box<Node>, Method, Vec<Node>),
    Concat(Vec<Node>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(ref t) if *t == expected => Ok(()),
            Some(t) => Err(format!("expected {:?}, found {:?}", expected, t)),
            None => Err(format!("expected {:?}, found end of input", expected)),
        }
    }

    fn parse_expr(&mut self) -> Result<Node, String> {
        let mut terms = vec![self.parse_postfix()?];
        while self.peek() == Some(&Token::Plus) {
            self.next();
            terms.push(self.parse_postfix()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Node::Concat(terms)
        })
    }

    fn parse_primary(&mut self) -> Result<Node, String> {
        match self.next() {
            Some(Token::Ident(name)) => match name.as_str() {
                "payload" => Ok(Node::Payload),
                "headers" => Ok(Node::Headers),
                "true" => Ok(Node::Literal(Value::Bool(true))),
                "false" => Ok(Node::Literal(Value::Bool(false))),
                "null" => Ok(Node::Literal(Value::Null)),
                other => Err(format!(
                    "unknown root '{}', expected payload, headers or a literal",
                    other
                )),
            },
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::Int(n)) => Ok(Node::Literal(Value::from(n))),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(t) => Err(format!("unexpected token {:?}", t)),
            None => Err("unexpected end of input".to_string()),
        }
    }

    fn parse_postfix(&mut self) -> Result<Node, String> {
        let mut node = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        other => return Err(format!("expected identifier after '.', found {:?}", other)),
                    };
                    if self.peek() == Some(&Token::LParen) {
                        self.next();
                        let method = Method::from_name(&name)
                            .ok_or_else(|| format!("unknown method '{}'", name))?;
                        let args = self.parse_args()?;
                        if args.len() != method.arity() {
                            return Err(format!(
                                "method '{}' takes {} argument(s), got {}",
                                method.name(),
                                method.arity(),
                                args.len()
                            ));
                        }
                        node = Node::Call(Box::new(node), method, args);
                    } else {
                        node = Node::Field(Box::new(node), name);
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let key = match self.next() {
                        Some(Token::Str(s)) => Value::String(s),
                        Some(Token::Int(n)) => Value::from(n),
                        other => return Err(format!("expected string or integer index, found {:?}", other)),
                    };
                    self.expect(Token::RBracket)?;
                    node = Node::Index(Box::new(node), key);
                }
                _ => return Ok(node),
            }
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Node>, String> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.next();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                other => return Err(format!("expected ',' or ')', found {:?}", other)),
            }
        }
    }
}

/// A parsed expression, ready to evaluate against any number of records
#[derive(Clone)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    /// Parse an expression. Syntax errors are configuration errors.
    pub fn parse(source: &str) -> Result<Self, StageError> {
        let invalid = |reason: String| {
            StageError::configuration(format!("invalid expression '{}': {}", source, reason))
        };

        let tokens = tokenize(source).map_err(invalid)?;
        if tokens.is_empty() {
            return Err(invalid("expression is empty".to_string()));
        }

        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_expr().map_err(invalid)?;
        if let Some(extra) = parser.peek() {
            return Err(invalid(format!("unexpected trailing token {:?}", extra)));
        }

        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a record
    pub fn evaluate(&self, record: &Record) -> Result<Value, StageError> {
        eval(&self.root, record).map_err(|reason| StageError::evaluation(&self.source, reason))
    }

    /// Evaluate and render the result as a name (target, task name, ...).
    ///
    /// Null, arrays and objects cannot name anything and are rejected.
    pub fn evaluate_to_string(&self, record: &Record) -> Result<String, StageError> {
        let value = self.evaluate(record)?;
        render_name(&value).map_err(|reason| StageError::evaluation(&self.source, reason))
    }
}

fn eval(node: &Node, record: &Record) -> Result<Value, String> {
    match node {
        Node::Payload => Ok(record.payload().to_value()),
        Node::Headers => Ok(Value::Object(
            record
                .headers()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )),
        Node::Literal(v) => Ok(v.clone()),
        Node::Field(base, name) => match eval(base, record)? {
            Value::Object(mut map) => Ok(map.remove(name).unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            other => Err(format!(
                "cannot read field '{}' of {}",
                name,
                type_name(&other)
            )),
        },
        Node::Index(base, key) => {
            let target = eval(base, record)?;
            match (target, key) {
                (Value::Object(mut map), Value::String(k)) => {
                    Ok(map.remove(k).unwrap_or(Value::Null))
                }
                (Value::Array(mut items), Value::Number(n)) => {
                    let idx = n.as_u64().unwrap_or(u64::MAX) as usize;
                    if idx < items.len() {
                        Ok(items.swap_remove(idx))
                    } else {
                        Ok(Value::Null)
                    }
                }
                (Value::Null, _) => Ok(Value::Null),
                (other, key) => Err(format!("cannot index {} with {}", type_name(&other), key)),
            }
        }
        Node::Call(base, method, args) => {
            let target = eval(base, record)?;
            call(&target, *method, args, record)
        }
        Node::Concat(terms) => {
            let mut out = String::new();
            for term in terms {
                out.push_str(&render_concat(&eval(term, record)?));
            }
            Ok(Value::String(out))
        }
    }
}

fn call(target: &Value, method: Method, args: &[Node], record: &Record) -> Result<Value, String> {
    match (method, target) {
        (Method::Split, Value::String(s)) => {
            let sep = match eval(&args[0], record)? {
                Value::String(sep) if !sep.is_empty() => sep,
                other => return Err(format!("split separator must be a non-empty string, got {}", other)),
            };
            let mut parts: Vec<&str> = s.split(sep.as_str()).collect();
            // Trailing empty segments are dropped, leading ones are kept
            while parts.last().is_some_and(|p| p.is_empty()) {
                parts.pop();
            }
            Ok(Value::Array(
                parts.into_iter().map(|p| Value::String(p.to_string())).collect(),
            ))
        }
        (Method::ToUpperCase, Value::String(s)) => Ok(Value::String(s.to_uppercase())),
        (Method::ToLowerCase, Value::String(s)) => Ok(Value::String(s.to_lowercase())),
        (Method::Trim, Value::String(s)) => Ok(Value::String(s.trim().to_string())),
        (Method::Length, Value::String(s)) => Ok(Value::from(s.chars().count())),
        (Method::Length, Value::Array(items)) => Ok(Value::from(items.len())),
        (Method::Length, Value::Object(map)) => Ok(Value::from(map.len())),
        (method, other) => Err(format!(
            "method '{}' is not defined on {}",
            method.name(),
            type_name(other)
        )),
    }
}

fn render_concat(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_name(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("evaluated to {}, expected a string", type_name(other))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expression").field(&self.source).finish()
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl FromStr for Expression {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expression::parse(s)
    }
}

impl TryFrom<String> for Expression {
    type Error = StageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Expression::parse(&s)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = crate::config::ScalarString::deserialize(deserializer)?.0;
        Expression::parse(&source).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_str(expr: &str, record: &Record) -> Result<String, StageError> {
        Expression::parse(expr).unwrap().evaluate_to_string(record)
    }

    #[test]
    fn test_header_lookup() {
        let record = Record::builder("hello").header("dest", "Q2").build();
        assert_eq!(eval_str("headers['dest']", &record).unwrap(), "Q2");
        assert_eq!(eval_str("headers.dest", &record).unwrap(), "Q2");
        assert_eq!(eval_str("headers[\"dest\"]", &record).unwrap(), "Q2");
    }

    #[test]
    fn test_missing_header_is_null() {
        let record = Record::new("hello");
        let expr = Expression::parse("headers['nope']").unwrap();
        assert_eq!(expr.evaluate(&record).unwrap(), Value::Null);

        let err = expr.evaluate_to_string(&record).unwrap_err();
        assert!(err.is_evaluation());
        assert!(err.to_string().contains("null"));
    }

    #[test]
    fn test_structured_payload_access() {
        let record = Record::new(json!({"order": {"id": 42, "tags": ["a", "b"]}}));
        assert_eq!(eval_str("payload.order.id", &record).unwrap(), "42");
        assert_eq!(eval_str("payload['order'].tags[1]", &record).unwrap(), "b");
        assert_eq!(
            Expression::parse("payload.order.tags[5]")
                .unwrap()
                .evaluate(&record)
                .unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_concatenation() {
        let record = Record::builder(json!({"id": 7}))
            .header("tenant", "acme")
            .build();
        assert_eq!(
            eval_str("headers.tenant + '.orders.' + payload.id", &record).unwrap(),
            "acme.orders.7"
        );
    }

    #[test]
    fn test_split_method() {
        let record = Record::new("hello,world,");
        let value = Expression::parse("payload.split(',')")
            .unwrap()
            .evaluate(&record)
            .unwrap();
        assert_eq!(value, json!(["hello", "world"]));
    }

    #[test]
    fn test_string_methods() {
        let record = Record::new("  MiXed ");
        assert_eq!(eval_str("payload.trim().toLowerCase()", &record).unwrap(), "mixed");
        assert_eq!(eval_str("payload.toUpperCase().trim()", &record).unwrap(), "MIXED");
        assert_eq!(eval_str("payload.length()", &record).unwrap(), "8");
    }

    #[test]
    fn test_quote_escapes() {
        let record = Record::new("x");
        assert_eq!(eval_str("'it''s'", &record).unwrap(), "it's");
        assert_eq!(eval_str(r"'a\'b'", &record).unwrap(), "a'b");
    }

    #[test]
    fn test_parse_errors_are_configuration_errors() {
        for bad in ["", "payload.", "headers[", "payload.split()", "foo", "payload.explode()", "'open", "payload )"] {
            let err = Expression::parse(bad).unwrap_err();
            assert!(err.is_configuration(), "{} -> {:?}", bad, err);
        }
    }

    #[test]
    fn test_method_type_mismatch_is_evaluation_error() {
        let record = Record::new(json!({"a": 1}));
        let err = Expression::parse("payload.toUpperCase()")
            .unwrap()
            .evaluate(&record)
            .unwrap_err();
        assert!(err.is_evaluation());
    }

    #[test]
    fn test_field_on_scalar_is_evaluation_error() {
        let record = Record::new("plain");
        let err = Expression::parse("payload.id")
            .unwrap()
            .evaluate(&record)
            .unwrap_err();
        assert!(err.is_evaluation());
    }

    #[test]
    fn test_evaluation_is_repeatable() {
        let expr = Expression::parse("headers['dest'] + '-' + payload").unwrap();
        let record = Record::builder("p").header("dest", "d").build();
        assert_eq!(
            expr.evaluate(&record).unwrap(),
            expr.evaluate(&record).unwrap()
        );
    }

    #[test]
    fn test_serde_round_trip_keeps_source() {
        let expr: Expression = serde_json::from_str("\"headers['dest']\"").unwrap();
        assert_eq!(expr.source(), "headers['dest']");
        assert_eq!(serde_json::to_string(&expr).unwrap(), "\"headers['dest']\"");

        let bad: Result<Expression, _> = serde_json::from_str("\"payload.\"");
        assert!(bad.is_err());
    }
}
