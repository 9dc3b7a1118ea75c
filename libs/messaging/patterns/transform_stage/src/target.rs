use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::{Expression, Record, StageError};

/// Caller-supplied resolver used in place of an expression
pub type ResolverFn = Arc<dyn Fn(&Record) -> Result<String, StageError> + Send + Sync>;

/// What kind of destination a resolved target names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Key/value store entry (stored as a list under the key)
    Key,
    /// Work queue
    Queue,
    /// Pub/sub topic or channel
    Topic,
    /// Broker exchange, qualified by a routing key
    Exchange,
    /// Document collection
    Collection,
    /// Table in a row store
    Table,
}

impl TargetKind {
    pub fn name(self) -> &'static str {
        match self {
            TargetKind::Key => "key",
            TargetKind::Queue => "queue",
            TargetKind::Topic => "topic",
            TargetKind::Exchange => "exchange",
            TargetKind::Collection => "collection",
            TargetKind::Table => "table",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a stage names where a record goes: fixed, or computed per record
#[derive(Clone)]
pub enum TargetSpec {
    Literal(String),
    Expression(Expression),
    Function { name: String, resolver: ResolverFn },
}

impl TargetSpec {
    pub fn literal(name: impl Into<String>) -> Self {
        TargetSpec::Literal(name.into())
    }

    pub fn expression(source: &str) -> Result<Self, StageError> {
        Ok(TargetSpec::Expression(Expression::parse(source)?))
    }

    pub fn function<F>(name: impl Into<String>, resolver: F) -> Self
    where
        F: Fn(&Record) -> Result<String, StageError> + Send + Sync + 'static,
    {
        TargetSpec::Function {
            name: name.into(),
            resolver: Arc::new(resolver),
        }
    }

    /// Build from a literal/expression option pair; exactly one must be set.
    pub fn from_options(
        option: &str,
        literal: Option<&str>,
        expression: Option<&Expression>,
    ) -> Result<Self, StageError> {
        match (literal, expression) {
            (Some(name), None) => Ok(TargetSpec::literal(name)),
            (None, Some(expr)) => Ok(TargetSpec::Expression(expr.clone())),
            (Some(_), Some(_)) => Err(StageError::configuration(format!(
                "'{option}' and '{option}_expression' are mutually exclusive"
            ))),
            (None, None) => Err(StageError::configuration(format!(
                "one of '{option}' or '{option}_expression' is required"
            ))),
        }
    }

    /// Like [`TargetSpec::from_options`], but falls back to `default` when neither is set
    pub fn from_options_or(
        option: &str,
        literal: Option<&str>,
        expression: Option<&Expression>,
        default: &str,
    ) -> Result<Self, StageError> {
        if literal.is_none() && expression.is_none() {
            return Ok(TargetSpec::literal(default));
        }
        Self::from_options(option, literal, expression)
    }

    /// Resolve the effective target for one record. Pure: the same record
    /// always resolves to the same name.
    pub fn resolve(&self, record: &Record) -> Result<String, StageError> {
        match self {
            TargetSpec::Literal(name) => Ok(name.clone()),
            TargetSpec::Expression(expr) => expr.evaluate_to_string(record),
            TargetSpec::Function { resolver, .. } => resolver(record),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        !matches!(self, TargetSpec::Literal(_))
    }
}

impl fmt::Debug for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpec::Literal(name) => f.debug_tuple("Literal").field(name).finish(),
            TargetSpec::Expression(expr) => f.debug_tuple("Expression").field(&expr.source()).finish(),
            TargetSpec::Function { name, .. } => f.debug_tuple("Function").field(name).finish(),
        }
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpec::Literal(name) => write!(f, "'{}'", name),
            TargetSpec::Expression(expr) => write!(f, "#{{{}}}", expr.source()),
            TargetSpec::Function { name, .. } => write!(f, "fn:{}", name),
        }
    }
}

/// Validate that exactly one of a group of options is set and return its name
pub fn exactly_one<'a>(options: &[(&'a str, bool)]) -> Result<&'a str, StageError> {
    let set: Vec<&str> = options
        .iter()
        .filter(|(_, present)| *present)
        .map(|(name, _)| *name)
        .collect();

    if set.len() == 1 {
        return Ok(set[0]);
    }

    let names = options
        .iter()
        .map(|(name, _)| format!("'{}'", name))
        .collect::<Vec<_>>()
        .join(", ");
    if set.is_empty() {
        Err(StageError::configuration(format!(
            "exactly one of {} must be set, found none",
            names
        )))
    } else {
        Err(StageError::configuration(format!(
            "exactly one of {} must be set, found {}",
            names,
            set.join(" and ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_or_expression_exclusive() {
        let expr = Expression::parse("headers['dest']").unwrap();

        let both = TargetSpec::from_options("queue", Some("T"), Some(&expr));
        assert!(both.unwrap_err().is_configuration());

        let neither = TargetSpec::from_options("queue", None, None);
        assert!(neither.unwrap_err().is_configuration());

        let literal = TargetSpec::from_options("queue", Some("T"), None).unwrap();
        assert!(!literal.is_dynamic());

        let dynamic = TargetSpec::from_options("queue", None, Some(&expr)).unwrap();
        assert!(dynamic.is_dynamic());
    }

    #[test]
    fn test_default_applies_only_when_neither_set() {
        let spec = TargetSpec::from_options_or("exchange", None, None, "").unwrap();
        assert_eq!(spec.resolve(&Record::new("x")).unwrap(), "");

        let expr = Expression::parse("'a'").unwrap();
        assert!(TargetSpec::from_options_or("exchange", Some("b"), Some(&expr), "").is_err());
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let spec = TargetSpec::expression("headers['dest']").unwrap();
        let record = Record::builder("payload").header("dest", "Q2").build();

        let first = spec.resolve(&record).unwrap();
        let second = spec.resolve(&record).unwrap();
        assert_eq!(first, "Q2");
        assert_eq!(first, second);
    }

    #[test]
    fn test_function_resolver() {
        let spec = TargetSpec::function("by-length", |record: &Record| {
            Ok(format!("bucket-{}", record.payload().size()))
        });
        assert_eq!(spec.resolve(&Record::new("abcd")).unwrap(), "bucket-4");
        assert_eq!(spec.to_string(), "fn:by-length");
    }

    #[test]
    fn test_exactly_one() {
        assert_eq!(
            exactly_one(&[("key", false), ("queue", true), ("topic", false)]).unwrap(),
            "queue"
        );

        let none = exactly_one(&[("key", false), ("queue", false)]).unwrap_err();
        assert!(none.to_string().contains("found none"));

        let two = exactly_one(&[("key", true), ("queue", true)]).unwrap_err();
        assert!(two.to_string().contains("key and queue"));
    }
}
