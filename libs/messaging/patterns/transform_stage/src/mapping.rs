//! Outbound header selection for broker stages.
//!
//! Patterns are tried in order and the first match decides. A pattern
//! starting with `!` excludes the header, any other pattern includes it.
//! Supported shapes are `*`, `prefix*`, `*suffix` and exact names. Headers
//! matching no pattern are dropped.

use crate::{Headers, StageError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Shape {
    Any,
    Prefix(String),
    Suffix(String),
    Exact(String),
}

impl Shape {
    fn matches(&self, name: &str) -> bool {
        match self {
            Shape::Any => true,
            Shape::Prefix(prefix) => name.starts_with(prefix.as_str()),
            Shape::Suffix(suffix) => name.ends_with(suffix.as_str()),
            Shape::Exact(exact) => name == exact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderPattern {
    negated: bool,
    shape: Shape,
}

impl HeaderPattern {
    fn parse(raw: &str) -> Result<Self, StageError> {
        let raw = raw.trim();
        let (negated, body) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, raw),
        };

        let shape = if body == "*" {
            Shape::Any
        } else if let Some(prefix) = body.strip_suffix('*') {
            Shape::Prefix(prefix.to_string())
        } else if let Some(suffix) = body.strip_prefix('*') {
            Shape::Suffix(suffix.to_string())
        } else {
            Shape::Exact(body.to_string())
        };

        let invalid = match &shape {
            Shape::Any => false,
            Shape::Prefix(s) | Shape::Suffix(s) | Shape::Exact(s) => s.is_empty() || s.contains('*'),
        };
        if invalid {
            return Err(StageError::configuration(format!(
                "invalid header pattern '{}'",
                raw
            )));
        }

        Ok(Self { negated, shape })
    }
}

/// Ordered list of header patterns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMapper {
    patterns: Vec<HeaderPattern>,
}

impl HeaderMapper {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, StageError> {
        let patterns = patterns
            .iter()
            .map(|p| HeaderPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Forward every header
    pub fn all() -> Self {
        Self {
            patterns: vec![HeaderPattern {
                negated: false,
                shape: Shape::Any,
            }],
        }
    }

    pub fn is_mapped(&self, name: &str) -> bool {
        self.patterns
            .iter()
            .find(|p| p.shape.matches(name))
            .map(|p| !p.negated)
            .unwrap_or(false)
    }

    pub fn map(&self, headers: &Headers) -> Headers {
        headers
            .iter()
            .filter(|(name, _)| self.is_mapped(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

impl Default for HeaderMapper {
    fn default() -> Self {
        Self::all()
    }
}
