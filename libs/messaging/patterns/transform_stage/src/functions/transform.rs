use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::metadata::StageCounters;
use crate::{CompletionSignal, Expression, Payload, Record, Stage, StageError, StageMetadata};

/// `[stages.<name>]` options for `type = "transform"`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Defaults to `payload`, which leaves the record unchanged
    pub expression: Option<Expression>,
}

impl TransformConfig {
    pub fn expression(&self) -> Result<Expression, StageError> {
        match &self.expression {
            Some(expr) => Ok(expr.clone()),
            None => Expression::parse("payload"),
        }
    }
}

/// Replaces each payload with the result of an expression
#[derive(Debug)]
pub struct TransformFunction {
    name: String,
    expression: Expression,
    decode_text: bool,
    counters: StageCounters,
}

impl TransformFunction {
    pub fn new(name: impl Into<String>, expression: Expression, decode_text: bool) -> Self {
        Self {
            name: name.into(),
            expression,
            decode_text,
            counters: StageCounters::new(),
        }
    }

    fn apply(&self, record: Record) -> Result<Record, StageError> {
        let record = if self.decode_text {
            record.decode_text()
        } else {
            record
        };
        let value = self.expression.evaluate(&record)?;
        Ok(record.with_payload(Payload::from_value(value)))
    }
}

#[async_trait]
impl Stage for TransformFunction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, record: Record) -> CompletionSignal {
        let signal = match self.apply(record) {
            Ok(out) => CompletionSignal::AcceptedWith(out),
            Err(err) => CompletionSignal::Rejected(err),
        };
        self.counters.observe(&signal);
        signal
    }

    fn metadata(&self) -> StageMetadata {
        self.counters.fill(
            StageMetadata::new(&self.name, "transform").with_target(self.expression.source()),
        )
    }
}
