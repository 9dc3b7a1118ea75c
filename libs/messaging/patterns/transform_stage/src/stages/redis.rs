use serde::{Deserialize, Serialize};

use crate::stage::WriteStageBuilder;
use crate::target::exactly_one;
use crate::{Expression, StageError, TargetKind, TargetSpec, WriteStage};

/// `[stages.<name>]` options for `type = "redis"`.
///
/// Exactly one of the six destination options must be set. A key appends
/// to a list, a queue pushes for a consumer, a topic publishes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RedisStageConfig {
    #[serde(deserialize_with = "crate::config::scalar_string")]
    pub key: Option<String>,
    pub key_expression: Option<Expression>,
    #[serde(deserialize_with = "crate::config::scalar_string")]
    pub queue: Option<String>,
    pub queue_expression: Option<Expression>,
    #[serde(deserialize_with = "crate::config::scalar_string")]
    pub topic: Option<String>,
    pub topic_expression: Option<Expression>,
}

impl RedisStageConfig {
    pub fn validate(&self) -> Result<(), StageError> {
        self.target().map(|_| ())
    }

    /// The single configured destination
    pub fn target(&self) -> Result<(TargetKind, TargetSpec), StageError> {
        let chosen = exactly_one(&[
            ("key", self.key.is_some()),
            ("key_expression", self.key_expression.is_some()),
            ("queue", self.queue.is_some()),
            ("queue_expression", self.queue_expression.is_some()),
            ("topic", self.topic.is_some()),
            ("topic_expression", self.topic_expression.is_some()),
        ])?;

        let (kind, literal, expression) = match chosen {
            "key" | "key_expression" => (TargetKind::Key, &self.key, &self.key_expression),
            "queue" | "queue_expression" => {
                (TargetKind::Queue, &self.queue, &self.queue_expression)
            }
            _ => (TargetKind::Topic, &self.topic, &self.topic_expression),
        };

        let spec = TargetSpec::from_options(kind.name(), literal.as_deref(), expression.as_ref())?;
        Ok((kind, spec))
    }

    pub fn builder(&self, name: &str) -> Result<WriteStageBuilder, StageError> {
        let (kind, spec) = self.target()?;
        Ok(WriteStage::builder(name, kind, spec).stage_type("redis"))
    }
}
