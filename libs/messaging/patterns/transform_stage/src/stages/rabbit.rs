use serde::{Deserialize, Serialize};

use crate::mapping::HeaderMapper;
use crate::stage::WriteStageBuilder;
use crate::{Expression, StageError, TargetKind, TargetSpec, WriteStage};

/// Default exchange name used when none is configured
pub const DEFAULT_EXCHANGE: &str = "";

/// `[stages.<name>]` options for `type = "rabbit"`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RabbitStageConfig {
    #[serde(deserialize_with = "crate::config::scalar_string")]
    pub exchange: Option<String>,
    pub exchange_expression: Option<Expression>,
    #[serde(deserialize_with = "crate::config::scalar_string")]
    pub routing_key: Option<String>,
    pub routing_key_expression: Option<Expression>,
    /// Default delivery mode; `amqp_deliveryMode` on a record overrides it
    pub persistent_delivery: bool,
    /// Header patterns forwarded to the broker
    pub mapped_headers: Vec<String>,
}

impl Default for RabbitStageConfig {
    fn default() -> Self {
        Self {
            exchange: None,
            exchange_expression: None,
            routing_key: None,
            routing_key_expression: None,
            persistent_delivery: false,
            mapped_headers: vec!["*".to_string()],
        }
    }
}

impl RabbitStageConfig {
    pub fn validate(&self) -> Result<(), StageError> {
        self.builder("validate").map(|_| ())
    }

    pub fn builder(&self, name: &str) -> Result<WriteStageBuilder, StageError> {
        let exchange = TargetSpec::from_options_or(
            "exchange",
            self.exchange.as_deref(),
            self.exchange_expression.as_ref(),
            DEFAULT_EXCHANGE,
        )?;
        let routing_key = TargetSpec::from_options(
            "routing_key",
            self.routing_key.as_deref(),
            self.routing_key_expression.as_ref(),
        )?;
        let headers = HeaderMapper::new(&self.mapped_headers)?;

        Ok(WriteStage::builder(name, TargetKind::Exchange, exchange)
            .stage_type("rabbit")
            .route(routing_key)
            .persistent_delivery(self.persistent_delivery)
            .headers(headers))
    }
}
