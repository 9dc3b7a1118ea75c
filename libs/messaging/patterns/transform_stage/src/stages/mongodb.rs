use serde::{Deserialize, Serialize};

use crate::stage::WriteStageBuilder;
use crate::{Expression, StageError, TargetKind, TargetSpec, WriteStage};

/// `[stages.<name>]` options for `type = "mongodb"`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MongoStageConfig {
    #[serde(deserialize_with = "crate::config::scalar_string")]
    pub collection: Option<String>,
    pub collection_expression: Option<Expression>,
}

impl MongoStageConfig {
    pub fn validate(&self) -> Result<(), StageError> {
        self.target().map(|_| ())
    }

    pub fn target(&self) -> Result<TargetSpec, StageError> {
        TargetSpec::from_options(
            "collection",
            self.collection.as_deref(),
            self.collection_expression.as_ref(),
        )
    }

    pub fn builder(&self, name: &str) -> Result<WriteStageBuilder, StageError> {
        Ok(WriteStage::builder(name, TargetKind::Collection, self.target()?).stage_type("mongodb"))
    }
}
