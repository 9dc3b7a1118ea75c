use serde::{Deserialize, Serialize};

use crate::stage::WriteStageBuilder;
use crate::{Expression, StageError, TargetKind, TargetSpec, WriteStage};

/// `[stages.<name>]` options for `type = "store"`, a table-oriented store
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TableStoreConfig {
    #[serde(deserialize_with = "crate::config::scalar_string")]
    pub table: Option<String>,
    pub table_expression: Option<Expression>,
}

impl TableStoreConfig {
    pub fn validate(&self) -> Result<(), StageError> {
        self.target().map(|_| ())
    }

    pub fn target(&self) -> Result<TargetSpec, StageError> {
        TargetSpec::from_options("table", self.table.as_deref(), self.table_expression.as_ref())
    }

    pub fn builder(&self, name: &str) -> Result<WriteStageBuilder, StageError> {
        Ok(WriteStage::builder(name, TargetKind::Table, self.target()?).stage_type("store"))
    }
}
