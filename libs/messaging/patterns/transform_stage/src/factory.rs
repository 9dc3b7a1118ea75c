//! StageFactory for creating stages from configuration
//!
//! The factory owns nothing but handles: the collaborator every write stage
//! delegates to and the shared connection pool. Stages configured with
//! `ownership = "owned"` get a dedicated pool instead.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Ownership, StageConfig, StageKind, StagesConfig};
use crate::functions::{BridgeFunction, Splitter, SplitterFunction, TransformFunction};
use crate::lease::{ConnectionOwnership, ConnectionPool};
use crate::stage::WriteStageBuilder;
use crate::{Collaborator, Stage, StageError};

#[derive(Debug, Clone)]
pub struct StageFactory {
    /// Collaborator handed to every write stage
    collaborator: Arc<dyn Collaborator>,

    /// Pool used by stages with shared ownership
    shared_pool: Arc<ConnectionPool>,
}

impl StageFactory {
    pub fn new(collaborator: Arc<dyn Collaborator>, shared_pool: Arc<ConnectionPool>) -> Self {
        Self {
            collaborator,
            shared_pool,
        }
    }

    pub fn shared_pool(&self) -> &Arc<ConnectionPool> {
        &self.shared_pool
    }

    /// Build one stage. Fails with a configuration error before any record is seen.
    pub fn build(&self, name: &str, config: &StageConfig) -> Result<Arc<dyn Stage>, StageError> {
        config.validate().map_err(|e| match e {
            StageError::Configuration(msg) => {
                StageError::configuration(format!("Stage '{}': {}", name, msg))
            }
            other => other,
        })?;

        let stage: Arc<dyn Stage> = match &config.kind {
            StageKind::Redis(options) => self.write_stage(name, config, options.builder(name)?)?,
            StageKind::Rabbit(options) => self.write_stage(name, config, options.builder(name)?)?,
            StageKind::Mongodb(options) => {
                self.write_stage(name, config, options.builder(name)?)?
            }
            StageKind::Store(options) => self.write_stage(name, config, options.builder(name)?)?,
            StageKind::Splitter(options) => {
                let splitter =
                    Splitter::from_options(options.delimiters.as_deref(), options.expression.as_ref())?
                        .with_apply_sequence(config.apply_sequence);
                Arc::new(SplitterFunction::new(name, splitter, config.decode_text))
            }
            StageKind::Transform(options) => Arc::new(TransformFunction::new(
                name,
                options.expression()?,
                config.decode_text,
            )),
            StageKind::Bridge => Arc::new(BridgeFunction::new(name)),
            StageKind::TaskLaunch(options) => Arc::new(options.build(name, config.decode_text)?),
        };

        tracing::info!("Created stage '{}' (type: {})", name, config.kind.name());
        Ok(stage)
    }

    /// Build every configured stage
    pub fn build_all(
        &self,
        config: &StagesConfig,
    ) -> Result<HashMap<String, Arc<dyn Stage>>, StageError> {
        config
            .stages
            .iter()
            .map(|(name, stage)| Ok((name.clone(), self.build(name, stage)?)))
            .collect()
    }

    /// Build the stage called `name` from `config`
    pub fn build_named(
        &self,
        config: &StagesConfig,
        name: &str,
    ) -> Result<Arc<dyn Stage>, StageError> {
        let stage = config.get_stage(name).ok_or_else(|| {
            StageError::configuration(format!("Stage '{}' not found in configuration", name))
        })?;
        self.build(name, stage)
    }

    fn write_stage(
        &self,
        name: &str,
        config: &StageConfig,
        builder: WriteStageBuilder,
    ) -> Result<Arc<dyn Stage>, StageError> {
        let ownership = match config.ownership {
            Ownership::Shared => ConnectionOwnership::Shared(self.shared_pool.clone()),
            Ownership::Owned => ConnectionOwnership::Owned {
                max_connections: config.max_in_flight,
            },
        };

        let builder = builder
            .decode_text(config.decode_text)
            .lease_timeout(config.lease_timeout());
        let builder = match config.splitter()? {
            Some(splitter) => builder.split(splitter),
            None => builder,
        };

        tracing::debug!("Stage '{}' leases from {:?}", name, config.ownership);
        Ok(Arc::new(builder.build(self.collaborator.clone(), ownership)))
    }
}
