//! Configuration support for the stage factory
//!
//! Stages are declared in TOML as `[stages.<name>]` tables. The `type` key
//! selects the stage kind; the remaining keys are the kind's own options
//! plus the common options in [`StageConfig`]:
//!
//! ```toml
//! [stages.orders]
//! type = "redis"
//! queue_expression = "headers['dest']"
//! split = true
//! ownership = "owned"
//! max_in_flight = 4
//! ```
//!
//! [`StagesConfig::load`] layers environment overrides on top of the file,
//! e.g. `STAGES__STAGES__ORDERS__MAX_IN_FLIGHT=8`.

use config_crate::{Config, Environment, File, FileFormat};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::functions::{SplitterConfig, Splitter, TaskLaunchConfig, TransformConfig};
use crate::stages::{MongoStageConfig, RabbitStageConfig, RedisStageConfig, TableStoreConfig};
use crate::{Expression, StageError};

/// Environment prefix used by [`StagesConfig::load`]
pub const ENV_PREFIX: &str = "STAGES";
/// Separator between nested keys in environment overrides
pub const ENV_SEPARATOR: &str = "__";

pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;
pub const DEFAULT_LEASE_TIMEOUT_MS: u64 = 5_000;

/// Top-level stages configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StagesConfig {
    /// Map of stage name to stage configuration
    #[serde(default)]
    pub stages: HashMap<String, StageConfig>,
}

/// Configuration for a single stage
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageConfig {
    /// Stage kind and its own options
    #[serde(flatten)]
    pub kind: StageKind,

    /// Decode text/json byte payloads before evaluating or writing
    #[serde(default = "default_true")]
    pub decode_text: bool,

    /// Split each record and write the fragments (write stages only)
    #[serde(default)]
    pub split: bool,

    /// Delimiters used when `split` is on
    #[serde(default, deserialize_with = "scalar_string")]
    pub split_delimiters: Option<String>,

    /// Expression used when `split` is on
    #[serde(default)]
    pub split_expression: Option<Expression>,

    /// Add correlation/sequence headers to fragments
    #[serde(default = "default_true")]
    pub apply_sequence: bool,

    /// Whether the stage leases from the shared pool or its own
    #[serde(default)]
    pub ownership: Ownership,

    /// Size of the stage's own pool when `ownership = "owned"`
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// How long a write waits for a pool slot
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_lease_timeout_ms() -> u64 {
    DEFAULT_LEASE_TIMEOUT_MS
}

/// A name-like option that also accepts a bare number or boolean.
///
/// Environment overrides are type-guessed, so `QUEUE=2024` arrives as an
/// integer and still has to read as the name `"2024"`.
pub(crate) struct ScalarString(pub(crate) String);

impl<'de> Deserialize<'de> for ScalarString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ScalarVisitor;

        impl<'de> Visitor<'de> for ScalarVisitor {
            type Value = ScalarString;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string, number or boolean")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(ScalarString(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }
        }

        deserializer.deserialize_any(ScalarVisitor)
    }
}

/// `deserialize_with` helper for optional name-like options
pub(crate) fn scalar_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<ScalarString>::deserialize(deserializer)?.map(|s| s.0))
}

/// Supported stage kinds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageKind {
    /// Key/value store: list append, queue push or topic publish
    Redis(RedisStageConfig),
    /// Broker publish to an exchange with a routing key
    Rabbit(RabbitStageConfig),
    /// Document store collection insert
    Mongodb(MongoStageConfig),
    /// Table-oriented store insert
    Store(TableStoreConfig),
    /// Split payloads into fragments
    Splitter(SplitterConfig),
    /// Replace payloads with an expression result
    Transform(TransformConfig),
    /// Pass records through unchanged
    Bridge,
    /// Build task-launch requests
    TaskLaunch(TaskLaunchConfig),
}

impl StageKind {
    /// Get name used in logs and metadata
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Redis(_) => "redis",
            StageKind::Rabbit(_) => "rabbit",
            StageKind::Mongodb(_) => "mongodb",
            StageKind::Store(_) => "store",
            StageKind::Splitter(_) => "splitter",
            StageKind::Transform(_) => "transform",
            StageKind::Bridge => "bridge",
            StageKind::TaskLaunch(_) => "task_launch",
        }
    }

    /// Whether the stage writes through a collaborator
    pub fn is_write_stage(&self) -> bool {
        matches!(
            self,
            StageKind::Redis(_) | StageKind::Rabbit(_) | StageKind::Mongodb(_) | StageKind::Store(_)
        )
    }

    pub fn validate(&self) -> Result<(), StageError> {
        match self {
            StageKind::Redis(config) => config.validate(),
            StageKind::Rabbit(config) => config.validate(),
            StageKind::Mongodb(config) => config.validate(),
            StageKind::Store(config) => config.validate(),
            StageKind::Splitter(config) => config.validate(),
            StageKind::Transform(config) => config.expression().map(|_| ()),
            StageKind::Bridge => Ok(()),
            StageKind::TaskLaunch(config) => config.validate(),
        }
    }
}

/// Which pool a stage leases connections from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    /// The pool handed to the factory
    #[default]
    Shared,
    /// A dedicated pool of `max_in_flight` slots
    Owned,
}

impl StageConfig {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            decode_text: true,
            split: false,
            split_delimiters: None,
            split_expression: None,
            apply_sequence: true,
            ownership: Ownership::Shared,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            lease_timeout_ms: DEFAULT_LEASE_TIMEOUT_MS,
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    /// Splitter used before writing, if `split` is on
    pub fn splitter(&self) -> Result<Option<Splitter>, StageError> {
        if !self.split {
            return Ok(None);
        }
        let splitter = Splitter::from_options(
            self.split_delimiters.as_deref(),
            self.split_expression.as_ref(),
        )?;
        Ok(Some(splitter.with_apply_sequence(self.apply_sequence)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), StageError> {
        if self.max_in_flight == 0 {
            return Err(StageError::configuration(
                "max_in_flight must be greater than 0",
            ));
        }
        if self.lease_timeout_ms == 0 {
            return Err(StageError::configuration(
                "lease_timeout_ms must be greater than 0",
            ));
        }

        if !self.split && (self.split_delimiters.is_some() || self.split_expression.is_some()) {
            return Err(StageError::configuration(
                "split_delimiters/split_expression require split = true",
            ));
        }
        if self.split && !self.kind.is_write_stage() {
            return Err(StageError::configuration(format!(
                "split is not supported by {} stages",
                self.kind.name()
            )));
        }
        self.splitter()?;

        self.kind.validate()
    }
}

impl StagesConfig {
    /// Create from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, StageError> {
        toml::from_str(toml_str)
            .map_err(|e| StageError::configuration(format!("Failed to parse TOML: {}", e)))
    }

    /// Create from file path
    pub fn from_file(path: &Path) -> Result<Self, StageError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StageError::configuration(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml(&content)
    }

    /// Load `path` with environment overrides under [`ENV_PREFIX`]
    pub fn load(path: &Path) -> Result<Self, StageError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Load `path`, then apply `<prefix>__...` environment overrides
    pub fn load_with_prefix(path: &Path, prefix: &str) -> Result<Self, StageError> {
        let config = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(true))
            .add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                StageError::configuration(format!("Failed to build configuration: {}", e))
            })?;

        config.try_deserialize().map_err(|e| {
            StageError::configuration(format!("Failed to deserialize configuration: {}", e))
        })
    }

    /// Convert to TOML string
    pub fn to_toml(&self) -> Result<String, StageError> {
        toml::to_string_pretty(self)
            .map_err(|e| StageError::configuration(format!("Failed to serialize to TOML: {}", e)))
    }

    /// Validate all stage configurations
    pub fn validate(&self) -> Result<(), StageError> {
        for (stage_name, config) in &self.stages {
            config.validate().map_err(|e| match e {
                StageError::Configuration(msg) => {
                    StageError::configuration(format!("Stage '{}': {}", stage_name, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Get stage configuration by name
    pub fn get_stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_basic_config() {
        let toml = r#"
            [stages.orders]
            type = "redis"
            queue_expression = "headers['dest']"
            lease_timeout_ms = 250

            [stages.passthrough]
            type = "bridge"
        "#;

        let config = StagesConfig::from_toml(toml).unwrap();
        config.validate().unwrap();

        let orders = config.get_stage("orders").unwrap();
        assert_eq!(orders.kind.name(), "redis");
        assert!(orders.decode_text);
        assert_eq!(orders.ownership, Ownership::Shared);
        assert_eq!(orders.lease_timeout(), Duration::from_millis(250));
        assert_eq!(orders.max_in_flight, DEFAULT_MAX_IN_FLIGHT);

        assert!(matches!(
            config.get_stage("passthrough").unwrap().kind,
            StageKind::Bridge
        ));
    }

    #[test]
    fn test_parse_rabbit_defaults() {
        let toml = r#"
            [stages.publish]
            type = "rabbit"
            routing_key = "orders.eu"
            ownership = "owned"
        "#;
        let config = StagesConfig::from_toml(toml).unwrap();
        let stage = config.get_stage("publish").unwrap();
        let StageKind::Rabbit(rabbit) = &stage.kind else {
            panic!("expected rabbit stage");
        };
        assert_eq!(rabbit.mapped_headers, vec!["*".to_string()]);
        assert!(!rabbit.persistent_delivery);
        assert_eq!(stage.ownership, Ownership::Owned);
    }

    #[test]
    fn test_validation_names_the_stage() {
        let toml = r#"
            [stages.broken]
            type = "mongodb"
            collection = "a"
            collection_expression = "headers['c']"
        "#;
        let err = StagesConfig::from_toml(toml).unwrap().validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Stage 'broken'"));
    }

    #[test]
    fn test_invalid_expression_fails_at_load() {
        let toml = r#"
            [stages.bad]
            type = "store"
            table_expression = "headers['unterminated"
        "#;
        assert!(StagesConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let toml = r#"
            [stages.what]
            type = "carrier_pigeon"
        "#;
        assert!(StagesConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_common_option_validation() {
        let mut config = StageConfig::new(StageKind::Bridge);
        config.max_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = StageConfig::new(StageKind::Bridge);
        config.split = true;
        assert!(config.validate().unwrap_err().to_string().contains("bridge"));

        let mut config = StageConfig::new(StageKind::Store(TableStoreConfig {
            table: Some("t".to_string()),
            table_expression: None,
        }));
        config.split_delimiters = Some(";".to_string());
        assert!(config.validate().is_err());
        config.split = true;
        config.validate().unwrap();
        assert!(config.splitter().unwrap().is_some());
    }

    #[test]
    fn test_toml_round_trip() {
        let toml = r#"
            [stages.launch]
            type = "task_launch"
            task_name = "ingest"
            args = ["--full"]
        "#;
        let config = StagesConfig::from_toml(toml).unwrap();
        let reparsed = StagesConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        let StageKind::TaskLaunch(launch) = &reparsed.get_stage("launch").unwrap().kind else {
            panic!("expected task_launch stage");
        };
        assert_eq!(launch.task_name.as_deref(), Some("ingest"));
        assert_eq!(launch.args, vec!["--full".to_string()]);
    }

    #[test]
    fn test_load_with_env_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [stages.orders]
            type = "redis"
            queue = "orders"
            max_in_flight = 2
            "#
        )
        .unwrap();

        std::env::set_var("STAGESTEST__STAGES__ORDERS__MAX_IN_FLIGHT", "16");
        let config = StagesConfig::load_with_prefix(file.path(), "STAGESTEST").unwrap();
        std::env::remove_var("STAGESTEST__STAGES__ORDERS__MAX_IN_FLIGHT");

        let orders = config.get_stage("orders").unwrap();
        assert_eq!(orders.max_in_flight, 16);
        config.validate().unwrap();
    }

    #[test]
    fn test_numeric_looking_override_reads_as_name() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [stages.orders]
            type = "redis"
            queue = "orders"

            [stages.rows]
            type = "store"
            table_expression = "headers['t']"
            "#
        )
        .unwrap();

        std::env::set_var("STAGESNUM__STAGES__ORDERS__QUEUE", "2024");
        std::env::set_var("STAGESNUM__STAGES__ROWS__TABLE_EXPRESSION", "1");
        let config = StagesConfig::load_with_prefix(file.path(), "STAGESNUM").unwrap();
        std::env::remove_var("STAGESNUM__STAGES__ORDERS__QUEUE");
        std::env::remove_var("STAGESNUM__STAGES__ROWS__TABLE_EXPRESSION");

        let StageKind::Redis(redis) = &config.get_stage("orders").unwrap().kind else {
            panic!("expected redis stage");
        };
        assert_eq!(redis.queue.as_deref(), Some("2024"));

        let StageKind::Store(store) = &config.get_stage("rows").unwrap().kind else {
            panic!("expected store stage");
        };
        assert_eq!(store.table_expression.as_ref().map(|e| e.source()), Some("1"));
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let err = StagesConfig::load(Path::new("/nonexistent/stages.toml")).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[stages.b]\ntype = \"bridge\"").unwrap();
        let config = StagesConfig::from_file(file.path()).unwrap();
        assert_eq!(config.stages.len(), 1);
    }
}
