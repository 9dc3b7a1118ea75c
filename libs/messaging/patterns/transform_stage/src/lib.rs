pub mod collaborator;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod expression;
pub mod factory;
pub mod functions;
pub mod lease;
pub mod mapping;
pub mod metadata;
pub mod record;
pub mod signal;
pub mod stage;
pub mod stages;
pub mod target;
pub mod test_utils;

use async_trait::async_trait;
use std::fmt::Debug;

pub use collaborator::{
    Collaborator, CollaboratorMetadata, ConnectionState, WriteAck, WriteRequest,
};
pub use collaborators::{LineCollaborator, TcpCollaborator, TcpConfig};
pub use config::{Ownership, StageConfig, StageKind, StagesConfig};
pub use error::{CollaboratorError, StageError, WriteContext};
pub use expression::Expression;
pub use factory::StageFactory;
pub use functions::{
    BridgeFunction, Splitter, SplitterFunction, TaskLaunchRequestFunction, TransformFunction,
};
pub use lease::{ConnectionLease, ConnectionOwnership, ConnectionPool, ConnectionPoolStats};
pub use mapping::HeaderMapper;
pub use metadata::StageMetadata;
pub use record::{EnvelopeError, Headers, Payload, Record, RecordBuilder};
pub use signal::CompletionSignal;
pub use stage::{WriteStage, WriteStageBuilder};
pub use target::{exactly_one, ResolverFn, TargetKind, TargetSpec};

/// A single configured processing step.
///
/// Stages are immutable once built and may be driven concurrently. Every
/// failure is reported through [`CompletionSignal::Rejected`]; nothing a
/// record does can escape `process` as a panic or an error.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Configured stage name
    fn name(&self) -> &str;

    /// Process one record
    async fn process(&self, record: Record) -> CompletionSignal;

    /// Get stage metadata for debugging/monitoring
    fn metadata(&self) -> StageMetadata;
}
