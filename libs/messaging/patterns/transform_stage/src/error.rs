use crate::record::current_timestamp_ns;

/// Context information for write operations to aid in debugging
#[derive(Debug, Clone, PartialEq)]
pub struct WriteContext {
    /// Size of the payload in bytes
    pub payload_size: usize,
    /// Id of the record being written
    pub record_id: Option<String>,
    /// Timestamp when the write was attempted (nanoseconds since epoch)
    pub timestamp_ns: u64,
    /// Resolved target, if known
    pub target: Option<String>,
}

impl WriteContext {
    pub fn new(payload_size: usize, timestamp_ns: u64) -> Self {
        Self {
            payload_size,
            record_id: None,
            timestamp_ns,
            target: None,
        }
    }

    pub fn with_record_id(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Failures reported by the external store/broker client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Write failed: {error} (size: {size}B, record: {record_id:?}, target: {target:?})",
            size = context.payload_size,
            record_id = context.record_id,
            target = context.target)]
    WriteFailed { error: String, context: WriteContext },

    #[error("Timeout after {0} ms")]
    Timeout(u64),

    #[error("Collaborator closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(String),
}

impl CollaboratorError {
    /// Check if a retry by the collaborator could succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CollaboratorError::ConnectionLost(_) | CollaboratorError::Timeout(_)
        )
    }

    /// Check if this is a connection-related error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            CollaboratorError::ConnectionFailed(_) | CollaboratorError::ConnectionLost(_)
        )
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        CollaboratorError::ConnectionFailed(msg.into())
    }

    pub fn write_failed_with_context(msg: impl Into<String>, context: WriteContext) -> Self {
        CollaboratorError::WriteFailed {
            error: msg.into(),
            context,
        }
    }

    /// Create a write failed error with a minimal context
    pub fn write_failed(msg: impl Into<String>) -> Self {
        CollaboratorError::WriteFailed {
            error: msg.into(),
            context: WriteContext::new(0, current_timestamp_ns()),
        }
    }

    pub fn timeout(millis: u64) -> Self {
        CollaboratorError::Timeout(millis)
    }
}

impl From<std::io::Error> for CollaboratorError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => {
                CollaboratorError::ConnectionLost(err.to_string())
            }
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotConnected => {
                CollaboratorError::ConnectionFailed(err.to_string())
            }
            _ => CollaboratorError::Io(err.to_string()),
        }
    }
}

/// Everything a stage can fail with.
///
/// `Configuration` is fatal and only ever produced while a stage is being
/// built. The other two variants are scoped to a single record and surface
/// as a rejected completion signal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Expression '{expression}' failed: {reason}")]
    Evaluation { expression: String, reason: String },

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl StageError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        StageError::Configuration(msg.into())
    }

    pub fn evaluation(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        StageError::Evaluation {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, StageError::Configuration(_))
    }

    pub fn is_evaluation(&self) -> bool {
        matches!(self, StageError::Evaluation { .. })
    }

    pub fn is_collaborator(&self) -> bool {
        matches!(self, StageError::Collaborator(_))
    }

    /// Short label used for logging and counters
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Configuration(_) => "configuration",
            StageError::Evaluation { .. } => "evaluation",
            StageError::Collaborator(_) => "collaborator",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborator_error_classification() {
        let conn_err = CollaboratorError::connection_failed("refused");
        assert!(conn_err.is_connection_error());
        assert!(!conn_err.is_recoverable());

        let lost = CollaboratorError::ConnectionLost("reset".to_string());
        assert!(lost.is_connection_error());
        assert!(lost.is_recoverable());

        let timeout = CollaboratorError::timeout(250);
        assert!(!timeout.is_connection_error());
        assert!(timeout.is_recoverable());
        assert_eq!(timeout.to_string(), "Timeout after 250 ms");
    }

    #[test]
    fn test_write_failed_display_includes_context() {
        let context = WriteContext::new(5, 42)
            .with_record_id("abc")
            .with_target("orders");
        let err = CollaboratorError::write_failed_with_context("broker down", context);
        let text = err.to_string();
        assert!(text.contains("broker down"));
        assert!(text.contains("5B"));
        assert!(text.contains("orders"));
    }

    #[test]
    fn test_io_error_mapping() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(
            CollaboratorError::from(reset),
            CollaboratorError::ConnectionLost(_)
        ));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            CollaboratorError::from(refused),
            CollaboratorError::ConnectionFailed(_)
        ));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert!(matches!(CollaboratorError::from(other), CollaboratorError::Io(_)));
    }

    #[test]
    fn test_stage_error_kinds() {
        assert_eq!(StageError::configuration("x").kind(), "configuration");
        assert_eq!(StageError::evaluation("headers['a']", "null").kind(), "evaluation");

        let err: StageError = CollaboratorError::Closed.into();
        assert!(err.is_collaborator());
        assert_eq!(err.to_string(), "Collaborator closed");
    }
}
