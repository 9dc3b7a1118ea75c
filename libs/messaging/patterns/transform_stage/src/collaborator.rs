use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use uuid::Uuid;

use crate::{CollaboratorError, Headers, Payload, TargetKind};

/// One write handed to a collaborator
#[derive(Debug, Clone)]
pub struct WriteRequest<'a> {
    /// Kind of destination the target names
    pub kind: TargetKind,
    /// Resolved target (key, queue, topic, exchange, collection, table)
    pub target: String,
    /// Secondary routing information, e.g. a routing key for an exchange
    pub route: Option<String>,
    /// Payload, passed through unchanged
    pub payload: &'a Payload,
    /// Headers the stage decided to forward
    pub headers: Headers,
    /// Whether the broker should persist the message
    pub persistent: bool,
    /// Id of the record this write belongs to
    pub record_id: Uuid,
}

impl WriteRequest<'_> {
    /// Newline-terminated JSON frame used by the line-oriented collaborators
    pub fn to_json_line(&self) -> Result<Vec<u8>, CollaboratorError> {
        #[derive(Serialize)]
        struct Frame<'f> {
            kind: crate::TargetKind,
            target: &'f str,
            #[serde(skip_serializing_if = "Option::is_none")]
            route: Option<&'f str>,
            persistent: bool,
            record_id: String,
            headers: &'f Headers,
            #[serde(skip_serializing_if = "Option::is_none")]
            payload: Option<Value>,
            #[serde(skip_serializing_if = "Option::is_none")]
            payload_base64: Option<String>,
        }

        let (payload, payload_base64) = match self.payload {
            Payload::Bytes(b) => (None, Some(base64::engine::general_purpose::STANDARD.encode(b))),
            other => (Some(other.to_value()), None),
        };

        let frame = Frame {
            kind: self.kind,
            target: &self.target,
            route: self.route.as_deref(),
            persistent: self.persistent,
            record_id: self.record_id.to_string(),
            headers: &self.headers,
            payload,
            payload_base64,
        };

        let mut line = serde_json::to_vec(&frame)
            .map_err(|e| CollaboratorError::Io(format!("failed to encode frame: {}", e)))?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Collaborator response to a successful write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteAck {
    /// Optional result token, e.g. a generated id or a broker acknowledgment
    pub result: Option<Payload>,
}

impl WriteAck {
    pub fn done() -> Self {
        Self { result: None }
    }

    pub fn with_result(result: impl Into<Payload>) -> Self {
        Self {
            result: Some(result.into()),
        }
    }
}

/// The external store/broker client that performs the actual I/O.
///
/// Connections, retries and backoff are the collaborator's business. A
/// stage calls `write` once per record (or once per fragment when
/// splitting) and reports whatever comes back.
#[async_trait]
pub trait Collaborator: Send + Sync + Debug {
    /// Perform one write
    async fn write(&self, request: WriteRequest<'_>) -> Result<WriteAck, CollaboratorError>;

    /// Get collaborator metadata for debugging/monitoring
    fn metadata(&self) -> CollaboratorMetadata {
        CollaboratorMetadata::default()
    }
}

/// Information about a collaborator for monitoring/debugging
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollaboratorMetadata {
    /// Human-readable name
    pub name: String,

    /// Collaborator type (line, tcp, recording, ...)
    pub collaborator_type: String,

    /// Connection endpoint if applicable
    pub endpoint: Option<String>,

    /// Current connection state
    pub state: ConnectionState,

    /// Writes acknowledged
    pub writes_ok: u64,

    /// Writes that failed
    pub writes_failed: u64,

    /// Last error if any
    pub last_error: Option<String>,
}

impl CollaboratorMetadata {
    pub fn new(name: impl Into<String>, collaborator_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collaborator_type: collaborator_type.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_state(mut self, state: ConnectionState) -> Self {
        self.state = state;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn can_connect(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}
