use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use uuid::Uuid;

use crate::{
    Collaborator, CollaboratorError, CollaboratorMetadata, ConnectionState, Headers, Payload,
    TargetKind, WriteAck, WriteContext, WriteRequest,
};

/// Owned copy of a [`WriteRequest`] kept by test collaborators
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub kind: TargetKind,
    pub target: String,
    pub route: Option<String>,
    pub payload: Payload,
    pub headers: Headers,
    pub persistent: bool,
    pub record_id: Uuid,
}

impl From<&WriteRequest<'_>> for RecordedWrite {
    fn from(request: &WriteRequest<'_>) -> Self {
        Self {
            kind: request.kind,
            target: request.target.clone(),
            route: request.route.clone(),
            payload: request.payload.clone(),
            headers: request.headers.clone(),
            persistent: request.persistent,
            record_id: request.record_id,
        }
    }
}

/// A collaborator that just records writes, with bounded storage
#[derive(Debug)]
pub struct RecordingCollaborator {
    /// Bounded write log to prevent memory leaks
    writes: Arc<Mutex<VecDeque<RecordedWrite>>>,
    /// Maximum number of writes to keep
    max_writes: usize,
    /// Result token returned with every ack
    result: Option<Payload>,
    writes_ok: AtomicU64,
    name: String,
}

impl RecordingCollaborator {
    /// Create a new recording collaborator with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(max_writes: usize) -> Self {
        Self {
            writes: Arc::new(Mutex::new(VecDeque::with_capacity(max_writes.min(1024)))),
            max_writes,
            result: None,
            writes_ok: AtomicU64::new(0),
            name: "test-recorder".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Acknowledge every write with this result token
    pub fn with_result(mut self, result: impl Into<Payload>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Get all recorded writes, oldest first
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().unwrap().iter().cloned().collect()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.writes.lock().unwrap().clear();
    }
}

impl Default for RecordingCollaborator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collaborator for RecordingCollaborator {
    async fn write(&self, request: WriteRequest<'_>) -> Result<WriteAck, CollaboratorError> {
        {
            let mut writes = self.writes.lock().unwrap();
            if writes.len() >= self.max_writes {
                writes.pop_front(); // Drop oldest write
            }
            writes.push_back(RecordedWrite::from(&request));
        }
        self.writes_ok.fetch_add(1, Ordering::Relaxed);

        Ok(WriteAck {
            result: self.result.clone(),
        })
    }

    fn metadata(&self) -> CollaboratorMetadata {
        CollaboratorMetadata {
            name: self.name.clone(),
            collaborator_type: "recording".to_string(),
            endpoint: Some("memory://test".to_string()),
            state: ConnectionState::Connected,
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_failed: 0,
            last_error: None,
        }
    }
}

/// A collaborator that always fails (or panics) for testing error conditions
#[derive(Debug)]
pub struct FailingCollaborator {
    error: CollaboratorError,
    panic: bool,
    attempts: AtomicU64,
}

impl FailingCollaborator {
    pub fn new(error: CollaboratorError) -> Self {
        Self {
            error,
            panic: false,
            attempts: AtomicU64::new(0),
        }
    }

    /// A collaborator whose `write` panics instead of returning an error
    pub fn panicking() -> Self {
        Self {
            panic: true,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl Default for FailingCollaborator {
    fn default() -> Self {
        Self::new(CollaboratorError::write_failed("Simulated failure"))
    }
}

#[async_trait]
impl Collaborator for FailingCollaborator {
    async fn write(&self, request: WriteRequest<'_>) -> Result<WriteAck, CollaboratorError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if self.panic {
            panic!("simulated collaborator panic writing to {}", request.target);
        }

        match &self.error {
            CollaboratorError::WriteFailed { error, context } => {
                let context = WriteContext {
                    payload_size: request.payload.size(),
                    record_id: Some(request.record_id.to_string()),
                    target: Some(request.target.clone()),
                    ..context.clone()
                };
                Err(CollaboratorError::write_failed_with_context(error.clone(), context))
            }
            other => Err(other.clone()),
        }
    }

    fn metadata(&self) -> CollaboratorMetadata {
        let attempts = self.attempts();
        CollaboratorMetadata {
            name: "failing-collaborator".to_string(),
            collaborator_type: "failing".to_string(),
            endpoint: None,
            state: ConnectionState::Failed,
            writes_ok: 0,
            writes_failed: attempts,
            last_error: Some(self.error.to_string()),
        }
    }
}

/// A collaborator that waits before acknowledging, tracking peak concurrency
#[derive(Debug)]
pub struct SlowCollaborator {
    delay: Duration,
    in_flight: AtomicUsize,
    max_concurrent: AtomicUsize,
    writes: AtomicU64,
}

impl SlowCollaborator {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Highest number of writes observed in flight at once
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Collaborator for SlowCollaborator {
    async fn write(&self, _request: WriteRequest<'_>) -> Result<WriteAck, CollaboratorError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(WriteAck::done())
    }

    fn metadata(&self) -> CollaboratorMetadata {
        CollaboratorMetadata::new("slow-collaborator", "slow").with_state(ConnectionState::Connected)
    }
}
