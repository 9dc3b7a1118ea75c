//! TCP collaborator
//!
//! Sends the same JSON line frames as [`LineCollaborator`](super::LineCollaborator)
//! over a TCP connection. The connection is opened on first write, and a
//! failed write drops it so the next attempt reconnects. Retries with
//! exponential backoff are the collaborator's own policy; a stage sees only
//! the final outcome.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::{
    Collaborator, CollaboratorError, CollaboratorMetadata, ConnectionState, WriteAck,
    WriteRequest,
};

/// Connection and retry behaviour
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Connection timeout per attempt
    pub connect_timeout: Duration,

    /// Timeout for writing one frame
    pub write_timeout: Duration,

    /// Extra attempts after the first failure
    pub max_retries: u32,

    /// Initial delay between retry attempts
    pub retry_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum retry delay cap
    pub max_retry_delay: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl TcpConfig {
    /// Fail fast, for tests and interactive use
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            connect_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let next = delay.as_secs_f64() * self.backoff_multiplier;
        Duration::from_secs_f64(next.min(self.max_retry_delay.as_secs_f64()))
    }
}

#[derive(Debug)]
pub struct TcpCollaborator {
    name: String,
    address: String,
    config: TcpConfig,
    connection: Mutex<Option<TcpStream>>,
    state: std::sync::Mutex<ConnectionState>,
    connection_attempts: AtomicU64,
    writes_ok: AtomicU64,
    writes_failed: AtomicU64,
    last_error: std::sync::Mutex<Option<String>>,
}

impl TcpCollaborator {
    /// Create a collaborator for `address` (`host:port`). No connection is made yet.
    pub fn new(address: impl Into<String>, config: TcpConfig) -> Self {
        let address = address.into();
        Self {
            name: format!("tcp://{}", address),
            address,
            config,
            connection: Mutex::new(None),
            state: std::sync::Mutex::new(ConnectionState::Disconnected),
            connection_attempts: AtomicU64::new(0),
            writes_ok: AtomicU64::new(0),
            writes_failed: AtomicU64::new(0),
            last_error: std::sync::Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connection_attempts(&self) -> u64 {
        self.connection_attempts.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Failed)
    }

    /// Drop the current connection, if any
    pub async fn close(&self) {
        let mut connection = self.connection.lock().await;
        if let Some(mut stream) = connection.take() {
            let _ = stream.shutdown().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    async fn connect(&self) -> Result<TcpStream, CollaboratorError> {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Connecting);
        tracing::debug!("Connecting collaborator: {}", self.name);

        let result = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.address.as_str()),
        )
        .await
        .map_err(|_| CollaboratorError::timeout(self.config.connect_timeout.as_millis() as u64))?
        .map_err(|e| {
            CollaboratorError::connection_failed(format!(
                "TCP connection to {} failed: {}",
                self.address, e
            ))
        });

        match result {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                self.set_state(ConnectionState::Connected);
                tracing::info!("Collaborator connected: {}", self.name);
                Ok(stream)
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<(), CollaboratorError> {
        let mut connection = self.connection.lock().await;
        if connection.is_none() {
            *connection = Some(self.connect().await?);
        }
        let Some(stream) = connection.as_mut() else {
            return Err(CollaboratorError::Closed);
        };

        let written = tokio::time::timeout(self.config.write_timeout, async {
            stream.write_all(frame).await?;
            stream.flush().await
        })
        .await;

        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // Connection might be lost, reconnect on the next attempt
                *connection = None;
                self.set_state(ConnectionState::Failed);
                Err(e.into())
            }
            Err(_) => {
                *connection = None;
                self.set_state(ConnectionState::Failed);
                Err(CollaboratorError::timeout(
                    self.config.write_timeout.as_millis() as u64,
                ))
            }
        }
    }

    fn record_failure(&self, error: &CollaboratorError) {
        self.writes_failed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }
}

#[async_trait]
impl Collaborator for TcpCollaborator {
    async fn write(&self, request: WriteRequest<'_>) -> Result<WriteAck, CollaboratorError> {
        let frame = request.to_json_line()?;
        let mut delay = self.config.retry_delay;

        for attempt in 0..=self.config.max_retries {
            match self.send_frame(&frame).await {
                Ok(()) => {
                    self.writes_ok.fetch_add(1, Ordering::Relaxed);
                    return Ok(WriteAck::done());
                }
                Err(e)
                    if attempt < self.config.max_retries
                        && (e.is_recoverable() || e.is_connection_error()) =>
                {
                    tracing::warn!(
                        "Collaborator '{}' write attempt {} failed: {}, retrying in {:?}",
                        self.name,
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = self.config.next_delay(delay);
                }
                Err(e) => {
                    tracing::error!("Collaborator '{}' write failed: {}", self.name, e);
                    self.record_failure(&e);
                    return Err(e);
                }
            }
        }

        let error = CollaboratorError::connection_failed("Max retries exceeded");
        self.record_failure(&error);
        Err(error)
    }

    fn metadata(&self) -> CollaboratorMetadata {
        CollaboratorMetadata {
            name: self.name.clone(),
            collaborator_type: "tcp".to_string(),
            endpoint: Some(self.name.clone()),
            state: self.state(),
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|last| last.clone()),
        }
    }
}
