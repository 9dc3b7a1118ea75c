use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::{
    Collaborator, CollaboratorError, CollaboratorMetadata, ConnectionState, Record, WriteAck,
    WriteRequest,
};

/// Writes one JSON line per request to any async writer (stdout in the runner)
pub struct LineCollaborator<W> {
    name: String,
    writer: Mutex<W>,
    writes_ok: AtomicU64,
    writes_failed: AtomicU64,
}

impl<W: AsyncWrite + Unpin + Send> LineCollaborator<W> {
    pub fn new(name: impl Into<String>, writer: W) -> Self {
        Self {
            name: name.into(),
            writer: Mutex::new(writer),
            writes_ok: AtomicU64::new(0),
            writes_failed: AtomicU64::new(0),
        }
    }

    /// Write a complete line; concurrent callers never interleave
    pub async fn write_line(&self, line: &[u8]) -> Result<(), CollaboratorError> {
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(line).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                self.writes_ok.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.writes_failed.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Emit a result record as a JSON line
    pub async fn write_record(&self, record: &Record) -> Result<(), CollaboratorError> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| CollaboratorError::Io(format!("failed to encode record: {}", e)))?;
        line.push(b'\n');
        self.write_line(&line).await
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W> fmt::Debug for LineCollaborator<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineCollaborator")
            .field("name", &self.name)
            .field("writes_ok", &self.writes_ok.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> Collaborator for LineCollaborator<W> {
    async fn write(&self, request: WriteRequest<'_>) -> Result<WriteAck, CollaboratorError> {
        let line = request.to_json_line()?;
        self.write_line(&line).await?;
        Ok(WriteAck::done())
    }

    fn metadata(&self) -> CollaboratorMetadata {
        CollaboratorMetadata {
            name: self.name.clone(),
            collaborator_type: "line".to_string(),
            endpoint: None,
            state: ConnectionState::Connected,
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            last_error: None,
        }
    }
}
