use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::CompletionSignal;

/// Information about a stage for monitoring/debugging
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageMetadata {
    /// Configured stage name
    pub name: String,

    /// Stage kind (redis, rabbit, splitter, ...)
    pub stage_type: String,

    /// Human-readable description of the target, if the stage writes
    pub target: Option<String>,

    /// Pool the stage leases connections from
    pub pool: Option<String>,

    /// Records handed to `process`
    pub records_processed: u64,

    /// Records accepted
    pub records_accepted: u64,

    /// Records rejected
    pub records_rejected: u64,

    /// Last rejection cause if any
    pub last_error: Option<String>,
}

impl StageMetadata {
    pub fn new(name: impl Into<String>, stage_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage_type: stage_type.into(),
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    /// Fraction of processed records that were rejected (0.0 when idle)
    pub fn rejection_rate(&self) -> f64 {
        if self.records_processed == 0 {
            0.0
        } else {
            self.records_rejected as f64 / self.records_processed as f64
        }
    }
}

/// Per-stage counters: atomics for the counts, a mutex for the last error.
/// The only state a stage mutates while processing.
#[derive(Debug, Default)]
pub struct StageCounters {
    processed: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl StageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one finished invocation
    pub fn observe(&self, signal: &CompletionSignal) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        match signal.error() {
            None => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Some(err) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut last) = self.last_error.lock() {
                    *last = Some(err.to_string());
                }
            }
        }
    }

    /// Copy the counters into `metadata`
    pub fn fill(&self, mut metadata: StageMetadata) -> StageMetadata {
        metadata.records_processed = self.processed.load(Ordering::Relaxed);
        metadata.records_accepted = self.accepted.load(Ordering::Relaxed);
        metadata.records_rejected = self.rejected.load(Ordering::Relaxed);
        metadata.last_error = self.last_error.lock().ok().and_then(|last| last.clone());
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Record, StageError};

    #[test]
    fn test_counters_track_outcomes() {
        let counters = StageCounters::new();
        counters.observe(&CompletionSignal::Accepted);
        counters.observe(&CompletionSignal::AcceptedWith(Record::new("x")));
        counters.observe(&CompletionSignal::Rejected(StageError::evaluation(
            "headers['dest']",
            "evaluated to null",
        )));

        let metadata = counters.fill(StageMetadata::new("orders", "redis"));
        assert_eq!(metadata.records_processed, 3);
        assert_eq!(metadata.records_accepted, 2);
        assert_eq!(metadata.records_rejected, 1);
        assert!(metadata.last_error.unwrap().contains("headers['dest']"));
    }

    #[test]
    fn test_rejection_rate() {
        let idle = StageMetadata::new("idle", "bridge");
        assert_eq!(idle.rejection_rate(), 0.0);

        let busy = StageMetadata {
            records_processed: 4,
            records_rejected: 1,
            ..StageMetadata::new("busy", "redis")
        };
        assert_eq!(busy.rejection_rate(), 0.25);
    }
}
