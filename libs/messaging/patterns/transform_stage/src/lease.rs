use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::CollaboratorError;

/// Bounded pool of connection slots shared between stages.
///
/// The pool itself is owned outside the stage (or by the factory when a
/// stage asks for a dedicated pool). Stages only ever hold a
/// [`ConnectionLease`] for the duration of one write.
#[derive(Debug)]
pub struct ConnectionPool {
    /// Pool identifier used in logs and errors
    name: String,
    /// Free slots
    slots: Arc<Semaphore>,
    /// Maximum concurrent leases
    max_connections: usize,
    /// Leases handed out since creation
    leases_granted: AtomicU64,
    /// Lease requests that gave up waiting
    lease_timeouts: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool with `max_connections` slots (at least one)
    pub fn new(name: impl Into<String>, max_connections: usize) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            name: name.into(),
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            leases_granted: AtomicU64::new(0),
            lease_timeouts: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Leases currently held
    pub fn active_leases(&self) -> usize {
        self.max_connections - self.slots.available_permits()
    }

    /// Wait up to `timeout` for a free slot
    pub async fn lease(&self, timeout: Duration) -> Result<ConnectionLease, CollaboratorError> {
        match tokio::time::timeout(timeout, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(self.grant(permit)),
            Ok(Err(_)) => Err(CollaboratorError::Closed),
            Err(_) => {
                self.lease_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(CollaboratorError::timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Take a slot only if one is free right now
    pub fn try_lease(&self) -> Result<ConnectionLease, CollaboratorError> {
        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => Ok(self.grant(permit)),
            Err(TryAcquireError::NoPermits) => Err(CollaboratorError::connection_failed(format!(
                "Connection pool exhausted: {}/{} leases active for pool {}",
                self.active_leases(),
                self.max_connections,
                self.name
            ))),
            Err(TryAcquireError::Closed) => Err(CollaboratorError::Closed),
        }
    }

    /// Stop handing out leases. Waiters fail with [`CollaboratorError::Closed`].
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        let active_leases = self.active_leases();
        ConnectionPoolStats {
            name: self.name.clone(),
            active_leases,
            max_connections: self.max_connections,
            leases_granted: self.leases_granted.load(Ordering::Relaxed),
            lease_timeouts: self.lease_timeouts.load(Ordering::Relaxed),
            utilization: active_leases as f64 / self.max_connections as f64,
        }
    }

    fn grant(&self, permit: OwnedSemaphorePermit) -> ConnectionLease {
        self.leases_granted.fetch_add(1, Ordering::Relaxed);
        ConnectionLease {
            pool: self.name.clone(),
            _permit: permit,
        }
    }
}

/// RAII guard that returns its slot to the pool when dropped
#[derive(Debug)]
pub struct ConnectionLease {
    pool: String,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionLease {
    /// Name of the pool this lease came from
    pub fn pool(&self) -> &str {
        &self.pool
    }
}

/// Statistics for a connection pool
#[derive(Debug, Clone)]
pub struct ConnectionPoolStats {
    pub name: String,
    pub active_leases: usize,
    pub max_connections: usize,
    pub leases_granted: u64,
    pub lease_timeouts: u64,
    /// Pool utilization (0.0 to 1.0)
    pub utilization: f64,
}

impl ConnectionPoolStats {
    pub fn is_saturated(&self) -> bool {
        self.active_leases >= self.max_connections
    }
}

/// Who owns the pool a stage leases from
#[derive(Debug, Clone)]
pub enum ConnectionOwnership {
    /// Leases come from a pool owned by the caller
    Shared(Arc<ConnectionPool>),
    /// The stage gets a dedicated pool of its own
    Owned { max_connections: usize },
}

impl ConnectionOwnership {
    /// Resolve to the pool the stage will lease from
    pub fn into_pool(self, stage_name: &str) -> Arc<ConnectionPool> {
        match self {
            ConnectionOwnership::Shared(pool) => pool,
            ConnectionOwnership::Owned { max_connections } => Arc::new(ConnectionPool::new(
                format!("{}.own.connection", stage_name),
                max_connections,
            )),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, ConnectionOwnership::Owned { .. })
    }
}
