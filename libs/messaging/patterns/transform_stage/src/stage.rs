//! The store/publish stage.
//!
//! A [`WriteStage`] resolves where a record goes, leases a connection slot
//! and hands the payload to its [`Collaborator`]. Every variant (redis,
//! rabbit, mongodb, store) is a `WriteStage` configured differently.

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::functions::splitter::Splitter;
use crate::lease::{ConnectionOwnership, ConnectionPool};
use crate::mapping::HeaderMapper;
use crate::metadata::StageCounters;
use crate::record::DELIVERY_MODE;
use crate::{
    Collaborator, CollaboratorError, CompletionSignal, Record, Stage, StageError, StageMetadata,
    TargetKind, TargetSpec, WriteAck, WriteContext, WriteRequest,
};

pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Stage that writes each record through a collaborator
#[derive(Debug)]
pub struct WriteStage {
    name: String,
    stage_type: String,
    kind: TargetKind,
    target: TargetSpec,
    route: Option<TargetSpec>,
    persistent_delivery: bool,
    headers: HeaderMapper,
    splitter: Option<Splitter>,
    decode_text: bool,
    lease_timeout: Duration,
    collaborator: Arc<dyn Collaborator>,
    pool: Arc<ConnectionPool>,
    counters: StageCounters,
}

impl WriteStage {
    pub fn builder(name: impl Into<String>, kind: TargetKind, target: TargetSpec) -> WriteStageBuilder {
        WriteStageBuilder {
            name: name.into(),
            stage_type: kind.name().to_string(),
            kind,
            target,
            route: None,
            persistent_delivery: false,
            headers: HeaderMapper::all(),
            splitter: None,
            decode_text: true,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn target(&self) -> &TargetSpec {
        &self.target
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    async fn handle(&self, record: Record) -> Result<Option<Record>, StageError> {
        let record = if self.decode_text {
            record.decode_text()
        } else {
            record
        };

        let Some(splitter) = &self.splitter else {
            let ack = self.write(&record).await?;
            return Ok(ack.result.map(|result| record.with_payload(result)));
        };

        let fragments = splitter.split(&record)?;
        if fragments.is_empty() {
            return Err(StageError::evaluation(
                splitter.to_string(),
                "split produced no fragments",
            ));
        }
        debug!(stage = %self.name, record_id = %record.id(), fragments = fragments.len(), "Writing split record");
        for fragment in &fragments {
            self.write(fragment).await?;
        }
        Ok(None)
    }

    async fn write(&self, record: &Record) -> Result<WriteAck, StageError> {
        let target = self.target.resolve(record)?;
        let route = self
            .route
            .as_ref()
            .map(|route| route.resolve(record))
            .transpose()?;

        let request = WriteRequest {
            kind: self.kind,
            target,
            route,
            payload: record.payload(),
            headers: self.headers.map(record.headers()),
            persistent: delivery_mode(record, self.persistent_delivery),
            record_id: record.id(),
        };

        let _lease = self.pool.lease(self.lease_timeout).await?;
        debug!(
            stage = %self.name,
            record_id = %record.id(),
            kind = %request.kind,
            target = %request.target,
            size = record.payload().size(),
            "Writing record"
        );

        let context = WriteContext::new(record.payload().size(), record.timestamp_ns())
            .with_record_id(record.id().to_string())
            .with_target(request.target.clone());

        match AssertUnwindSafe(self.collaborator.write(request))
            .catch_unwind()
            .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(CollaboratorError::write_failed_with_context(
                "collaborator panicked",
                context,
            )
            .into()),
        }
    }
}

/// Per-record delivery mode: the `amqp_deliveryMode` header wins over the
/// configured default. Accepts `PERSISTENT`/`NON_PERSISTENT` or 2/1.
fn delivery_mode(record: &Record, default: bool) -> bool {
    match record.header(DELIVERY_MODE) {
        Some(Value::String(mode)) => match mode.to_ascii_uppercase().as_str() {
            "PERSISTENT" | "2" => true,
            "NON_PERSISTENT" | "1" => false,
            _ => default,
        },
        Some(Value::Number(n)) => match n.as_u64() {
            Some(2) => true,
            Some(1) => false,
            _ => default,
        },
        _ => default,
    }
}

#[async_trait]
impl Stage for WriteStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, record: Record) -> CompletionSignal {
        let record_id = record.id();
        let result = match AssertUnwindSafe(self.handle(record)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(StageError::evaluation(
                self.target.to_string(),
                "target resolver panicked",
            )),
        };
        let signal = CompletionSignal::from(result);

        if let Some(err) = signal.error() {
            warn!(stage = %self.name, %record_id, kind = err.kind(), error = %err, "Record rejected");
        }
        self.counters.observe(&signal);
        signal
    }

    fn metadata(&self) -> StageMetadata {
        self.counters.fill(
            StageMetadata::new(&self.name, &self.stage_type)
                .with_target(format!("{} {}", self.kind, self.target))
                .with_pool(self.pool.name()),
        )
    }
}

#[derive(Debug)]
pub struct WriteStageBuilder {
    name: String,
    stage_type: String,
    kind: TargetKind,
    target: TargetSpec,
    route: Option<TargetSpec>,
    persistent_delivery: bool,
    headers: HeaderMapper,
    splitter: Option<Splitter>,
    decode_text: bool,
    lease_timeout: Duration,
}

impl WriteStageBuilder {
    /// Stage kind label used in metadata (defaults to the target kind)
    pub fn stage_type(mut self, stage_type: impl Into<String>) -> Self {
        self.stage_type = stage_type.into();
        self
    }

    pub fn route(mut self, route: TargetSpec) -> Self {
        self.route = Some(route);
        self
    }

    pub fn persistent_delivery(mut self, persistent: bool) -> Self {
        self.persistent_delivery = persistent;
        self
    }

    pub fn headers(mut self, headers: HeaderMapper) -> Self {
        self.headers = headers;
        self
    }

    /// Split each record and write the fragments one by one
    pub fn split(mut self, splitter: Splitter) -> Self {
        self.splitter = Some(splitter);
        self
    }

    pub fn decode_text(mut self, decode_text: bool) -> Self {
        self.decode_text = decode_text;
        self
    }

    pub fn lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn build(
        self,
        collaborator: Arc<dyn Collaborator>,
        ownership: ConnectionOwnership,
    ) -> WriteStage {
        let pool = ownership.into_pool(&self.name);
        info!(
            stage = %self.name,
            stage_type = %self.stage_type,
            kind = %self.kind,
            target = %self.target,
            pool = %pool.name(),
            split = self.splitter.is_some(),
            "Stage configured"
        );

        WriteStage {
            name: self.name,
            stage_type: self.stage_type,
            kind: self.kind,
            target: self.target,
            route: self.route,
            persistent_delivery: self.persistent_delivery,
            headers: self.headers,
            splitter: self.splitter,
            decode_text: self.decode_text,
            lease_timeout: self.lease_timeout,
            collaborator,
            pool,
            counters: StageCounters::new(),
        }
    }
}
