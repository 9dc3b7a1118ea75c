use async_trait::async_trait;

use crate::metadata::StageCounters;
use crate::{CompletionSignal, Record, Stage, StageMetadata};

/// Identity stage: hands every record back unchanged
#[derive(Debug)]
pub struct BridgeFunction {
    name: String,
    counters: StageCounters,
}

impl BridgeFunction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counters: StageCounters::new(),
        }
    }
}

#[async_trait]
impl Stage for BridgeFunction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, record: Record) -> CompletionSignal {
        let signal = CompletionSignal::AcceptedWith(record);
        self.counters.observe(&signal);
        signal
    }

    fn metadata(&self) -> StageMetadata {
        self.counters.fill(StageMetadata::new(&self.name, "bridge"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bridge_is_identity() {
        let stage = BridgeFunction::new("bridge");
        let record = Record::builder(b"raw".to_vec()).header("h", 1).build();

        let signal = stage.process(record.clone()).await;
        assert_eq!(signal.result(), Some(&record));
        assert_eq!(stage.metadata().records_processed, 1);
    }
}
