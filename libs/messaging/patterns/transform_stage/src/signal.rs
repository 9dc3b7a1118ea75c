use crate::{Record, StageError};

/// Outcome of processing one record
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionSignal {
    /// Record handled, nothing to pass downstream
    Accepted,
    /// Record handled and produced a result record
    AcceptedWith(Record),
    /// Record could not be handled; the cause is carried unchanged
    Rejected(StageError),
}

impl CompletionSignal {
    pub fn is_accepted(&self) -> bool {
        !self.is_rejected()
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, CompletionSignal::Rejected(_))
    }

    pub fn result(&self) -> Option<&Record> {
        match self {
            CompletionSignal::AcceptedWith(record) => Some(record),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&StageError> {
        match self {
            CompletionSignal::Rejected(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<Option<Record>, StageError> {
        match self {
            CompletionSignal::Accepted => Ok(None),
            CompletionSignal::AcceptedWith(record) => Ok(Some(record)),
            CompletionSignal::Rejected(err) => Err(err),
        }
    }
}

impl From<Result<Option<Record>, StageError>> for CompletionSignal {
    fn from(result: Result<Option<Record>, StageError>) -> Self {
        match result {
            Ok(None) => CompletionSignal::Accepted,
            Ok(Some(record)) => CompletionSignal::AcceptedWith(record),
            Err(err) => CompletionSignal::Rejected(err),
        }
    }
}
