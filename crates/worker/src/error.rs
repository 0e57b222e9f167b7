//! Stage errors and how the queue runtime treats them.

use herald_core::{DomainError, JobId};
use herald_infra::queue::QueueStoreError;
use herald_infra::{BlobError, CoordinationError, NotifyError, StoreError};

/// Whether a failed unit may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageErrorKind {
    /// Retrying cannot help; the unit is dead-lettered.
    Fatal,
    /// Retried with the unit's backoff policy.
    Retryable,
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Queue(#[from] QueueStoreError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("invalid stage message: {0}")]
    Message(String),

    /// A page worker task panicked or was cancelled.
    #[error("page worker failed: {0}")]
    Worker(String),
}

impl StageError {
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    pub fn kind(&self) -> StageErrorKind {
        match self {
            StageError::Domain(
                DomainError::MalformedCsv(_) | DomainError::InvariantViolation(_) | DomainError::Validation(_),
            )
            | StageError::Message(_)
            | StageError::Blob(BlobError::InvalidKey(_)) => StageErrorKind::Fatal,
            _ => StageErrorKind::Retryable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == StageErrorKind::Fatal
    }
}
