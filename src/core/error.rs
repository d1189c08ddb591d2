use thiserror::Error;

use crate::transaction::CoordinatorId;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Object {key} is exclusively held by {blocker}")]
    WouldBlock {
        key: String,
        blocker: std::sync::Arc<crate::transaction::Coordinator>,
    },

    #[error("Object {key} is shared-read by {} other transaction(s)", readers.len())]
    ReadersActive {
        key: String,
        readers: Vec<CoordinatorId>,
    },

    #[error("Transaction {waiting} timed out after {waited_ms}ms waiting for {blocker}")]
    TransactionBusyTimeout {
        waiting: CoordinatorId,
        blocker: CoordinatorId,
        waited_ms: u128,
    },

    #[error("Deadlock: {waiting} would wait on {blocker}, which already waits on it")]
    Deadlock {
        waiting: CoordinatorId,
        blocker: CoordinatorId,
    },

    #[error("Object {0} is too contended, gave up after the CAS attempt limit")]
    Contended(String),

    #[error("Optimistic lock failure on {key}: expected version {expected}, actual {actual}")]
    OptimisticLockFailure {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Object {0} was deleted concurrently")]
    DeletedConcurrently(String),

    #[error("Object {0} is deleted")]
    ObjectDeleted(String),

    #[error("Object {0} not found")]
    NotFound(String),

    #[error("Duplicate key {0}")]
    DuplicateKey(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid transaction state: {0}")]
    InvalidTransactionState(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockPoisoned(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Whether the surrounding transaction may be rolled back and retried.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::WouldBlock { .. }
                | Self::ReadersActive { .. }
                | Self::TransactionBusyTimeout { .. }
                | Self::Deadlock { .. }
                | Self::Contended(_)
                | Self::OptimisticLockFailure { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TransactionBusyTimeout { .. })
    }

    /// Coordinator the failed operation was blocked by, if any.
    pub fn blocker(&self) -> Option<&std::sync::Arc<crate::transaction::Coordinator>> {
        match self {
            Self::WouldBlock { blocker, .. } => Some(blocker),
            _ => None,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for CacheError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockPoisoned(err.to_string())
    }
}
