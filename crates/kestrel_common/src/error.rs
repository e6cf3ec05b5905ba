use thiserror::Error;

use crate::types::{RowId, TxId};

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification for retry decisions.
///
/// - `UserError`: the call itself was wrong (e.g. operating on a finished
///   transaction); retrying the same call cannot succeed
/// - `Retryable`: concurrency casualty (deadlock victim, write conflict,
///   serialization failure); the caller should abort and retry the whole
///   transaction
/// - `Fatal`: durability or storage failure; the engine refuses further
///   commits and the process should be restarted/recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Fatal,
}

/// Top-level error type that the layer-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),
}

/// Storage layer errors (WAL and version store).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("WAL corrupt: {0}")]
    WalCorrupt(String),
}

/// Transaction layer errors.
///
/// Absent rows are not errors: reads of unknown or invisible rows return
/// `Ok(None)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxnError {
    #[error("Transaction {0} chosen as deadlock victim")]
    DeadlockDetected(TxId),

    #[error("Transaction {0} write conflict on {1}: newer committed version exists")]
    WriteConflict(TxId, RowId),

    #[error("Transaction {0} serialization failure: read set invalidated by a concurrent commit")]
    SerializationFailure(TxId),

    #[error("Transaction {0} aborted")]
    Aborted(TxId),

    #[error("Transaction {0} already committed")]
    AlreadyCommitted(TxId),

    #[error("Transaction {0} invalid state transition: {1} to {2}")]
    InvalidTransition(TxId, String, String),

    #[error("Durability failure, engine refuses further commits: {0}")]
    Durability(String),
}

impl KestrelError {
    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::Txn(TxnError::DeadlockDetected(_)) => ErrorKind::Retryable,
            KestrelError::Txn(TxnError::WriteConflict(_, _)) => ErrorKind::Retryable,
            KestrelError::Txn(TxnError::SerializationFailure(_)) => ErrorKind::Retryable,
            KestrelError::Txn(TxnError::Aborted(_)) => ErrorKind::Retryable,

            KestrelError::Txn(TxnError::AlreadyCommitted(_)) => ErrorKind::UserError,
            KestrelError::Txn(TxnError::InvalidTransition(_, _, _)) => ErrorKind::UserError,

            KestrelError::Txn(TxnError::Durability(_)) => ErrorKind::Fatal,
            KestrelError::Storage(_) => ErrorKind::Fatal,
        }
    }

    /// Returns true if the caller should abort and retry the transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true if the engine is no longer usable for commits.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }
}

impl TxnError {
    /// Classification without wrapping into the top-level error.
    pub fn kind(&self) -> ErrorKind {
        KestrelError::Txn(self.clone()).kind()
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }
}
