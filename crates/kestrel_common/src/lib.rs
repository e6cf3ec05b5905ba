//! Shared types for the Kestrel transaction engine: identifiers, snapshots,
//! the error taxonomy, and the shutdown signal used by background tasks.

pub mod error;
pub mod shutdown;
pub mod types;

pub use error::{ErrorKind, KestrelError, KestrelResult, StorageError, TxnError};
pub use shutdown::ShutdownSignal;
pub use types::{CommitSeq, IsolationLevel, RowId, Snapshot, TxId, TxnState, WriteOp};
