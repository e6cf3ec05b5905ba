//! Multi-version row storage for the Kestrel transaction engine: version
//! chains, the version store, the write-ahead log, recovery replay, and
//! background garbage collection.

pub mod gc;
pub mod mvcc;
pub mod recovery;
pub mod store;
pub mod wal;

#[cfg(test)]
mod tests;

pub use gc::{compute_horizon, sweep_store, GcConfig, GcRunner, GcStats, GcSweepResult, HorizonProvider};
pub use mvcc::{RowVersion, VersionChain};
pub use recovery::{replay, ReplaySummary};
pub use store::VersionStore;
pub use wal::{SyncMode, Wal, WalReader, WalRecord, WalWriter};
