//! Transaction layer of the Kestrel engine: snapshots, row locks with
//! deadlock detection, the transaction manager, and the `Engine` facade.

pub mod deadlock;
pub mod engine;
pub mod lock;
pub mod manager;
pub mod snapshot;


pub use engine::{Engine, EngineConfig};
pub use lock::{LockManager, LockMode};
pub use manager::{Transaction, TxnManager, TxnStatsSnapshot};
pub use snapshot::SnapshotManager;
