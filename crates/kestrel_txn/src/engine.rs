//! The `Engine` facade: wires the version store, WAL, transaction
//! manager, and background GC together, and runs recovery on open.

use std::path::PathBuf;
use std::sync::Arc;

use kestrel_common::error::{KestrelError, TxnError};
use kestrel_common::types::{CommitSeq, IsolationLevel, RowId, TxId, WriteOp};
use kestrel_storage::gc::{
    compute_horizon, sweep_store, GcConfig, GcRunner, GcStats, GcStatsSnapshot, GcSweepResult,
    HorizonProvider,
};
use kestrel_storage::recovery::replay;
use kestrel_storage::store::VersionStore;
use kestrel_storage::wal::{SyncMode, Wal, WalReader, WalWriter};
use parking_lot::Mutex;

use crate::manager::{Transaction, TxnManager, TxnStatsSnapshot};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// WAL directory. `None` runs without durability (tests, scratch use).
    pub wal_dir: Option<PathBuf>,
    pub sync_mode: SyncMode,
    pub gc: GcConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wal_dir: None,
            sync_mode: SyncMode::FSync,
            gc: GcConfig::default(),
        }
    }
}

pub struct Engine {
    manager: Arc<TxnManager>,
    store: Arc<VersionStore>,
    gc_config: GcConfig,
    gc_stats: Arc<GcStats>,
    gc_runner: Mutex<Option<GcRunner>>,
}

impl Engine {
    /// Open the engine. With a WAL directory, existing segments are
    /// replayed first and id/seq counters resume past what the log holds.
    pub fn open(config: EngineConfig) -> Result<Self, KestrelError> {
        let store = Arc::new(VersionStore::new());

        let (wal, max_tx, last_seq) = match &config.wal_dir {
            Some(dir) => {
                let records = WalReader::new(dir).read_all()?;
                let summary = replay(&records, &store);
                if summary.committed > 0 || summary.rolled_back > 0 {
                    tracing::info!(
                        "recovery: {} committed, {} aborted, {} rolled back, seq {}",
                        summary.committed,
                        summary.aborted,
                        summary.rolled_back,
                        summary.max_commit_seq,
                    );
                }
                let writer = WalWriter::open(dir, config.sync_mode)?;
                (
                    Wal::Disk(writer),
                    TxId(summary.max_tx_id),
                    CommitSeq(summary.max_commit_seq),
                )
            }
            None => (Wal::Null, TxId(0), CommitSeq(0)),
        };

        let manager = Arc::new(TxnManager::new(
            Arc::clone(&store),
            Arc::new(wal),
            max_tx,
            last_seq,
        ));
        let gc_stats = Arc::new(GcStats::new());

        let gc_runner = if config.gc.enabled {
            let runner = GcRunner::start(
                Arc::clone(&store),
                Arc::clone(&manager) as Arc<dyn HorizonProvider>,
                config.gc.clone(),
                Arc::clone(&gc_stats),
            )
            .map_err(kestrel_common::error::StorageError::Io)?;
            Some(runner)
        } else {
            None
        };

        Ok(Self {
            manager,
            store,
            gc_config: config.gc,
            gc_stats,
            gc_runner: Mutex::new(gc_runner),
        })
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Transaction {
        self.manager.begin(isolation)
    }

    pub fn read(&self, tx: &mut Transaction, row: RowId) -> Result<Option<Vec<u8>>, TxnError> {
        self.manager.read(tx, row)
    }

    pub fn write(
        &self,
        tx: &mut Transaction,
        row: RowId,
        payload: Vec<u8>,
        op: WriteOp,
    ) -> Result<(), TxnError> {
        self.manager.write(tx, row, payload, op)
    }

    pub fn commit(&self, tx: &mut Transaction) -> Result<CommitSeq, TxnError> {
        self.manager.commit(tx)
    }

    pub fn abort(&self, tx: &mut Transaction) -> Result<(), TxnError> {
        self.manager.abort(tx)
    }

    /// Cancel a transaction blocked in a lock wait from another thread.
    pub fn cancel(&self, tx: TxId) {
        self.manager.cancel(tx);
    }

    /// Run one GC sweep on the caller's thread, independent of the
    /// background runner.
    pub fn run_gc(&self) -> GcSweepResult {
        let horizon = compute_horizon(
            self.manager.min_active_as_of(),
            self.manager.current_seq(),
        );
        sweep_store(&self.store, horizon, &self.gc_config, &self.gc_stats)
    }

    pub fn txn_stats(&self) -> TxnStatsSnapshot {
        self.manager.stats()
    }

    pub fn gc_stats(&self) -> GcStatsSnapshot {
        self.gc_stats.snapshot()
    }

    pub fn row_count(&self) -> usize {
        self.store.row_count()
    }

    /// Stop background work and flush the WAL. Active transactions are not
    /// waited for; their writes roll back on the next open.
    pub fn shutdown(&self) {
        if let Some(mut runner) = self.gc_runner.lock().take() {
            runner.stop();
        }
        if let Err(e) = self.manager.wal.flush() {
            tracing::warn!("WAL flush on shutdown failed: {}", e);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
