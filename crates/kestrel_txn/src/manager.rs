//! Transaction lifecycle: begin, read, write, commit, abort.
//!
//! Commits serialize through the snapshot manager's publish lock. Inside
//! that section: serializable validation, seq assignment, the WAL commit
//! barrier, version stamping, publication. Snapshots are captured under
//! the same lock, so no reader ever observes a half-stamped commit.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use kestrel_common::error::{StorageError, TxnError};
use kestrel_common::types::{CommitSeq, IsolationLevel, RowId, Snapshot, TxId, TxnState, WriteOp};
use kestrel_storage::gc::HorizonProvider;
use kestrel_storage::store::VersionStore;
use kestrel_storage::wal::{Wal, WalRecord};
use parking_lot::Mutex;

use crate::lock::{LockManager, LockMode};
use crate::snapshot::SnapshotManager;

/// A transaction handle, owned by the caller. All operations go through
/// the manager; the handle carries the snapshot and the read/write sets.
pub struct Transaction {
    pub(crate) id: TxId,
    pub(crate) isolation: IsolationLevel,
    pub(crate) state: TxnState,
    pub(crate) snapshot: Snapshot,
    pub(crate) read_set: HashSet<RowId>,
    pub(crate) write_set: HashSet<RowId>,
    pub(crate) began: Instant,
}

impl Transaction {
    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

/// A committed transaction retained for serializable validation. Entries
/// are pruned once every active snapshot postdates them.
struct CommittedTxn {
    tx: TxId,
    seq: CommitSeq,
    write_set: HashSet<RowId>,
}

#[derive(Debug, Default)]
struct TxnStats {
    begun: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    write_conflicts: AtomicU64,
    serialization_failures: AtomicU64,
    deadlocks: AtomicU64,
}

/// Point-in-time counters for reporting.
#[derive(Debug, Clone, Default)]
pub struct TxnStatsSnapshot {
    pub begun: u64,
    pub commits: u64,
    pub aborts: u64,
    pub write_conflicts: u64,
    pub serialization_failures: u64,
    pub deadlocks: u64,
    pub active_transactions: usize,
}

pub struct TxnManager {
    pub(crate) store: Arc<VersionStore>,
    pub(crate) wal: Arc<Wal>,
    pub(crate) locks: LockManager,
    pub(crate) snapshots: SnapshotManager,
    tx_counter: AtomicU64,
    recent_commits: Mutex<VecDeque<CommittedTxn>>,
    /// Set on the first WAL failure; commits are refused from then on.
    poisoned: AtomicBool,
    stats: TxnStats,
}

impl TxnManager {
    /// `max_tx` / `last_seq` come from recovery (zero for a fresh engine);
    /// counters resume past them so ids are never reused.
    pub fn new(store: Arc<VersionStore>, wal: Arc<Wal>, max_tx: TxId, last_seq: CommitSeq) -> Self {
        Self {
            store,
            wal,
            locks: LockManager::new(),
            snapshots: SnapshotManager::new(last_seq),
            tx_counter: AtomicU64::new(max_tx.0 + 1),
            recent_commits: Mutex::new(VecDeque::new()),
            poisoned: AtomicBool::new(false),
            stats: TxnStats::default(),
        }
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Transaction {
        let id = TxId(self.tx_counter.fetch_add(1, Ordering::SeqCst));
        let snapshot = self.snapshots.capture(id);
        self.stats.begun.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("begin {} ({}) at {}", id, isolation, snapshot.as_of);
        Transaction {
            id,
            isolation,
            state: TxnState::Active,
            snapshot,
            read_set: HashSet::new(),
            write_set: HashSet::new(),
            began: Instant::now(),
        }
    }

    /// Read `row` under the transaction's snapshot. Absent or invisible
    /// rows are `Ok(None)`. Never blocks on writers.
    pub fn read(&self, tx: &mut Transaction, row: RowId) -> Result<Option<Vec<u8>>, TxnError> {
        Self::ensure_active(tx)?;
        if tx.isolation == IsolationLevel::ReadCommitted {
            tx.snapshot = self.snapshots.capture(tx.id);
        }
        tx.read_set.insert(row);
        Ok(self.store.read(row, tx.id, &tx.snapshot))
    }

    /// Write `row` under the exclusive row lock. For `Delete`, `payload`
    /// is ignored and deleting an invisible row is a silent no-op.
    pub fn write(
        &self,
        tx: &mut Transaction,
        row: RowId,
        payload: Vec<u8>,
        op: WriteOp,
    ) -> Result<(), TxnError> {
        Self::ensure_active(tx)?;
        self.locks
            .acquire(tx.id, row, LockMode::Exclusive)
            .map_err(|e| {
                if matches!(e, TxnError::DeadlockDetected(_)) {
                    self.stats.deadlocks.fetch_add(1, Ordering::Relaxed);
                }
                e
            })?;

        if tx.isolation == IsolationLevel::ReadCommitted {
            // Last writer wins: re-snapshot so the write lands on the
            // newest committed version.
            tx.snapshot = self.snapshots.capture(tx.id);
        } else if self.store.has_committed_write_after(row, tx.id, tx.snapshot.as_of) {
            // First-updater-wins: someone committed past our snapshot.
            self.stats.write_conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(TxnError::WriteConflict(tx.id, row));
        }

        match op {
            WriteOp::Insert => {
                self.store.insert_version(row, tx.id, payload.clone());
                self.log(WalRecord::Insert {
                    tx: tx.id,
                    row,
                    payload,
                })?;
            }
            WriteOp::Update => {
                self.store.mark_deleted(row, tx.id, &tx.snapshot);
                self.store.insert_version(row, tx.id, payload.clone());
                self.log(WalRecord::Update {
                    tx: tx.id,
                    row,
                    payload,
                })?;
            }
            WriteOp::Delete => {
                if !self.store.mark_deleted(row, tx.id, &tx.snapshot) {
                    return Ok(());
                }
                self.log(WalRecord::Delete { tx: tx.id, row })?;
            }
        }
        tx.write_set.insert(row);
        Ok(())
    }

    /// Commit. Under Serializable, first-committer-wins validation runs
    /// first; on `SerializationFailure` the caller must abort. The commit
    /// record is durable before the seq is published or the ack returned.
    pub fn commit(&self, tx: &mut Transaction) -> Result<CommitSeq, TxnError> {
        Self::ensure_active(tx)?;
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(TxnError::Durability(
                "engine refused commit after an earlier WAL failure".into(),
            ));
        }

        // Read-only: nothing to validate, log, or stamp.
        if tx.write_set.is_empty() {
            let seq = self.snapshots.current_seq();
            self.snapshots.retire(tx.id);
            self.locks.release_all(tx.id);
            tx.state = tx.state.try_transition(tx.id, TxnState::Committed)?;
            self.stats.commits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("commit {} (read-only) in {:?}", tx.id, tx.began.elapsed());
            return Ok(seq);
        }

        let publish = self.snapshots.lock_publish();

        if tx.isolation == IsolationLevel::Serializable {
            let conflict = {
                let recent = self.recent_commits.lock();
                recent
                    .iter()
                    .find(|c| {
                        c.seq > tx.snapshot.as_of
                            && c.write_set.iter().any(|r| tx.read_set.contains(r))
                    })
                    .map(|c| (c.tx, c.seq))
            };
            if let Some((other, other_seq)) = conflict {
                drop(publish);
                self.stats
                    .serialization_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "commit {} failed validation against {} ({})",
                    tx.id,
                    other,
                    other_seq
                );
                return Err(TxnError::SerializationFailure(tx.id));
            }
        }

        let seq = CommitSeq(self.snapshots.current_seq().0 + 1);

        if let Err(e) = self.wal.append_commit(&WalRecord::Commit { tx: tx.id, seq }) {
            drop(publish);
            return Err(self.poison(e));
        }

        self.store.commit_writes(tx.id, seq, &tx.write_set);
        self.snapshots.publish(seq);
        self.snapshots.retire(tx.id);

        {
            let mut recent = self.recent_commits.lock();
            recent.push_back(CommittedTxn {
                tx: tx.id,
                seq,
                write_set: tx.write_set.clone(),
            });
            // Entries every active snapshot postdates can never conflict.
            let keep_after = self.snapshots.min_active_as_of().unwrap_or(seq);
            while recent.front().is_some_and(|c| c.seq <= keep_after) {
                recent.pop_front();
            }
        }
        drop(publish);

        self.locks.release_all(tx.id);
        tx.state = tx.state.try_transition(tx.id, TxnState::Committed)?;
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("commit {} at {} in {:?}", tx.id, seq, tx.began.elapsed());
        Ok(seq)
    }

    /// Abort: unlink the transaction's versions, clear its markers,
    /// release its locks. Never blocks; idempotent on an aborted handle.
    pub fn abort(&self, tx: &mut Transaction) -> Result<(), TxnError> {
        match tx.state {
            TxnState::Aborted => return Ok(()),
            TxnState::Committed => return Err(TxnError::AlreadyCommitted(tx.id)),
            TxnState::Active => {}
        }

        self.store.abort_writes(tx.id, &tx.write_set);
        if !tx.write_set.is_empty() {
            if let Err(e) = self.wal.append(&WalRecord::Abort { tx: tx.id }) {
                // Recovery rolls back transactions without a terminal
                // record, so a lost abort record is harmless.
                tracing::warn!("WAL abort append failed for {}: {}", tx.id, e);
            }
        }
        self.snapshots.retire(tx.id);
        self.locks.release_all(tx.id);
        tx.state = tx.state.try_transition(tx.id, TxnState::Aborted)?;
        self.stats.aborts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("abort {}", tx.id);
        Ok(())
    }

    /// Cancel a transaction blocked in a lock wait from another thread.
    /// Its pending `write` returns `Aborted`; the owner then aborts it.
    pub fn cancel(&self, tx: TxId) {
        self.locks.cancel(tx);
    }

    pub fn stats(&self) -> TxnStatsSnapshot {
        TxnStatsSnapshot {
            begun: self.stats.begun.load(Ordering::Relaxed),
            commits: self.stats.commits.load(Ordering::Relaxed),
            aborts: self.stats.aborts.load(Ordering::Relaxed),
            write_conflicts: self.stats.write_conflicts.load(Ordering::Relaxed),
            serialization_failures: self.stats.serialization_failures.load(Ordering::Relaxed),
            deadlocks: self.stats.deadlocks.load(Ordering::Relaxed),
            active_transactions: self.snapshots.active_count(),
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn ensure_active(tx: &Transaction) -> Result<(), TxnError> {
        match tx.state {
            TxnState::Active => Ok(()),
            TxnState::Committed => Err(TxnError::AlreadyCommitted(tx.id)),
            TxnState::Aborted => Err(TxnError::Aborted(tx.id)),
        }
    }

    fn log(&self, record: WalRecord) -> Result<(), TxnError> {
        match self.wal.append(&record) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.poison(e)),
        }
    }

    fn poison(&self, e: StorageError) -> TxnError {
        self.poisoned.store(true, Ordering::SeqCst);
        tracing::error!("WAL failure, engine poisoned: {}", e);
        TxnError::Durability(e.to_string())
    }
}

impl HorizonProvider for TxnManager {
    fn min_active_as_of(&self) -> Option<CommitSeq> {
        self.snapshots.min_active_as_of()
    }

    fn current_seq(&self) -> CommitSeq {
        self.snapshots.current_seq()
    }
}
