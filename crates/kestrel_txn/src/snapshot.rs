//! Snapshot capture and the active-transaction registry.
//!
//! The published commit seq and the active set are read under the same
//! mutex that serializes commit publication, so a snapshot can never land
//! between a commit's seq assignment and its version stamping. The
//! registry doubles as the GC horizon source: the oldest registered
//! `as_of` pins every version a live snapshot can still reach.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use kestrel_common::types::{CommitSeq, Snapshot, TxId};
use parking_lot::{Mutex, MutexGuard};

pub struct SnapshotManager {
    /// Last published commit seq.
    commit_seq: AtomicU64,
    /// Serializes commit publication against snapshot capture.
    publish_lock: Mutex<()>,
    /// Active transactions and the `as_of` of their current snapshot.
    active: DashMap<TxId, CommitSeq>,
}

impl SnapshotManager {
    pub fn new(initial_seq: CommitSeq) -> Self {
        Self {
            commit_seq: AtomicU64::new(initial_seq.0),
            publish_lock: Mutex::new(()),
            active: DashMap::new(),
        }
    }

    /// Capture a snapshot for `for_tx` and (re-)register it as active.
    /// Read-committed re-captures per statement; the registry entry moves
    /// forward with it, releasing the GC horizon.
    pub fn capture(&self, for_tx: TxId) -> Snapshot {
        let _publish = self.publish_lock.lock();
        self.capture_locked(for_tx)
    }

    pub(crate) fn capture_locked(&self, for_tx: TxId) -> Snapshot {
        let as_of = CommitSeq(self.commit_seq.load(Ordering::SeqCst));
        let active_at_start: HashSet<TxId> = self
            .active
            .iter()
            .map(|e| *e.key())
            .filter(|t| *t != for_tx)
            .collect();
        self.active.insert(for_tx, as_of);
        Snapshot {
            as_of,
            active_at_start,
        }
    }

    /// Enter the commit critical section.
    pub(crate) fn lock_publish(&self) -> MutexGuard<'_, ()> {
        self.publish_lock.lock()
    }

    /// Publish a commit seq. Caller holds the publish lock and has already
    /// stamped the committed versions.
    pub(crate) fn publish(&self, seq: CommitSeq) {
        self.commit_seq.store(seq.0, Ordering::SeqCst);
    }

    /// Drop a finished transaction from the registry.
    pub fn retire(&self, tx: TxId) {
        self.active.remove(&tx);
    }

    pub fn current_seq(&self) -> CommitSeq {
        CommitSeq(self.commit_seq.load(Ordering::SeqCst))
    }

    /// Oldest `as_of` across live snapshots, `None` when idle.
    pub fn min_active_as_of(&self) -> Option<CommitSeq> {
        self.active.iter().map(|e| *e.value()).min()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
