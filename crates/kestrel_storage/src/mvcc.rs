//! Version chains: the per-row MVCC structure.
//!
//! Each row maps to a `VersionChain`, a newest-first vector of versions
//! under a per-row mutex. Payloads are immutable once written; the only
//! in-place mutations are commit/abort stamping, delete markers, and GC
//! unlinking. Writers are serialized by the row lock above this layer, so
//! at most one uncommitted writer touches a chain at a time; readers never
//! block on writers beyond the brief chain lock.

use kestrel_common::types::{CommitSeq, Snapshot, TxId};
use parking_lot::Mutex;

/// One version of a row. `created_seq`/`deleted_seq` stay `None` while the
/// writing transaction is uncommitted and are stamped at commit.
#[derive(Debug, Clone)]
pub struct RowVersion {
    pub created_by: TxId,
    pub created_seq: Option<CommitSeq>,
    pub deleted_by: Option<TxId>,
    pub deleted_seq: Option<CommitSeq>,
    pub payload: Vec<u8>,
}

impl RowVersion {
    /// Whether this version's creation is visible to `reader` under `snap`.
    /// Own writes are always visible.
    fn creation_visible(&self, reader: TxId, snap: &Snapshot) -> bool {
        if self.created_by == reader {
            return true;
        }
        match self.created_seq {
            Some(seq) => snap.includes(self.created_by, seq),
            None => false,
        }
    }

    /// Whether this version's delete marker applies for `reader` under
    /// `snap`. An uncommitted marker only applies to its own transaction.
    fn deletion_visible(&self, reader: TxId, snap: &Snapshot) -> bool {
        match self.deleted_by {
            None => false,
            Some(d) if d == reader => true,
            Some(d) => match self.deleted_seq {
                Some(seq) => snap.includes(d, seq),
                None => false,
            },
        }
    }
}

/// Result of pruning a single chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainPruneResult {
    pub reclaimed: usize,
    pub remaining: usize,
}

/// Newest-first version chain for one row.
pub struct VersionChain {
    versions: Mutex<Vec<RowVersion>>,
}

impl VersionChain {
    pub fn new() -> Self {
        Self {
            versions: Mutex::new(Vec::new()),
        }
    }

    /// Prepend an uncommitted version written by `tx`.
    pub fn prepend(&self, tx: TxId, payload: Vec<u8>) {
        let mut versions = self.versions.lock();
        versions.insert(
            0,
            RowVersion {
                created_by: tx,
                created_seq: None,
                deleted_by: None,
                deleted_seq: None,
                payload,
            },
        );
    }

    /// The newest version visible to `reader` under `snap`, or `None` if
    /// the row does not exist in that view (never written, or deleted).
    pub fn read_visible(&self, reader: TxId, snap: &Snapshot) -> Option<Vec<u8>> {
        let versions = self.versions.lock();
        for v in versions.iter() {
            if v.creation_visible(reader, snap) {
                if v.deletion_visible(reader, snap) {
                    return None;
                }
                return Some(v.payload.clone());
            }
        }
        None
    }

    /// Set an uncommitted delete marker on the version visible to `tx`.
    /// Returns `false` if no version is visible (delete is a no-op then).
    pub fn mark_deleted(&self, tx: TxId, snap: &Snapshot) -> bool {
        let mut versions = self.versions.lock();
        for v in versions.iter_mut() {
            if v.creation_visible(tx, snap) {
                if v.deletion_visible(tx, snap) {
                    return false;
                }
                v.deleted_by = Some(tx);
                v.deleted_seq = None;
                return true;
            }
        }
        false
    }

    /// Stamp every version and delete marker written by `tx` with its
    /// commit seq. Called under the commit mutex.
    pub fn commit(&self, tx: TxId, seq: CommitSeq) {
        let mut versions = self.versions.lock();
        for v in versions.iter_mut() {
            if v.created_by == tx && v.created_seq.is_none() {
                v.created_seq = Some(seq);
            }
            if v.deleted_by == Some(tx) && v.deleted_seq.is_none() {
                v.deleted_seq = Some(seq);
            }
        }
    }

    /// Unlink versions created by `tx` and clear its delete markers.
    /// Returns `true` if the chain is empty afterwards.
    pub fn abort(&self, tx: TxId) -> bool {
        let mut versions = self.versions.lock();
        versions.retain(|v| !(v.created_by == tx && v.created_seq.is_none()));
        for v in versions.iter_mut() {
            if v.deleted_by == Some(tx) && v.deleted_seq.is_none() {
                v.deleted_by = None;
            }
        }
        versions.is_empty()
    }

    /// First-updater-wins probe: is there a committed version or delete
    /// marker, written by someone other than `exclude`, with a seq after
    /// `seq`?
    pub fn has_committed_write_after(&self, exclude: TxId, seq: CommitSeq) -> bool {
        let versions = self.versions.lock();
        versions.iter().any(|v| {
            let created_after = v.created_by != exclude
                && matches!(v.created_seq, Some(s) if s > seq);
            let deleted_after = matches!(v.deleted_by, Some(d) if d != exclude)
                && matches!(v.deleted_seq, Some(s) if s > seq);
            created_after || deleted_after
        })
    }

    /// Unlink committed versions whose delete marker precedes `horizon`.
    /// The newest committed version and all uncommitted versions are
    /// always retained, so a chain never empties under GC.
    pub fn prune(&self, horizon: CommitSeq) -> ChainPruneResult {
        let mut versions = self.versions.lock();
        let before = versions.len();
        let mut seen_newest_committed = false;
        versions.retain(|v| {
            if v.created_seq.is_none() {
                return true;
            }
            if !seen_newest_committed {
                seen_newest_committed = true;
                return true;
            }
            !matches!(v.deleted_seq, Some(s) if s < horizon)
        });
        ChainPruneResult {
            reclaimed: before - versions.len(),
            remaining: versions.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.versions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.lock().is_empty()
    }
}

impl Default for VersionChain {
    fn default() -> Self {
        Self::new()
    }
}
