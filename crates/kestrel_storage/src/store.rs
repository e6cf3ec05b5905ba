//! The version store: a concurrent map from `RowId` to its version chain.
//!
//! All per-version logic lives in `mvcc`; this layer only routes operations
//! to the right chain. No store-wide lock is ever taken; DashMap shards
//! plus per-chain mutexes carry all synchronization.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use kestrel_common::types::{CommitSeq, RowId, Snapshot, TxId};

use crate::mvcc::VersionChain;

pub struct VersionStore {
    pub(crate) rows: DashMap<RowId, Arc<VersionChain>>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }

    fn chain(&self, row: RowId) -> Option<Arc<VersionChain>> {
        self.rows.get(&row).map(|e| Arc::clone(e.value()))
    }

    /// Append an uncommitted version for `row`, creating the chain on
    /// first write.
    pub fn insert_version(&self, row: RowId, tx: TxId, payload: Vec<u8>) {
        let chain = self
            .rows
            .entry(row)
            .or_insert_with(|| Arc::new(VersionChain::new()));
        chain.prepend(tx, payload);
    }

    /// Newest version of `row` visible to `reader` under `snap`.
    pub fn read(&self, row: RowId, reader: TxId, snap: &Snapshot) -> Option<Vec<u8>> {
        self.chain(row)
            .and_then(|chain| chain.read_visible(reader, snap))
    }

    /// Set an uncommitted delete marker on the version of `row` visible to
    /// `tx`. Returns `false` when no version is visible.
    pub fn mark_deleted(&self, row: RowId, tx: TxId, snap: &Snapshot) -> bool {
        match self.chain(row) {
            Some(chain) => chain.mark_deleted(tx, snap),
            None => false,
        }
    }

    /// First-updater-wins probe against `row` (see `VersionChain`).
    pub fn has_committed_write_after(&self, row: RowId, exclude: TxId, seq: CommitSeq) -> bool {
        match self.chain(row) {
            Some(chain) => chain.has_committed_write_after(exclude, seq),
            None => false,
        }
    }

    /// Stamp all of `tx`'s versions and markers in its write set.
    /// Called under the commit mutex, before the commit seq is published.
    pub fn commit_writes(&self, tx: TxId, seq: CommitSeq, write_set: &HashSet<RowId>) {
        for row in write_set {
            if let Some(chain) = self.chain(*row) {
                chain.commit(tx, seq);
            }
        }
    }

    /// Unlink all of `tx`'s versions and clear its delete markers.
    /// Chains emptied by the rollback are dropped from the map; the
    /// aborting transaction still holds the row locks, so no writer races
    /// the removal.
    pub fn abort_writes(&self, tx: TxId, write_set: &HashSet<RowId>) {
        for row in write_set {
            if let Some(chain) = self.chain(*row) {
                if chain.abort(tx) {
                    self.rows.remove_if(row, |_, c| c.is_empty());
                }
            }
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}
