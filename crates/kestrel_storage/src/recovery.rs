//! WAL replay.
//!
//! Data records are buffered per transaction and applied only when the
//! transaction's `Commit` record is seen, in commit order. Transactions
//! with buffered writes but no terminal record at the end of the log are
//! in-doubt and rolled back by simply not applying them.

use std::collections::{HashMap, HashSet};

use kestrel_common::types::{RowId, Snapshot, TxId};

use crate::store::VersionStore;
use crate::wal::WalRecord;

/// What replay found in the log. The engine restores its counters from
/// `max_tx_id` / `max_commit_seq`.
#[derive(Debug, Clone, Default)]
pub struct ReplaySummary {
    pub committed: u64,
    pub aborted: u64,
    /// In-doubt transactions dropped at the end of the log.
    pub rolled_back: u64,
    pub max_tx_id: u64,
    pub max_commit_seq: u64,
}

enum PendingOp {
    Insert { row: RowId, payload: Vec<u8> },
    Update { row: RowId, payload: Vec<u8> },
    Delete { row: RowId },
}

/// Rebuild the version store from a WAL record stream.
pub fn replay(records: &[WalRecord], store: &VersionStore) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    let mut pending: HashMap<TxId, Vec<PendingOp>> = HashMap::new();
    // Every transaction in the log is either fully committed or dropped,
    // so replay reads with a snapshot that sees all committed versions.
    let all = Snapshot::latest();

    let note_tx = |summary: &mut ReplaySummary, tx: TxId| {
        if tx.0 > summary.max_tx_id {
            summary.max_tx_id = tx.0;
        }
    };

    for record in records {
        match record {
            WalRecord::Insert { tx, row, payload } => {
                note_tx(&mut summary, *tx);
                pending.entry(*tx).or_default().push(PendingOp::Insert {
                    row: *row,
                    payload: payload.clone(),
                });
            }
            WalRecord::Update { tx, row, payload } => {
                note_tx(&mut summary, *tx);
                pending.entry(*tx).or_default().push(PendingOp::Update {
                    row: *row,
                    payload: payload.clone(),
                });
            }
            WalRecord::Delete { tx, row } => {
                note_tx(&mut summary, *tx);
                pending
                    .entry(*tx)
                    .or_default()
                    .push(PendingOp::Delete { row: *row });
            }
            WalRecord::Abort { tx } => {
                note_tx(&mut summary, *tx);
                pending.remove(tx);
                summary.aborted += 1;
            }
            WalRecord::Commit { tx, seq } => {
                note_tx(&mut summary, *tx);
                if seq.0 > summary.max_commit_seq {
                    summary.max_commit_seq = seq.0;
                }
                if let Some(ops) = pending.remove(tx) {
                    let mut touched: HashSet<RowId> = HashSet::new();
                    for op in ops {
                        match op {
                            PendingOp::Insert { row, payload } => {
                                store.insert_version(row, *tx, payload);
                                touched.insert(row);
                            }
                            PendingOp::Update { row, payload } => {
                                store.mark_deleted(row, *tx, &all);
                                store.insert_version(row, *tx, payload);
                                touched.insert(row);
                            }
                            PendingOp::Delete { row } => {
                                if store.mark_deleted(row, *tx, &all) {
                                    touched.insert(row);
                                }
                            }
                        }
                    }
                    store.commit_writes(*tx, *seq, &touched);
                    summary.committed += 1;
                }
            }
        }
    }

    summary.rolled_back = pending.len() as u64;
    if summary.rolled_back > 0 {
        tracing::warn!(
            "recovery rolled back {} in-doubt transaction(s)",
            summary.rolled_back
        );
    }
    summary
}
