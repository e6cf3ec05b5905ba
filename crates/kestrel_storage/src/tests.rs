//! Storage crate tests: version store behavior, WAL durability and
//! recovery, and GC safety.

use std::collections::HashSet;
use std::sync::Arc;

use kestrel_common::types::{CommitSeq, RowId, Snapshot, TxId};

use crate::gc::{compute_horizon, sweep_store, GcConfig, GcRunner, GcStats, HorizonProvider};
use crate::recovery::replay;
use crate::store::VersionStore;
use crate::wal::{SyncMode, Wal, WalReader, WalRecord, WalWriter};

fn snap(as_of: u64) -> Snapshot {
    Snapshot {
        as_of: CommitSeq(as_of),
        active_at_start: HashSet::new(),
    }
}

fn write_set(rows: &[u64]) -> HashSet<RowId> {
    rows.iter().copied().map(RowId).collect()
}

// ── version store ────────────────────────────────────────────────────────

#[test]
fn test_store_insert_commit_read() {
    let store = VersionStore::new();
    store.insert_version(RowId(1), TxId(1), b"a".to_vec());
    assert_eq!(store.read(RowId(1), TxId(2), &snap(0)), None);

    store.commit_writes(TxId(1), CommitSeq(1), &write_set(&[1]));
    assert_eq!(store.read(RowId(1), TxId(2), &snap(1)), Some(b"a".to_vec()));
    assert_eq!(store.read(RowId(1), TxId(2), &snap(0)), None);
}

#[test]
fn test_store_delete_of_missing_row_is_noop() {
    let store = VersionStore::new();
    assert!(!store.mark_deleted(RowId(99), TxId(1), &snap(0)));
}

#[test]
fn test_store_abort_drops_empty_chain() {
    let store = VersionStore::new();
    store.insert_version(RowId(1), TxId(1), b"a".to_vec());
    assert_eq!(store.row_count(), 1);
    store.abort_writes(TxId(1), &write_set(&[1]));
    assert_eq!(store.row_count(), 0);
}

#[test]
fn test_store_abort_keeps_committed_versions() {
    let store = VersionStore::new();
    store.insert_version(RowId(1), TxId(1), b"a".to_vec());
    store.commit_writes(TxId(1), CommitSeq(1), &write_set(&[1]));

    store.mark_deleted(RowId(1), TxId(2), &snap(1));
    store.insert_version(RowId(1), TxId(2), b"b".to_vec());
    store.abort_writes(TxId(2), &write_set(&[1]));

    assert_eq!(store.read(RowId(1), TxId(3), &snap(1)), Some(b"a".to_vec()));
}

#[test]
fn test_store_conflict_probe_on_missing_row() {
    let store = VersionStore::new();
    assert!(!store.has_committed_write_after(RowId(5), TxId(1), CommitSeq(0)));
}

// ── WAL ──────────────────────────────────────────────────────────────────

fn sample_records() -> Vec<WalRecord> {
    vec![
        WalRecord::Insert {
            tx: TxId(1),
            row: RowId(10),
            payload: b"hello".to_vec(),
        },
        WalRecord::Update {
            tx: TxId(1),
            row: RowId(10),
            payload: b"world".to_vec(),
        },
        WalRecord::Delete {
            tx: TxId(1),
            row: RowId(11),
        },
        WalRecord::Commit {
            tx: TxId(1),
            seq: CommitSeq(1),
        },
        WalRecord::Abort { tx: TxId(2) },
    ]
}

#[test]
fn test_wal_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let wal = WalWriter::open(dir.path(), SyncMode::None).unwrap();
    for r in sample_records() {
        wal.append(&r).unwrap();
    }
    wal.flush().unwrap();

    let records = WalReader::new(dir.path()).read_all().unwrap();
    assert_eq!(records.len(), 5);
    assert!(matches!(
        records[0],
        WalRecord::Insert { tx: TxId(1), row: RowId(10), .. }
    ));
    assert!(matches!(records[4], WalRecord::Abort { tx: TxId(2) }));
}

#[test]
fn test_wal_commit_barrier_flushes_buffered_records() {
    let dir = tempfile::tempdir().unwrap();
    // Huge group buffer: nothing flushes until the commit barrier.
    let wal = WalWriter::open_with_options(dir.path(), SyncMode::FSync, 64 * 1024 * 1024, 10_000)
        .unwrap();
    wal.append(&WalRecord::Insert {
        tx: TxId(1),
        row: RowId(1),
        payload: b"x".to_vec(),
    })
    .unwrap();
    wal.append_commit(&WalRecord::Commit {
        tx: TxId(1),
        seq: CommitSeq(1),
    })
    .unwrap();

    // No flush() here: append_commit alone must have made both durable.
    let records = WalReader::new(dir.path()).read_all().unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn test_wal_segment_rotation_preserves_order() {
    let dir = tempfile::tempdir().unwrap();
    // Tiny segments force rotation every few records.
    let wal = WalWriter::open_with_options(dir.path(), SyncMode::None, 128, 1).unwrap();
    for i in 0..50u64 {
        wal.append(&WalRecord::Insert {
            tx: TxId(i),
            row: RowId(i),
            payload: vec![0u8; 16],
        })
        .unwrap();
    }
    wal.flush().unwrap();
    assert!(wal.current_segment_id() > 0);

    let records = WalReader::new(dir.path()).read_all().unwrap();
    assert_eq!(records.len(), 50);
    for (i, r) in records.iter().enumerate() {
        match r {
            WalRecord::Insert { tx, .. } => assert_eq!(tx.0, i as u64),
            other => panic!("unexpected record {:?}", other),
        }
    }
}

#[test]
fn test_wal_torn_tail_stops_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let wal = WalWriter::open(dir.path(), SyncMode::None).unwrap();
    for r in sample_records() {
        wal.append(&r).unwrap();
    }
    wal.flush().unwrap();
    drop(wal);

    // Simulate a crash mid-append: a frame header promising more bytes
    // than the file holds.
    let seg = dir.path().join("kestrel_000000.wal");
    let mut data = std::fs::read(&seg).unwrap();
    data.extend_from_slice(&100u32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(b"torn");
    std::fs::write(&seg, &data).unwrap();

    let records = WalReader::new(dir.path()).read_all().unwrap();
    assert_eq!(records.len(), 5);
}

#[test]
fn test_wal_checksum_mismatch_stops_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let wal = WalWriter::open(dir.path(), SyncMode::None).unwrap();
    for r in sample_records() {
        wal.append(&r).unwrap();
    }
    wal.flush().unwrap();
    drop(wal);

    // Flip the last payload byte of the final record.
    let seg = dir.path().join("kestrel_000000.wal");
    let mut data = std::fs::read(&seg).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xFF;
    std::fs::write(&seg, &data).unwrap();

    let records = WalReader::new(dir.path()).read_all().unwrap();
    assert_eq!(records.len(), 4);
}

#[test]
fn test_wal_reopen_appends_after_existing_records() {
    let dir = tempfile::tempdir().unwrap();
    {
        let wal = WalWriter::open(dir.path(), SyncMode::None).unwrap();
        wal.append(&WalRecord::Abort { tx: TxId(1) }).unwrap();
        wal.flush().unwrap();
    }
    {
        let wal = WalWriter::open(dir.path(), SyncMode::None).unwrap();
        wal.append(&WalRecord::Abort { tx: TxId(2) }).unwrap();
        wal.flush().unwrap();
    }
    let records = WalReader::new(dir.path()).read_all().unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn test_null_wal_is_a_sink() {
    let wal = Wal::Null;
    assert_eq!(wal.append(&WalRecord::Abort { tx: TxId(1) }).unwrap(), 0);
    assert_eq!(
        wal.append_commit(&WalRecord::Commit {
            tx: TxId(1),
            seq: CommitSeq(1)
        })
        .unwrap(),
        0
    );
    wal.flush().unwrap();
}

// ── recovery ─────────────────────────────────────────────────────────────

#[test]
fn test_replay_applies_committed_transactions() {
    let store = VersionStore::new();
    let records = vec![
        WalRecord::Insert {
            tx: TxId(1),
            row: RowId(1),
            payload: b"a".to_vec(),
        },
        WalRecord::Commit {
            tx: TxId(1),
            seq: CommitSeq(1),
        },
    ];
    let summary = replay(&records, &store);
    assert_eq!(summary.committed, 1);
    assert_eq!(summary.rolled_back, 0);
    assert_eq!(store.read(RowId(1), TxId(9), &snap(1)), Some(b"a".to_vec()));
}

#[test]
fn test_replay_rolls_back_in_doubt_transactions() {
    let store = VersionStore::new();
    let records = vec![
        WalRecord::Insert {
            tx: TxId(1),
            row: RowId(1),
            payload: b"a".to_vec(),
        },
        WalRecord::Commit {
            tx: TxId(1),
            seq: CommitSeq(1),
        },
        // tx-2 wrote but never reached a terminal record.
        WalRecord::Update {
            tx: TxId(2),
            row: RowId(1),
            payload: b"b".to_vec(),
        },
    ];
    let summary = replay(&records, &store);
    assert_eq!(summary.committed, 1);
    assert_eq!(summary.rolled_back, 1);
    assert_eq!(store.read(RowId(1), TxId(9), &snap(1)), Some(b"a".to_vec()));
}

#[test]
fn test_replay_honors_abort_records() {
    let store = VersionStore::new();
    let records = vec![
        WalRecord::Insert {
            tx: TxId(1),
            row: RowId(1),
            payload: b"a".to_vec(),
        },
        WalRecord::Abort { tx: TxId(1) },
    ];
    let summary = replay(&records, &store);
    assert_eq!(summary.committed, 0);
    assert_eq!(summary.aborted, 1);
    assert_eq!(store.row_count(), 0);
}

#[test]
fn test_replay_update_supersedes_and_delete_hides() {
    let store = VersionStore::new();
    let records = vec![
        WalRecord::Insert {
            tx: TxId(1),
            row: RowId(1),
            payload: b"a".to_vec(),
        },
        WalRecord::Insert {
            tx: TxId(1),
            row: RowId(2),
            payload: b"x".to_vec(),
        },
        WalRecord::Commit {
            tx: TxId(1),
            seq: CommitSeq(1),
        },
        WalRecord::Update {
            tx: TxId(2),
            row: RowId(1),
            payload: b"b".to_vec(),
        },
        WalRecord::Delete {
            tx: TxId(2),
            row: RowId(2),
        },
        WalRecord::Commit {
            tx: TxId(2),
            seq: CommitSeq(2),
        },
    ];
    let summary = replay(&records, &store);
    assert_eq!(summary.committed, 2);
    assert_eq!(store.read(RowId(1), TxId(9), &snap(2)), Some(b"b".to_vec()));
    assert_eq!(store.read(RowId(2), TxId(9), &snap(2)), None);
    // The pre-update state is still reachable at the older seq.
    assert_eq!(store.read(RowId(1), TxId(9), &snap(1)), Some(b"a".to_vec()));
    assert_eq!(store.read(RowId(2), TxId(9), &snap(1)), Some(b"x".to_vec()));
}

#[test]
fn test_replay_reports_counter_watermarks() {
    let store = VersionStore::new();
    let records = vec![
        WalRecord::Insert {
            tx: TxId(7),
            row: RowId(1),
            payload: b"a".to_vec(),
        },
        WalRecord::Commit {
            tx: TxId(7),
            seq: CommitSeq(3),
        },
        WalRecord::Abort { tx: TxId(9) },
    ];
    let summary = replay(&records, &store);
    assert_eq!(summary.max_tx_id, 9);
    assert_eq!(summary.max_commit_seq, 3);
}

// ── GC ───────────────────────────────────────────────────────────────────

/// Insert + commit, then update + commit, leaving a two-version chain with
/// the old version deleted at seq 2.
fn two_version_store() -> VersionStore {
    let store = VersionStore::new();
    store.insert_version(RowId(1), TxId(1), b"a".to_vec());
    store.commit_writes(TxId(1), CommitSeq(1), &write_set(&[1]));
    store.mark_deleted(RowId(1), TxId(2), &snap(1));
    store.insert_version(RowId(1), TxId(2), b"b".to_vec());
    store.commit_writes(TxId(2), CommitSeq(2), &write_set(&[1]));
    store
}

#[test]
fn test_sweep_reclaims_superseded_versions() {
    let store = two_version_store();
    let stats = GcStats::new();
    let horizon = compute_horizon(None, CommitSeq(2));
    let result = sweep_store(&store, horizon, &GcConfig::default(), &stats);
    assert_eq!(result.reclaimed_versions, 1);
    assert_eq!(result.chains_pruned, 1);
    assert_eq!(store.read(RowId(1), TxId(9), &snap(2)), Some(b"b".to_vec()));
    assert_eq!(stats.snapshot().total_sweeps, 1);
}

#[test]
fn test_sweep_respects_live_snapshot() {
    let store = two_version_store();
    let stats = GcStats::new();
    // A snapshot at seq 1 is still live: horizon stays at 1.
    let horizon = compute_horizon(Some(CommitSeq(1)), CommitSeq(2));
    let result = sweep_store(&store, horizon, &GcConfig::default(), &stats);
    assert_eq!(result.reclaimed_versions, 0);
    assert_eq!(store.read(RowId(1), TxId(9), &snap(1)), Some(b"a".to_vec()));
}

#[test]
fn test_sweep_skips_short_chains() {
    let store = VersionStore::new();
    store.insert_version(RowId(1), TxId(1), b"a".to_vec());
    store.commit_writes(TxId(1), CommitSeq(1), &write_set(&[1]));
    let stats = GcStats::new();
    let result = sweep_store(
        &store,
        CommitSeq(u64::MAX),
        &GcConfig::default(),
        &stats,
    );
    assert_eq!(result.chains_inspected, 0);
    assert_eq!(result.rows_skipped, 1);
}

struct FixedHorizon;

impl HorizonProvider for FixedHorizon {
    fn min_active_as_of(&self) -> Option<CommitSeq> {
        None
    }
    fn current_seq(&self) -> CommitSeq {
        CommitSeq(2)
    }
}

#[test]
fn test_gc_runner_sweeps_and_stops() {
    let store = Arc::new(two_version_store());
    let stats = Arc::new(GcStats::new());
    let config = GcConfig {
        interval_ms: 10,
        ..Default::default()
    };
    let mut runner = GcRunner::start(
        Arc::clone(&store),
        Arc::new(FixedHorizon),
        config,
        Arc::clone(&stats),
    )
    .unwrap();
    assert!(runner.is_running());

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while stats.snapshot().total_reclaimed_versions == 0 {
        assert!(std::time::Instant::now() < deadline, "GC never swept");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    runner.stop();
    assert!(!runner.is_running());
}
