//! Segmented write-ahead log.
//!
//! Each segment starts with a magic + format-version header; records are
//! framed `[len:4][crc32:4][bincode payload]`. Data records are buffered
//! and flushed in groups; commit records go through `append_commit`, which
//! flushes and syncs before returning, so a commit is durable before it is
//! acknowledged. Recovery reads segments in order and stops at the first
//! torn or corrupt record, tolerating a crash mid-append.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use kestrel_common::error::StorageError;
use kestrel_common::types::{CommitSeq, RowId, TxId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// WAL format version, checked on replay. Increment on any
/// backward-incompatible change to `WalRecord`.
pub const WAL_FORMAT_VERSION: u32 = 1;

/// Magic bytes at the start of each segment.
pub const WAL_MAGIC: &[u8; 4] = b"KSTL";

/// Segment header: magic (4) + format version (4).
pub const WAL_SEGMENT_HEADER_SIZE: usize = 8;

/// A single WAL record. Data records carry the writing transaction so
/// replay can group them; only transactions with a `Commit` record are
/// applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    Insert {
        tx: TxId,
        row: RowId,
        payload: Vec<u8>,
    },
    Update {
        tx: TxId,
        row: RowId,
        payload: Vec<u8>,
    },
    Delete {
        tx: TxId,
        row: RowId,
    },
    Commit {
        tx: TxId,
        seq: CommitSeq,
    },
    Abort {
        tx: TxId,
    },
}

/// Durability barrier applied when flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Flush to the OS only. A machine crash can lose acknowledged commits.
    None,
    /// `sync_data` on every flush; commits survive power loss.
    FSync,
}

/// Default segment size: 64 MB.
const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;
/// Buffer up to this many data records before flushing.
const DEFAULT_GROUP_BUFFER: usize = 32;

fn segment_filename(segment_id: u64) -> String {
    format!("kestrel_{:06}.wal", segment_id)
}

fn parse_segment_id(name: &str) -> Option<u64> {
    let stem = name.strip_prefix("kestrel_")?.strip_suffix(".wal")?;
    stem.parse::<u64>().ok()
}

/// WAL writer: append-only, group buffering, segment rotation.
pub struct WalWriter {
    inner: Mutex<WalWriterInner>,
    lsn: AtomicU64,
    sync_mode: SyncMode,
    max_segment_size: u64,
    group_buffer: usize,
}

struct WalWriterInner {
    writer: BufWriter<File>,
    dir: PathBuf,
    current_segment: u64,
    current_segment_size: u64,
    pending_count: usize,
}

impl WalWriter {
    pub fn open(dir: &Path, sync_mode: SyncMode) -> Result<Self, StorageError> {
        Self::open_with_options(dir, sync_mode, DEFAULT_SEGMENT_SIZE, DEFAULT_GROUP_BUFFER)
    }

    pub fn open_with_options(
        dir: &Path,
        sync_mode: SyncMode,
        max_segment_size: u64,
        group_buffer: usize,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;

        let segment_id = Self::find_latest_segment(dir).unwrap_or(0);
        let seg_path = dir.join(segment_filename(segment_id));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&seg_path)?;
        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let mut current_segment_size = file_len;

        let mut writer = BufWriter::new(file);
        if file_len == 0 {
            writer.write_all(WAL_MAGIC)?;
            writer.write_all(&WAL_FORMAT_VERSION.to_le_bytes())?;
            writer.flush()?;
            current_segment_size = WAL_SEGMENT_HEADER_SIZE as u64;
        }

        Ok(Self {
            inner: Mutex::new(WalWriterInner {
                writer,
                dir: dir.to_path_buf(),
                current_segment: segment_id,
                current_segment_size,
                pending_count: 0,
            }),
            lsn: AtomicU64::new(0),
            sync_mode,
            max_segment_size,
            group_buffer,
        })
    }

    fn find_latest_segment(dir: &Path) -> Option<u64> {
        let mut max_id = None;
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if let Some(id) = parse_segment_id(&name.to_string_lossy()) {
                    max_id = Some(max_id.map_or(id, |cur: u64| cur.max(id)));
                }
            }
        }
        max_id
    }

    /// Append a record. Returns the LSN. Buffered records are flushed once
    /// the group buffer fills; durability is only guaranteed after
    /// `append_commit` or `flush`.
    pub fn append(&self, record: &WalRecord) -> Result<u64, StorageError> {
        let data = bincode::serialize(record)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let lsn = self.lsn.fetch_add(1, Ordering::SeqCst);
        let checksum = crc32fast::hash(&data);
        let len = data.len() as u32;
        let record_size = 8 + data.len() as u64;

        let mut inner = self.inner.lock();

        if inner.current_segment_size + record_size > self.max_segment_size {
            self.rotate_segment(&mut inner)?;
        }

        inner.writer.write_all(&len.to_le_bytes())?;
        inner.writer.write_all(&checksum.to_le_bytes())?;
        inner.writer.write_all(&data)?;
        inner.current_segment_size += record_size;
        inner.pending_count += 1;

        if inner.pending_count >= self.group_buffer {
            self.flush_inner(&mut inner)?;
        }

        Ok(lsn)
    }

    /// Append a record and force it (and everything buffered before it)
    /// through the durability barrier. The write-ahead rule for commits.
    pub fn append_commit(&self, record: &WalRecord) -> Result<u64, StorageError> {
        let lsn = self.append(record)?;
        self.flush()?;
        Ok(lsn)
    }

    /// Flush buffered writes and apply the sync barrier.
    pub fn flush(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        self.flush_inner(&mut inner)
    }

    fn flush_inner(&self, inner: &mut WalWriterInner) -> Result<(), StorageError> {
        inner.writer.flush()?;
        inner.pending_count = 0;
        if self.sync_mode == SyncMode::FSync {
            inner.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn rotate_segment(&self, inner: &mut WalWriterInner) -> Result<(), StorageError> {
        inner.writer.flush()?;
        if self.sync_mode == SyncMode::FSync {
            inner.writer.get_ref().sync_data()?;
        }

        inner.current_segment += 1;
        let new_path = inner.dir.join(segment_filename(inner.current_segment));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&new_path)?;
        inner.writer = BufWriter::new(file);
        inner.writer.write_all(WAL_MAGIC)?;
        inner.writer.write_all(&WAL_FORMAT_VERSION.to_le_bytes())?;
        inner.current_segment_size = WAL_SEGMENT_HEADER_SIZE as u64;
        inner.pending_count = 0;

        tracing::debug!("WAL rotated to segment {}", inner.current_segment);
        Ok(())
    }

    pub fn current_lsn(&self) -> u64 {
        self.lsn.load(Ordering::SeqCst)
    }

    pub fn current_segment_id(&self) -> u64 {
        self.inner.lock().current_segment
    }
}

/// WAL reader for recovery. Reads all segments in order.
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Read all records from all segments. A torn or corrupt tail ends
    /// the scan; everything before it is returned.
    pub fn read_all(&self) -> Result<Vec<WalRecord>, StorageError> {
        let mut records = Vec::new();

        let mut segment_ids = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if let Some(id) = parse_segment_id(&name.to_string_lossy()) {
                    segment_ids.push(id);
                }
            }
        }
        segment_ids.sort();

        for seg_id in segment_ids {
            let seg_path = self.dir.join(segment_filename(seg_id));
            if seg_path.exists() {
                let data = fs::read(&seg_path)?;
                Self::parse_records(&data, &mut records);
            }
        }

        Ok(records)
    }

    /// Parse records from raw segment bytes, appending to `records`.
    fn parse_records(data: &[u8], records: &mut Vec<WalRecord>) {
        let mut pos = 0;

        if data.len() >= WAL_SEGMENT_HEADER_SIZE && &data[0..4] == WAL_MAGIC.as_slice() {
            let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
            if version != WAL_FORMAT_VERSION {
                tracing::warn!(
                    "WAL segment format version {} (expected {}), skipping segment",
                    version,
                    WAL_FORMAT_VERSION
                );
                return;
            }
            pos = WAL_SEGMENT_HEADER_SIZE;
        }

        while pos + 8 <= data.len() {
            let len =
                u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
                    as usize;
            let checksum =
                u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
            pos += 8;

            if pos + len > data.len() {
                tracing::warn!("WAL truncated at position {}, stopping recovery", pos);
                break;
            }

            let record_data = &data[pos..pos + len];
            if crc32fast::hash(record_data) != checksum {
                tracing::warn!("WAL checksum mismatch at position {}, stopping recovery", pos);
                break;
            }

            match bincode::deserialize::<WalRecord>(record_data) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("WAL deserialization error at position {}: {}", pos, e);
                    break;
                }
            }
            pos += len;
        }
    }
}

/// WAL handle: disk-backed or a no-op for pure in-memory engines.
pub enum Wal {
    Disk(WalWriter),
    Null,
}

impl Wal {
    pub fn append(&self, record: &WalRecord) -> Result<u64, StorageError> {
        match self {
            Wal::Disk(w) => w.append(record),
            Wal::Null => Ok(0),
        }
    }

    pub fn append_commit(&self, record: &WalRecord) -> Result<u64, StorageError> {
        match self {
            Wal::Disk(w) => w.append_commit(record),
            Wal::Null => Ok(0),
        }
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        match self {
            Wal::Disk(w) => w.flush(),
            Wal::Null => Ok(()),
        }
    }
}
