//! Core identifier and lifecycle types shared by the storage and
//! transaction layers.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TxnError;

/// Transaction identifier. Monotonically increasing, assigned at begin,
/// never reused within an engine lifetime (recovery restores the counter
/// past the highest id seen in the log).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Commit sequence number. Assigned at commit time under the commit mutex,
/// so `CommitSeq` order is the total commit order of the engine.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CommitSeq(pub u64);

impl fmt::Display for CommitSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq-{}", self.0)
    }
}

/// Logical row identifier, supplied by the caller. The engine is agnostic
/// to what a row contains; payloads are opaque bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row-{}", self.0)
    }
}

/// Isolation level requested at `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Fresh snapshot per statement. Writes never fail with a conflict;
    /// the last committer wins after lock acquisition.
    ReadCommitted,
    /// One snapshot for the whole transaction; first-updater-wins on
    /// write-write conflicts.
    RepeatableRead,
    /// RepeatableRead plus commit-time first-committer-wins validation of
    /// the read set.
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IsolationLevel::ReadCommitted => "read-committed",
            IsolationLevel::RepeatableRead => "repeatable-read",
            IsolationLevel::Serializable => "serializable",
        };
        f.write_str(s)
    }
}

/// Transaction lifecycle state. `Active` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

impl TxnState {
    /// Validate a state transition. Terminal states admit no transitions.
    pub fn try_transition(self, tx: TxId, next: TxnState) -> Result<TxnState, TxnError> {
        match (self, next) {
            (TxnState::Active, TxnState::Committed) | (TxnState::Active, TxnState::Aborted) => {
                Ok(next)
            }
            (from, to) => Err(TxnError::InvalidTransition(
                tx,
                from.to_string(),
                to.to_string(),
            )),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TxnState::Active)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnState::Active => "Active",
            TxnState::Committed => "Committed",
            TxnState::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

/// Kind of write requested through the transaction API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Update,
    Delete,
}

/// A consistent view of the store, immutable once captured.
///
/// A committed version is visible under this snapshot iff its commit seq
/// is at or below `as_of` and its writer was not active when the snapshot
/// was taken. The second condition guards the window in which a committer
/// is still stamping its versions.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub as_of: CommitSeq,
    pub active_at_start: HashSet<TxId>,
}

impl Snapshot {
    /// A snapshot that sees every committed version. Used during WAL
    /// replay, where all surviving transactions are known committed.
    pub fn latest() -> Self {
        Snapshot {
            as_of: CommitSeq(u64::MAX),
            active_at_start: HashSet::new(),
        }
    }

    /// Whether a commit at `seq` by `writer` is included in this view.
    pub fn includes(&self, writer: TxId, seq: CommitSeq) -> bool {
        seq <= self.as_of && !self.active_at_start.contains(&writer)
    }
}
