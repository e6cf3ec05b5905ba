//! Row-level lock manager.
//!
//! One mutex guards the whole lock table; blocked acquirers sleep on a
//! single condvar and re-evaluate on every wakeup. Waiters queue FIFO per
//! row and are granted in queue order among compatible requests. An
//! upgrade (Shared held, Exclusive wanted) queues at the front: it can
//! never yield to a later Exclusive waiter, which by FIFO would wait on
//! the upgrader's own Shared hold forever.
//!
//! Deadlock handling: a transaction that blocks adds wait-for edges to the
//! current holders and runs cycle detection from itself. The youngest
//! transaction in a detected cycle is doomed; its `acquire` returns
//! `DeadlockDetected` and the caller is expected to abort it.

use std::collections::{HashMap, VecDeque};

use kestrel_common::error::TxnError;
use kestrel_common::types::{RowId, TxId};
use parking_lot::{Condvar, Mutex};

use crate::deadlock::WaitForGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    tx: TxId,
    mode: LockMode,
}

#[derive(Default)]
struct RowLockState {
    holders: Vec<(TxId, LockMode)>,
    waiters: VecDeque<Waiter>,
}

impl RowLockState {
    fn held_by(&self, tx: TxId) -> Option<LockMode> {
        self.holders.iter().find(|h| h.0 == tx).map(|h| h.1)
    }

    /// Would granting `mode` to `tx` conflict with the current holders?
    /// The requester's own holds never conflict with itself.
    fn compatible(holders: &[(TxId, LockMode)], tx: TxId, mode: LockMode) -> bool {
        match mode {
            LockMode::Exclusive => holders.iter().all(|h| h.0 == tx),
            LockMode::Shared => holders.iter().all(|h| h.0 == tx || h.1 == LockMode::Shared),
        }
    }

    /// FIFO grant check: simulate granting waiters from the front of the
    /// queue and report whether `tx` lands in the granted prefix.
    fn in_granted_prefix(&self, tx: TxId) -> bool {
        let mut sim = self.holders.clone();
        for w in &self.waiters {
            let ok = Self::compatible(&sim, w.tx, w.mode);
            if w.tx == tx {
                return ok;
            }
            if !ok {
                return false;
            }
            sim.push((w.tx, w.mode));
        }
        false
    }

    fn unqueue(&mut self, tx: TxId) {
        self.waiters.retain(|w| w.tx != tx);
    }
}

#[derive(Debug, Clone, Copy)]
enum Doom {
    Deadlock,
    Cancelled,
}

#[derive(Default)]
struct LockTable {
    rows: HashMap<RowId, RowLockState>,
    /// Transactions flagged for failure while blocked. Checked by the
    /// owner on wakeup; the flag carries why.
    doomed: HashMap<TxId, Doom>,
}

pub struct LockManager {
    table: Mutex<LockTable>,
    wakeup: Condvar,
    graph: WaitForGraph,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            wakeup: Condvar::new(),
            graph: WaitForGraph::new(),
        }
    }

    /// Acquire `mode` on `row` for `tx`, blocking until granted.
    ///
    /// Errors: `DeadlockDetected` if `tx` is chosen as a deadlock victim,
    /// `Aborted` if `tx` was cancelled while blocked. Either way `tx` has
    /// been unlinked from the wait queue; locks it already holds are
    /// untouched and released by the caller's abort.
    pub fn acquire(&self, tx: TxId, row: RowId, mode: LockMode) -> Result<(), TxnError> {
        let mut table = self.table.lock();
        loop {
            if let Some(doom) = table.doomed.remove(&tx) {
                Self::unlink_waiter(&mut table, tx);
                self.graph.clear_waits(tx);
                self.wakeup.notify_all();
                return Err(match doom {
                    Doom::Deadlock => TxnError::DeadlockDetected(tx),
                    Doom::Cancelled => TxnError::Aborted(tx),
                });
            }

            let granted = {
                let state = table.rows.entry(row).or_default();
                match state.held_by(tx) {
                    // Re-entrant: already hold an equal or stronger mode.
                    Some(held) if held == LockMode::Exclusive || mode == LockMode::Shared => true,
                    // Upgrade: grant once no one else holds the row.
                    Some(_) => {
                        if state.holders.iter().all(|h| h.0 == tx) {
                            for h in state.holders.iter_mut() {
                                h.1 = LockMode::Exclusive;
                            }
                            state.unqueue(tx);
                            true
                        } else {
                            if !state.waiters.iter().any(|w| w.tx == tx) {
                                state.waiters.push_front(Waiter { tx, mode });
                            }
                            false
                        }
                    }
                    None => {
                        if !state.waiters.iter().any(|w| w.tx == tx) {
                            state.waiters.push_back(Waiter { tx, mode });
                        }
                        if state.in_granted_prefix(tx) {
                            state.unqueue(tx);
                            state.holders.push((tx, mode));
                            true
                        } else {
                            false
                        }
                    }
                }
            };

            if granted {
                self.graph.clear_waits(tx);
                // A granted Shared may unblock compatible waiters behind it.
                self.wakeup.notify_all();
                return Ok(());
            }

            // Blocked: refresh wait edges to the current holders and look
            // for a cycle through us.
            let holders: Vec<TxId> = table
                .rows
                .get(&row)
                .map(|s| {
                    s.holders
                        .iter()
                        .map(|h| h.0)
                        .filter(|h| *h != tx)
                        .collect()
                })
                .unwrap_or_default();
            self.graph.clear_waits(tx);
            for h in &holders {
                self.graph.add_wait(tx, *h);
            }

            if let Some(cycle) = self.graph.cycle_from(tx) {
                let victim = WaitForGraph::choose_victim(&cycle);
                tracing::warn!("deadlock cycle {:?}, victim {}", cycle, victim);
                if victim == tx {
                    Self::unlink_waiter(&mut table, tx);
                    self.graph.clear_waits(tx);
                    self.wakeup.notify_all();
                    return Err(TxnError::DeadlockDetected(tx));
                }
                table.doomed.insert(victim, Doom::Deadlock);
                self.wakeup.notify_all();
            }

            self.wakeup.wait(&mut table);
        }
    }

    /// Cancel a transaction blocked in `acquire` from another thread. Its
    /// `acquire` returns `Aborted` after the waiter leaves the queue; held
    /// locks stay until the owner aborts. No-op if `tx` is not blocked.
    pub fn cancel(&self, tx: TxId) {
        let mut table = self.table.lock();
        let waiting = table
            .rows
            .values()
            .any(|s| s.waiters.iter().any(|w| w.tx == tx));
        if waiting {
            table.doomed.insert(tx, Doom::Cancelled);
            self.wakeup.notify_all();
        }
    }

    /// Release everything `tx` holds or waits for and wake the queue.
    pub fn release_all(&self, tx: TxId) {
        let mut table = self.table.lock();
        table.rows.retain(|_, state| {
            state.holders.retain(|h| h.0 != tx);
            state.unqueue(tx);
            !(state.holders.is_empty() && state.waiters.is_empty())
        });
        table.doomed.remove(&tx);
        self.graph.remove_txn(tx);
        self.wakeup.notify_all();
    }

    fn unlink_waiter(table: &mut LockTable, tx: TxId) {
        for state in table.rows.values_mut() {
            state.unqueue(tx);
        }
    }

    /// Current holders of `row` (diagnostics and tests).
    pub fn holders_of(&self, row: RowId) -> Vec<(TxId, LockMode)> {
        let table = self.table.lock();
        table
            .rows
            .get(&row)
            .map(|s| s.holders.clone())
            .unwrap_or_default()
    }

    /// Queued waiter count for `row`.
    pub fn waiter_count(&self, row: RowId) -> usize {
        let table = self.table.lock();
        table.rows.get(&row).map(|s| s.waiters.len()).unwrap_or(0)
    }
}
