//! Deadlock detection via wait-for graph.
//!
//! A blocked transaction adds edges `waiter → holder` for every holder of
//! the lock it waits on. A cycle means deadlock; the victim is the
//! youngest transaction in the cycle (highest TxId, smallest amount of
//! work thrown away). Detection runs from the newly blocked transaction
//! only, since a fresh cycle must pass through the edge that was just
//! added.

use std::collections::{HashMap, HashSet};

use kestrel_common::types::TxId;
use parking_lot::Mutex;

pub struct WaitForGraph {
    /// Adjacency: waiter → set of holders it waits on.
    edges: Mutex<HashMap<TxId, HashSet<TxId>>>,
}

impl Default for WaitForGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self {
            edges: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `waiter` is blocked on `holder`.
    pub fn add_wait(&self, waiter: TxId, holder: TxId) {
        let mut edges = self.edges.lock();
        edges.entry(waiter).or_default().insert(holder);
    }

    /// Drop `waiter`'s outgoing edges (it acquired the lock or gave up).
    /// Edges pointing at it stay: others may still wait on locks it holds.
    pub fn clear_waits(&self, waiter: TxId) {
        let mut edges = self.edges.lock();
        edges.remove(&waiter);
    }

    /// Remove a finished transaction from both sides of the graph.
    pub fn remove_txn(&self, tx: TxId) {
        let mut edges = self.edges.lock();
        edges.remove(&tx);
        for holders in edges.values_mut() {
            holders.remove(&tx);
        }
    }

    /// Find a cycle reachable from `start`, as the list of transactions on
    /// it. Iterative DFS with an explicit stack; `path` mirrors the stack.
    pub fn cycle_from(&self, start: TxId) -> Option<Vec<TxId>> {
        let edges = self.edges.lock();
        let neighbors = |n: TxId| -> Vec<TxId> {
            edges
                .get(&n)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default()
        };

        let mut visited: HashSet<TxId> = HashSet::new();
        let mut on_path: HashSet<TxId> = HashSet::new();
        let mut path: Vec<TxId> = Vec::new();
        let mut stack: Vec<(TxId, Vec<TxId>, usize)> = Vec::new();

        visited.insert(start);
        on_path.insert(start);
        path.push(start);
        stack.push((start, neighbors(start), 0));

        while !stack.is_empty() {
            let next = {
                let Some((_, ns, idx)) = stack.last_mut() else {
                    break;
                };
                if *idx < ns.len() {
                    let n = ns[*idx];
                    *idx += 1;
                    Some(n)
                } else {
                    None
                }
            };

            match next {
                Some(n) if on_path.contains(&n) => {
                    let pos = path.iter().position(|&t| t == n).unwrap_or(0);
                    return Some(path[pos..].to_vec());
                }
                Some(n) => {
                    if visited.insert(n) {
                        on_path.insert(n);
                        path.push(n);
                        stack.push((n, neighbors(n), 0));
                    }
                }
                None => {
                    if let Some((done, _, _)) = stack.pop() {
                        on_path.remove(&done);
                        path.pop();
                    }
                }
            }
        }
        None
    }

    /// Victim policy: youngest transaction in the cycle (highest TxId).
    pub fn choose_victim(cycle: &[TxId]) -> TxId {
        debug_assert!(!cycle.is_empty(), "choose_victim called with empty cycle");
        cycle
            .iter()
            .max_by_key(|t| t.0)
            .copied()
            .unwrap_or(TxId(0))
    }

    /// Number of edges (for diagnostics).
    pub fn edge_count(&self) -> usize {
        let edges = self.edges.lock();
        edges.values().map(|s| s.len()).sum()
    }
}
