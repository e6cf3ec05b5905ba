//! Version garbage collection.
//!
//! GC operates per-chain with the chain's own lock; it never takes a
//! store-wide lock and runs concurrently with reads and writes. A version
//! is reclaimable only when its delete marker is committed with a seq
//! before the horizon, so no live or future snapshot can still reach it.
//! Uncommitted versions and the newest version of each row are never
//! touched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kestrel_common::shutdown::ShutdownSignal;
use kestrel_common::types::CommitSeq;

use crate::store::VersionStore;

/// GC configuration.
#[derive(Debug, Clone)]
pub struct GcConfig {
    pub enabled: bool,
    /// Interval between sweeps (milliseconds).
    pub interval_ms: u64,
    /// Maximum rows processed per sweep (0 = unlimited).
    pub batch_size: usize,
    /// Chains shorter than this are skipped.
    pub min_chain_length: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            batch_size: 0,
            min_chain_length: 2,
        }
    }
}

/// Result of one sweep over the store.
#[derive(Debug, Clone, Default)]
pub struct GcSweepResult {
    pub chains_inspected: u64,
    pub chains_pruned: u64,
    pub reclaimed_versions: u64,
    /// Horizon used for this sweep.
    pub horizon: CommitSeq,
    pub sweep_duration_us: u64,
    /// Rows skipped by the batch limit or `min_chain_length`.
    pub rows_skipped: u64,
}

/// Cumulative GC statistics (atomic, lock-free).
#[derive(Debug, Default)]
pub struct GcStats {
    pub total_sweeps: AtomicU64,
    pub total_reclaimed_versions: AtomicU64,
    pub total_chains_inspected: AtomicU64,
    pub total_chains_pruned: AtomicU64,
    pub last_horizon: AtomicU64,
    pub last_sweep_duration_us: AtomicU64,
}

impl GcStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sweep(&self, result: &GcSweepResult) {
        self.total_sweeps.fetch_add(1, Ordering::Relaxed);
        self.total_reclaimed_versions
            .fetch_add(result.reclaimed_versions, Ordering::Relaxed);
        self.total_chains_inspected
            .fetch_add(result.chains_inspected, Ordering::Relaxed);
        self.total_chains_pruned
            .fetch_add(result.chains_pruned, Ordering::Relaxed);
        self.last_horizon.store(result.horizon.0, Ordering::Relaxed);
        self.last_sweep_duration_us
            .store(result.sweep_duration_us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            total_sweeps: self.total_sweeps.load(Ordering::Relaxed),
            total_reclaimed_versions: self.total_reclaimed_versions.load(Ordering::Relaxed),
            total_chains_inspected: self.total_chains_inspected.load(Ordering::Relaxed),
            total_chains_pruned: self.total_chains_pruned.load(Ordering::Relaxed),
            last_horizon: CommitSeq(self.last_horizon.load(Ordering::Relaxed)),
            last_sweep_duration_us: self.last_sweep_duration_us.load(Ordering::Relaxed),
        }
    }
}

/// Immutable statistics snapshot for reporting.
#[derive(Debug, Clone)]
pub struct GcStatsSnapshot {
    pub total_sweeps: u64,
    pub total_reclaimed_versions: u64,
    pub total_chains_inspected: u64,
    pub total_chains_pruned: u64,
    pub last_horizon: CommitSeq,
    pub last_sweep_duration_us: u64,
}

/// Compute the GC horizon.
///
/// With active snapshots the horizon is the oldest `as_of` still in use:
/// a version deleted before it is invisible to every live snapshot, and
/// future snapshots only see later seqs. With no active snapshots, any
/// future snapshot starts at or after `current`, so everything deleted at
/// or before `current` is out of reach.
pub fn compute_horizon(min_active_as_of: Option<CommitSeq>, current: CommitSeq) -> CommitSeq {
    match min_active_as_of {
        Some(as_of) => as_of,
        None => CommitSeq(current.0.saturating_add(1)),
    }
}

/// Run one sweep over the store. Per-chain locks only; respects
/// `config.batch_size` and `config.min_chain_length`.
pub fn sweep_store(
    store: &VersionStore,
    horizon: CommitSeq,
    config: &GcConfig,
    stats: &GcStats,
) -> GcSweepResult {
    let start = Instant::now();
    let mut result = GcSweepResult {
        horizon,
        ..Default::default()
    };

    let mut processed = 0u64;
    for entry in store.rows.iter() {
        if config.batch_size > 0 && processed >= config.batch_size as u64 {
            result.rows_skipped += store.rows.len() as u64 - processed;
            break;
        }

        let chain = entry.value();
        if chain.len() < config.min_chain_length {
            result.rows_skipped += 1;
            processed += 1;
            continue;
        }

        result.chains_inspected += 1;
        let pruned = chain.prune(horizon);
        if pruned.reclaimed > 0 {
            result.chains_pruned += 1;
            result.reclaimed_versions += pruned.reclaimed as u64;
        }
        processed += 1;
    }

    result.sweep_duration_us = start.elapsed().as_micros() as u64;
    stats.record_sweep(&result);
    result
}

/// Provides horizon inputs for the background runner. Implemented by the
/// transaction manager; a trait here avoids a circular crate dependency.
pub trait HorizonProvider: Send + Sync {
    /// Minimum `as_of` across active snapshots, `None` if none are live.
    fn min_active_as_of(&self) -> Option<CommitSeq>;

    /// Last published commit seq.
    fn current_seq(&self) -> CommitSeq;
}

/// Background GC runner: periodically computes the horizon and sweeps.
pub struct GcRunner {
    signal: ShutdownSignal,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl GcRunner {
    /// Start the background runner. A spawn failure is returned, not
    /// panicked; the engine keeps working without GC.
    pub fn start(
        store: Arc<VersionStore>,
        provider: Arc<dyn HorizonProvider>,
        config: GcConfig,
        stats: Arc<GcStats>,
    ) -> Result<Self, std::io::Error> {
        let signal = ShutdownSignal::new();
        let signal_clone = signal.clone();
        let interval = Duration::from_millis(config.interval_ms);

        let handle = std::thread::Builder::new()
            .name("kestrel-gc".into())
            .spawn(move || {
                tracing::info!(
                    "GC runner started (interval={}ms, min_chain={})",
                    config.interval_ms,
                    config.min_chain_length,
                );
                while !signal_clone.is_shutdown() {
                    if signal_clone.wait_timeout(interval) {
                        break;
                    }

                    let horizon =
                        compute_horizon(provider.min_active_as_of(), provider.current_seq());
                    if horizon.0 == 0 {
                        continue;
                    }

                    let result = sweep_store(&store, horizon, &config, &stats);
                    if result.reclaimed_versions > 0 {
                        tracing::debug!(
                            "GC sweep: horizon={}, reclaimed={} versions in {}us",
                            result.horizon,
                            result.reclaimed_versions,
                            result.sweep_duration_us,
                        );
                    }
                }
                tracing::info!("GC runner stopped");
            })
            .map_err(|e| {
                tracing::error!(error = %e, "failed to spawn GC thread, engine degraded");
                e
            })?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Signal the runner to stop and wait for it to finish.
    pub fn stop(&mut self) {
        self.signal.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for GcRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
