//! Metrics for the cachetable.

use crate::kind::SizeInfo;
use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for one [crate::Cachetable].
#[derive(Default)]
pub(crate) struct Metrics {
    /// Pins satisfied by a resident entry.
    pub hits: Counter,

    /// Pins that had to fetch.
    pub misses: Counter,

    /// Entries fully evicted.
    pub evictions: Counter,

    /// Partial evictions performed (inline or on the worker pool).
    pub partial_evictions: Counter,

    /// Write-backs issued (eviction, checkpoint, close).
    pub flushes: Counter,

    /// Write-backs that failed; the entry was retained dirty.
    pub flush_failures: Counter,

    /// Non-blocking pins that returned the retry signal.
    pub retries: Counter,

    /// Pre-checkpoint snapshots taken before an in-place write.
    pub checkpoint_clones: Counter,

    /// Eviction sweeps started.
    pub eviction_runs: Counter,

    /// Cleaner visits performed.
    pub cleaner_passes: Counter,

    /// Live entries in the table.
    pub entries: Gauge,

    /// Open backing files.
    pub files: Gauge,

    /// Resident bytes, total and per category.
    pub size_total: Gauge,
    pub size_leaf: Gauge,
    pub size_nonleaf: Gauge,
    pub size_rollback: Gauge,
    pub size_cache_pressure: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "hits",
            "Pins satisfied by a resident entry",
            metrics.hits.clone(),
        );
        context.register("misses", "Pins that had to fetch", metrics.misses.clone());
        context.register(
            "evictions",
            "Entries fully evicted",
            metrics.evictions.clone(),
        );
        context.register(
            "partial_evictions",
            "Partial evictions performed",
            metrics.partial_evictions.clone(),
        );
        context.register("flushes", "Write-backs issued", metrics.flushes.clone());
        context.register(
            "flush_failures",
            "Write-backs that failed",
            metrics.flush_failures.clone(),
        );
        context.register(
            "retries",
            "Non-blocking pins that returned the retry signal",
            metrics.retries.clone(),
        );
        context.register(
            "checkpoint_clones",
            "Pre-checkpoint snapshots taken before an in-place write",
            metrics.checkpoint_clones.clone(),
        );
        context.register(
            "eviction_runs",
            "Eviction sweeps started",
            metrics.eviction_runs.clone(),
        );
        context.register(
            "cleaner_passes",
            "Cleaner visits performed",
            metrics.cleaner_passes.clone(),
        );
        context.register("entries", "Live entries in the table", metrics.entries.clone());
        context.register("files", "Open backing files", metrics.files.clone());
        context.register(
            "size_total",
            "Resident bytes tracked by the eviction engine",
            metrics.size_total.clone(),
        );
        context.register(
            "size_leaf",
            "Resident bytes attributed to leaf data",
            metrics.size_leaf.clone(),
        );
        context.register(
            "size_nonleaf",
            "Resident bytes attributed to non-leaf data",
            metrics.size_nonleaf.clone(),
        );
        context.register(
            "size_rollback",
            "Resident bytes attributed to rollback data",
            metrics.size_rollback.clone(),
        );
        context.register(
            "size_cache_pressure",
            "Resident bytes that would benefit from a cleaner pass",
            metrics.size_cache_pressure.clone(),
        );
        metrics
    }

    /// Mirror the engine's size totals into the gauges.
    pub fn record_sizes(&self, totals: &SizeInfo) {
        self.size_total.set(totals.total as i64);
        self.size_leaf.set(totals.leaf as i64);
        self.size_nonleaf.set(totals.nonleaf as i64);
        self.size_rollback.set(totals.rollback as i64);
        self.size_cache_pressure.set(totals.cache_pressure as i64);
    }
}
