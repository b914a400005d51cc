//! Process-wide counters, created once at start-up and handed to each
//! component.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct Metrics {
    pub running_searches: AtomicI64,
    pub searches_total: AtomicU64,
    pub search_errors: AtomicU64,
    pub archive_cache_hits: AtomicU64,
    pub archive_cache_misses: AtomicU64,
    pub fetches_total: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub fetches_queued: AtomicI64,
    pub evictions: AtomicU64,
    pub disk_usage_bytes: AtomicU64,
    pub zip_cache_hits: AtomicU64,
    pub zip_cache_misses: AtomicU64,
    pub structural_runs: AtomicU64,
    hybrid_outcomes: Mutex<BTreeMap<&'static str, u64>>,
}

pub type SharedMetrics = Arc<Metrics>;

/// Serializable point-in-time view of [`Metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub running_searches: i64,
    pub searches_total: u64,
    pub search_errors: u64,
    pub archive_cache_hits: u64,
    pub archive_cache_misses: u64,
    pub fetches_total: u64,
    pub fetch_failures: u64,
    pub fetches_queued: i64,
    pub evictions: u64,
    pub disk_usage_bytes: u64,
    pub disk_usage: String,
    pub zip_cache_hits: u64,
    pub zip_cache_misses: u64,
    pub structural_runs: u64,
    pub hybrid_outcomes: BTreeMap<String, u64>,
}

impl Metrics {
    pub fn new() -> SharedMetrics {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one hybrid search by its final state.
    pub fn record_hybrid(&self, state: &'static str) {
        let mut outcomes = self
            .hybrid_outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *outcomes.entry(state).or_default() += 1;
    }

    /// Track a running search until the guard drops.
    pub fn search_started(self: &Arc<Self>) -> RunningSearch {
        self.running_searches.fetch_add(1, Ordering::Relaxed);
        Metrics::incr(&self.searches_total);
        RunningSearch {
            metrics: self.clone(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let disk_usage_bytes = self.disk_usage_bytes.load(Ordering::Relaxed);
        MetricsSnapshot {
            running_searches: self.running_searches.load(Ordering::Relaxed),
            searches_total: self.searches_total.load(Ordering::Relaxed),
            search_errors: self.search_errors.load(Ordering::Relaxed),
            archive_cache_hits: self.archive_cache_hits.load(Ordering::Relaxed),
            archive_cache_misses: self.archive_cache_misses.load(Ordering::Relaxed),
            fetches_total: self.fetches_total.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            fetches_queued: self.fetches_queued.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            disk_usage_bytes,
            disk_usage: crate::utils::format_bytes(disk_usage_bytes),
            zip_cache_hits: self.zip_cache_hits.load(Ordering::Relaxed),
            zip_cache_misses: self.zip_cache_misses.load(Ordering::Relaxed),
            structural_runs: self.structural_runs.load(Ordering::Relaxed),
            hybrid_outcomes: self
                .hybrid_outcomes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }
}

/// Decrements the running-search gauge on drop.
pub struct RunningSearch {
    metrics: SharedMetrics,
}

impl Drop for RunningSearch {
    fn drop(&mut self) {
        self.metrics.running_searches.fetch_sub(1, Ordering::Relaxed);
    }
}
