//! Query client counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the client counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Reads served from a fresh cached value.
    pub hits: u64,
    /// Reads that needed a fetch (started or joined).
    pub misses: u64,
    /// Fetch operations started.
    pub fetches_started: u64,
    /// Reads that attached to a fetch someone else started.
    pub deduplicated: u64,
    /// Fetch operations that settled with an error.
    pub failures: u64,
    /// Fetcher invocations beyond the first attempt.
    pub retries: u64,
    /// Callbacks delivered by the store.
    pub notifications: u64,
    /// Keys currently holding a value.
    pub entry_count: u64,
}

impl QueryStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) fetches_started: AtomicU64,
    pub(crate) deduplicated: AtomicU64,
    pub(crate) failures: AtomicU64,
    pub(crate) retries: AtomicU64,
}

impl StatCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, notifications: u64, entry_count: u64) -> QueryStats {
        QueryStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches_started: self.fetches_started.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            notifications,
            entry_count,
        }
    }
}
