//! Store activity counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time snapshot of store activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Read requests sent to the I/O worker.
    pub backend_reads: u64,
    /// Write requests sent to the I/O worker.
    pub backend_writes: u64,
    /// Reads answered from the cache.
    pub cache_hits: u64,
    /// Reads that had to go to the backend.
    pub cache_misses: u64,
    /// Backend requests that completed with a failure.
    pub failures: u64,
    /// Requests waiting in the worker queue.
    pub queue_depth: usize,
    /// Documents currently cached.
    pub cached_documents: usize,
    /// Keys with a persisted document.
    pub persisted_keys: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    backend_reads: AtomicU64,
    backend_writes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    failures: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_read(&self) {
        self.backend_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.backend_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter values; the gauge fields are left for the caller to fill.
    pub(crate) fn snapshot(&self) -> StoreStats {
        StoreStats {
            backend_reads: self.backend_reads.load(Ordering::Relaxed),
            backend_writes: self.backend_writes.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            ..StoreStats::default()
        }
    }
}
