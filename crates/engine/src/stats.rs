//! Cache statistics
//!
//! Counters are purely observational: relaxed atomics, approximate under
//! contention, never consulted on a correctness path.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::StatsCollector;

static GLOBAL: Lazy<Arc<CacheStats>> = Lazy::new(|| Arc::new(CacheStats::new()));

/// Atomic operation counters
#[derive(Debug, Default)]
pub struct CacheStats {
    adds: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    ds_writes: AtomicU64,
    ds_failures: AtomicU64,
    client_requests: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance, used when a store is built without its own collector
    pub fn global() -> Arc<CacheStats> {
        Arc::clone(&GLOBAL)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            adds: self.adds.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ds_writes: self.ds_writes.load(Ordering::Relaxed),
            ds_failures: self.ds_failures.load(Ordering::Relaxed),
            client_requests: self.client_requests.load(Ordering::Relaxed),
        }
    }

    /// Read and zero every counter.
    ///
    /// Each counter is exchanged individually, so an increment racing with
    /// the reset lands in exactly one of the two windows.
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            adds: self.adds.swap(0, Ordering::Relaxed),
            updates: self.updates.swap(0, Ordering::Relaxed),
            deletes: self.deletes.swap(0, Ordering::Relaxed),
            hits: self.hits.swap(0, Ordering::Relaxed),
            misses: self.misses.swap(0, Ordering::Relaxed),
            ds_writes: self.ds_writes.swap(0, Ordering::Relaxed),
            ds_failures: self.ds_failures.swap(0, Ordering::Relaxed),
            client_requests: self.client_requests.swap(0, Ordering::Relaxed),
        }
    }
}

impl StatsCollector for CacheStats {
    fn record_add(&self) {
        self.adds.fetch_add(1, Ordering::Relaxed);
    }

    fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_ds_write(&self, success: bool) {
        if success {
            self.ds_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ds_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_client_request(&self) {
        self.client_requests.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub adds: u64,
    pub updates: u64,
    pub deletes: u64,
    pub hits: u64,
    pub misses: u64,
    pub ds_writes: u64,
    pub ds_failures: u64,
    pub client_requests: u64,
}

impl StatsSnapshot {
    /// Hits / (hits + misses)
    pub fn hit_ratio(&self) -> f64 {
        let reads = self.hits + self.misses;
        if reads > 0 {
            self.hits as f64 / reads as f64
        } else {
            0.0
        }
    }

    pub fn writes(&self) -> u64 {
        self.adds + self.updates + self.deletes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counters_and_ratio() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_add();
        stats.record_ds_write(true);
        stats.record_ds_write(false);

        let snap = stats.snapshot();
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.hit_ratio(), 0.75);
        assert_eq!(snap.writes(), 1);
        assert_eq!((snap.ds_writes, snap.ds_failures), (1, 1));
    }

    #[test]
    fn test_snapshot_and_reset_zeroes() {
        let stats = CacheStats::new();
        stats.record_update();
        stats.record_client_request();

        let first = stats.snapshot_and_reset();
        assert_eq!(first.updates, 1);
        assert_eq!(first.client_requests, 1);
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_no_increment_lost_across_resets() {
        let stats = Arc::new(CacheStats::new());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        stats.record_client_request();
                    }
                })
            })
            .collect();

        let mut seen = 0;
        for _ in 0..50 {
            seen += stats.snapshot_and_reset().client_requests;
        }
        for w in writers {
            w.join().unwrap();
        }
        seen += stats.snapshot_and_reset().client_requests;
        assert_eq!(seen, 40_000);
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&CacheStats::global(), &CacheStats::global()));
    }

    #[test]
    fn test_empty_ratio_is_zero() {
        assert_eq!(StatsSnapshot::default().hit_ratio(), 0.0);
    }
}
