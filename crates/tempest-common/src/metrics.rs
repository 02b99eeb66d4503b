//! Buffer pool activity metrics
//!
//! One relaxed atomic per event class: cheap enough to bump on the hot
//! acquisition path, read on demand for stats snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing event counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// The events a buffer pool accumulates over its lifetime.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Acquisitions served straight from the page table.
    pub hits: Counter,
    /// Acquisitions that had to fault the page in from disk.
    pub misses: Counter,
    /// Resident pages pushed out to make room.
    pub evictions: Counter,
    /// Dirty pages written back to the backing store.
    pub flushes: Counter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.inc();
        c.inc();
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn test_pool_metrics_start_at_zero() {
        let m = PoolMetrics::default();
        assert_eq!(m.hits.get(), 0);
        assert_eq!(m.misses.get(), 0);
        assert_eq!(m.evictions.get(), 0);
        assert_eq!(m.flushes.get(), 0);
    }

    #[test]
    fn test_pool_metrics_track_independently() {
        let m = PoolMetrics::default();
        m.hits.inc();
        m.misses.inc();
        m.misses.inc();
        assert_eq!(m.hits.get(), 1);
        assert_eq!(m.misses.get(), 2);
        assert_eq!(m.evictions.get(), 0);
    }
}
