//! Engine-wide statistics counters.
//!
//! All counters are relaxed atomics updated from hot paths without locks.
//! Memory gauges saturate at zero rather than underflowing.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Saturating non-negative byte gauge shared between owners.
///
/// Decrements below zero clamp at zero; ownership-transfer arithmetic in
/// the checkpoint code relies on never observing an underflowed value.
#[derive(Debug, Default)]
pub struct NonNegativeGauge(AtomicUsize);

impl NonNegativeGauge {
    /// Create a gauge starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `bytes` to the gauge.
    pub fn add(&self, bytes: usize) {
        self.0.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Subtract `bytes`, clamping at zero.
    pub fn sub(&self, bytes: usize) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current value.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Statistics for one bucket engine instance.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Estimated total memory used by the bucket
    pub mem_used: NonNegativeGauge,
    /// Low watermark; loading below this keeps values resident
    pub mem_low_wat: AtomicUsize,
    /// High watermark
    pub mem_high_wat: AtomicUsize,
    /// Bucket quota in bytes
    pub max_size: AtomicUsize,

    /// Keys warmed up (metadata loaded)
    pub warmed_up_keys: AtomicU64,
    /// Values warmed up (document bodies loaded)
    pub warmed_up_values: AtomicU64,
    /// Prepared SyncWrites warmed up
    pub warmed_up_prepares: AtomicU64,
    /// Items visited while loading prepares
    pub warmup_items_visited_loading_prepares: AtomicU64,
    /// Duplicates encountered during warmup (in-memory value won)
    pub warm_dups: AtomicU64,
    /// Out-of-memory events during warmup data load
    pub warm_oom: AtomicU64,

    /// Items expelled from checkpoints since startup
    pub items_expelled_from_checkpoints: AtomicU64,
    /// Cursors dropped by memory recovery since startup
    pub cursors_dropped: AtomicU64,
    /// Checkpoints removed since startup
    pub checkpoints_removed: AtomicU64,

    /// Set once the engine is shutting down
    pub is_shutdown: std::sync::atomic::AtomicBool,
}

impl EngineStats {
    /// Create a stats instance with the given quota and watermarks.
    pub fn with_quota(max_size: usize, low_wat: usize, high_wat: usize) -> Self {
        let stats = Self::default();
        stats.max_size.store(max_size, Ordering::Relaxed);
        stats.mem_low_wat.store(low_wat, Ordering::Relaxed);
        stats.mem_high_wat.store(high_wat, Ordering::Relaxed);
        stats
    }

    /// Estimated total memory used.
    pub fn estimated_total_memory_used(&self) -> usize {
        self.mem_used.get()
    }

    /// Record a warmup OOM event; returns the updated count.
    pub fn record_warmup_oom(&self) -> u64 {
        self.warm_oom.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Check whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    /// Point-in-time view of the warmup counters, for reporting.
    pub fn warmup_snapshot(&self) -> WarmupStatsSnapshot {
        WarmupStatsSnapshot {
            warmed_up_keys: self.warmed_up_keys.load(Ordering::Relaxed),
            warmed_up_values: self.warmed_up_values.load(Ordering::Relaxed),
            warmed_up_prepares: self.warmed_up_prepares.load(Ordering::Relaxed),
            warm_dups: self.warm_dups.load(Ordering::Relaxed),
            warm_oom: self.warm_oom.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time warmup counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupStatsSnapshot {
    /// Keys warmed up
    pub warmed_up_keys: u64,
    /// Values warmed up
    pub warmed_up_values: u64,
    /// Prepares warmed up
    pub warmed_up_prepares: u64,
    /// Duplicates skipped
    pub warm_dups: u64,
    /// OOM events
    pub warm_oom: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_add_sub() {
        let gauge = NonNegativeGauge::new();
        gauge.add(100);
        gauge.sub(40);
        assert_eq!(gauge.get(), 60);
    }

    #[test]
    fn test_gauge_never_underflows() {
        let gauge = NonNegativeGauge::new();
        gauge.add(10);
        gauge.sub(25);
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_with_quota() {
        let stats = EngineStats::with_quota(1000, 600, 850);
        assert_eq!(stats.max_size.load(Ordering::Relaxed), 1000);
        assert_eq!(stats.mem_low_wat.load(Ordering::Relaxed), 600);
        assert_eq!(stats.mem_high_wat.load(Ordering::Relaxed), 850);
    }

    #[test]
    fn test_record_warmup_oom() {
        let stats = EngineStats::default();
        assert_eq!(stats.record_warmup_oom(), 1);
        assert_eq!(stats.record_warmup_oom(), 2);
        assert_eq!(stats.warmup_snapshot().warm_oom, 2);
    }

    #[test]
    fn test_warmup_snapshot() {
        let stats = EngineStats::default();
        stats.warmed_up_keys.fetch_add(5, Ordering::Relaxed);
        stats.warmed_up_values.fetch_add(3, Ordering::Relaxed);
        let snap = stats.warmup_snapshot();
        assert_eq!(snap.warmed_up_keys, 5);
        assert_eq!(snap.warmed_up_values, 3);
        assert_eq!(snap.warm_dups, 0);
    }
}
