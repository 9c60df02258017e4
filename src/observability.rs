use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Merge engine counters. Owned by the pull service and shared by handle.
#[derive(Debug, Default)]
pub struct MergeMetrics {
    pub attempts: AtomicU64,
    pub merged: AtomicU64,
    pub conflicts: AtomicU64,
    pub push_out_of_date: AtomicU64,
    pub push_rejected: AtomicU64,
    pub failures: AtomicU64,
    pub lfs_pointers_migrated: AtomicU64,
    pub auto_merges_queued: AtomicU64,
}

impl MergeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merged(&self) {
        self.merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_push_out_of_date(&self) {
        self.push_out_of_date.fetch_add(1, Ordering::Relaxed);
        warn!("Push rejected as out of date");
    }

    pub fn record_push_rejected(&self) {
        self.push_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lfs_pointers(&self, count: u64) {
        self.lfs_pointers_migrated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_auto_merge_queued(&self) {
        self.auto_merges_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> MergeStats {
        MergeStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            push_out_of_date: self.push_out_of_date.load(Ordering::Relaxed),
            push_rejected: self.push_rejected.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            lfs_pointers_migrated: self.lfs_pointers_migrated.load(Ordering::Relaxed),
            auto_merges_queued: self.auto_merges_queued.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Merge metrics: attempts={}, merged={}, conflicts={}, out_of_date={}, rejected={}, failures={}, lfs_pointers={}, auto_queued={}",
            stats.attempts,
            stats.merged,
            stats.conflicts,
            stats.push_out_of_date,
            stats.push_rejected,
            stats.failures,
            stats.lfs_pointers_migrated,
            stats.auto_merges_queued
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MergeStats {
    pub attempts: u64,
    pub merged: u64,
    pub conflicts: u64,
    pub push_out_of_date: u64,
    pub push_rejected: u64,
    pub failures: u64,
    pub lfs_pointers_migrated: u64,
    pub auto_merges_queued: u64,
}

/// Time an operation and log its duration
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = MergeMetrics::new();
        metrics.record_attempt();
        metrics.record_attempt();
        metrics.record_merged();
        metrics.record_lfs_pointers(3);

        let stats = metrics.get_stats();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.merged, 1);
        assert_eq!(stats.lfs_pointers_migrated, 3);
        assert_eq!(stats.conflicts, 0);
    }
}
