//! In-process metrics for migration observability.
//!
//! Counters and gauges are plain atomics readable through a snapshot; an
//! exporter can scrape them, but nothing here depends on one.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that can increase or decrease.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    value: AtomicI64,
}

impl Gauge {
    /// Create a new gauge.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicI64::new(0),
        }
    }

    /// Get the gauge name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Set the gauge to a specific value.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Increment the gauge by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the gauge by 1.
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics for the migration backend and worker on one node.
#[derive(Debug)]
pub struct MigrationMetrics {
    /// Partition work jobs spawned.
    pub work_started: Counter,
    /// Partition work jobs that failed and were retried.
    pub work_retried: Counter,
    /// Partition work jobs that reached the sought state.
    pub work_succeeded: Counter,
    /// Ntps currently managed by the worker.
    pub managed_ntps: Gauge,
    /// Status RPCs fanned out by the coordinator.
    pub status_rpcs_sent: Counter,
    /// Status RPCs that failed at the transport level.
    pub status_rpcs_failed: Counter,
    /// Migrations queued for an advance write.
    pub advances_requested: Counter,
    /// Advance writes acknowledged by the migration table.
    pub advances_written: Counter,
    /// Advance writes rejected by the migration table.
    pub advance_conflicts: Counter,
    /// Whether this node currently holds the coordinator role (0 or 1).
    pub coordinator_active: Gauge,
}

impl MigrationMetrics {
    /// Create new migration metrics.
    pub const fn new() -> Self {
        Self {
            work_started: Counter::new("migration_work_started"),
            work_retried: Counter::new("migration_work_retried"),
            work_succeeded: Counter::new("migration_work_succeeded"),
            managed_ntps: Gauge::new("migration_managed_ntps"),
            status_rpcs_sent: Counter::new("migration_status_rpcs_sent"),
            status_rpcs_failed: Counter::new("migration_status_rpcs_failed"),
            advances_requested: Counter::new("migration_advances_requested"),
            advances_written: Counter::new("migration_advances_written"),
            advance_conflicts: Counter::new("migration_advance_conflicts"),
            coordinator_active: Gauge::new("migration_coordinator_active"),
        }
    }

    /// Capture the current values.
    pub fn snapshot(&self) -> MigrationMetricsSnapshot {
        MigrationMetricsSnapshot {
            work_started: self.work_started.get(),
            work_retried: self.work_retried.get(),
            work_succeeded: self.work_succeeded.get(),
            managed_ntps: self.managed_ntps.get(),
            status_rpcs_sent: self.status_rpcs_sent.get(),
            status_rpcs_failed: self.status_rpcs_failed.get(),
            advances_requested: self.advances_requested.get(),
            advances_written: self.advances_written.get(),
            advance_conflicts: self.advance_conflicts.get(),
            coordinator_active: self.coordinator_active.get() != 0,
        }
    }
}

impl Default for MigrationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of [`MigrationMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationMetricsSnapshot {
    pub work_started: u64,
    pub work_retried: u64,
    pub work_succeeded: u64,
    pub managed_ntps: i64,
    pub status_rpcs_sent: u64,
    pub status_rpcs_failed: u64,
    pub advances_requested: u64,
    pub advances_written: u64,
    pub advance_conflicts: u64,
    pub coordinator_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new("test_counter");
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
        assert_eq!(counter.name(), "test_counter");

        let gauge = Gauge::new("test_gauge");
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
        gauge.set(-3);
        assert_eq!(gauge.get(), -3);
    }

    #[test]
    fn test_snapshot_reflects_updates() {
        let metrics = MigrationMetrics::new();
        metrics.work_started.inc();
        metrics.work_retried.inc_by(2);
        metrics.coordinator_active.set(1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.work_started, 1);
        assert_eq!(snapshot.work_retried, 2);
        assert!(snapshot.coordinator_active);
    }
}
