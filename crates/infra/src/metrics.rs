//! Operation counters and timings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Default)]
struct Average {
    total_micros: AtomicU64,
    count: AtomicU64,
}

impl Average {
    fn record(&self, d: Duration) {
        self.total_micros
            .fetch_add(u64::try_from(d.as_micros()).unwrap_or(u64::MAX), Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn millis(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_micros.load(Ordering::Relaxed) as f64 / count as f64 / 1_000.0
    }
}

/// Per-resource-class counters feeding the conflict-rate monitor.
#[derive(Debug, Default)]
struct ClassCounters {
    operations: AtomicU64,
    conflicts: AtomicU64,
}

/// Cumulative `(operations, conflicts)` for one resource class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    pub operations: u64,
    pub conflicts: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub operations_started: u64,
    pub operations_completed: u64,
    pub operations_failed: u64,
    pub failures_by_kind: Vec<(String, u64)>,
    pub conflicts: u64,
    pub conflicts_by_strategy: Vec<(String, u64)>,
    pub retries: u64,
    pub overrides: u64,
    pub lock_timeouts: u64,
    pub audit_sink_failures: u64,
    pub avg_lock_hold_ms: f64,
    pub avg_operation_ms: f64,
}

impl MetricsSnapshot {
    /// Conflicts per started operation.
    pub fn conflict_rate(&self) -> f64 {
        if self.operations_started == 0 {
            0.0
        } else {
            self.conflicts as f64 / self.operations_started as f64
        }
    }
}

/// Lock-free counters shared by every in-flight operation.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    failures_by_kind: DashMap<&'static str, u64>,
    conflicts: AtomicU64,
    conflicts_by_strategy: DashMap<&'static str, u64>,
    retries: AtomicU64,
    overrides: AtomicU64,
    lock_timeouts: AtomicU64,
    audit_sink_failures: AtomicU64,
    lock_hold: Average,
    operation: Average,
    classes: DashMap<String, ClassCounters>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&self, resource_class: &str) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.class(resource_class).operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, elapsed: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.operation.record(elapsed);
    }

    pub fn record_failed(&self, kind: &'static str, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self.failures_by_kind.entry(kind).or_insert(0) += 1;
        self.operation.record(elapsed);
    }

    pub fn record_conflict(&self, resource_class: &str, strategy: &'static str) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        *self.conflicts_by_strategy.entry(strategy).or_insert(0) += 1;
        self.class(resource_class).conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_override(&self) {
        self.overrides.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audit_sink_failure(&self) {
        self.audit_sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_hold(&self, held: Duration) {
        self.lock_hold.record(held);
    }

    fn class(&self, resource_class: &str) -> dashmap::mapref::one::Ref<'_, String, ClassCounters> {
        if let Some(c) = self.classes.get(resource_class) {
            return c;
        }
        self.classes
            .entry(resource_class.to_string())
            .or_default()
            .downgrade()
    }

    /// Cumulative per-class counts.
    pub fn class_counts(&self) -> Vec<(String, ClassCounts)> {
        self.classes
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    ClassCounts {
                        operations: e.operations.load(Ordering::Relaxed),
                        conflicts: e.conflicts.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut failures_by_kind: Vec<(String, u64)> = self
            .failures_by_kind
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect();
        failures_by_kind.sort();
        let mut conflicts_by_strategy: Vec<(String, u64)> = self
            .conflicts_by_strategy
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect();
        conflicts_by_strategy.sort();

        MetricsSnapshot {
            operations_started: self.started.load(Ordering::Relaxed),
            operations_completed: self.completed.load(Ordering::Relaxed),
            operations_failed: self.failed.load(Ordering::Relaxed),
            failures_by_kind,
            conflicts: self.conflicts.load(Ordering::Relaxed),
            conflicts_by_strategy,
            retries: self.retries.load(Ordering::Relaxed),
            overrides: self.overrides.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            audit_sink_failures: self.audit_sink_failures.load(Ordering::Relaxed),
            avg_lock_hold_ms: self.lock_hold.millis(),
            avg_operation_ms: self.operation.millis(),
        }
    }
}
