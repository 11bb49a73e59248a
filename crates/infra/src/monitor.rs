//! Background monitors owned by the coordinator's lifecycle.
//!
//! Two threads: a conflict-rate monitor that alerts operators when a resource
//! class conflicts more often than its policy threshold, and a cleanup loop
//! that forgets finished operations after the retention window. Both stop on
//! [`MonitorHandle::shutdown`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::alert::Alert;
use crate::coordinator::OperationCoordinator;
use crate::metrics::ClassCounts;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub conflict_check_interval: Duration,
    pub cleanup_interval: Duration,
    pub retention: Duration,
    pub stale_after: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            conflict_check_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
            retention: Duration::from_secs(3600),
            stale_after: Duration::from_secs(600),
        }
    }
}

/// Windowed conflict-rate check over the coordinator's cumulative per-class counters.
#[derive(Debug, Default)]
pub struct ConflictRateMonitor {
    last: HashMap<String, ClassCounts>,
}

impl ConflictRateMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare the counters since the previous call against each class
    /// threshold; raises and returns the alerts for breaching classes.
    pub fn check(&mut self, coordinator: &OperationCoordinator) -> Vec<Alert> {
        let mut alerts = Vec::new();

        for (class, now) in coordinator.class_counts() {
            let prev = self.last.insert(class.clone(), now).unwrap_or_default();
            let operations = now.operations.saturating_sub(prev.operations);
            let conflicts = now.conflicts.saturating_sub(prev.conflicts);
            if operations == 0 {
                continue;
            }
            let Ok(policy) = coordinator.policies().resolve(&class) else {
                continue;
            };

            let rate = conflicts as f64 / operations as f64;
            debug!(resource_class = %class, rate, operations, conflicts, "conflict rate");
            if rate > policy.conflict_threshold {
                warn!(
                    resource_class = %class,
                    rate,
                    threshold = policy.conflict_threshold,
                    "conflict rate above threshold"
                );
                let alert = Alert::ConflictRateExceeded {
                    resource_class: class,
                    rate,
                    threshold: policy.conflict_threshold,
                    operations,
                    conflicts,
                };
                coordinator.raise(alert.clone());
                alerts.push(alert);
            }
        }
        alerts
    }
}

/// Handle to the running monitor threads.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stop both monitors and wait for them to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for tx in self.shutdown.drain(..) {
            let _ = tx.send(());
        }
        for join in self.joins.drain(..) {
            if join.join().is_err() {
                warn!("monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct Monitors;

impl Monitors {
    pub fn spawn(coordinator: Arc<OperationCoordinator>, config: MonitorConfig) -> std::io::Result<MonitorHandle> {
        let mut handle = MonitorHandle {
            shutdown: Vec::new(),
            joins: Vec::new(),
        };

        let mut rate = ConflictRateMonitor::new();
        let c = coordinator.clone();
        spawn_periodic(&mut handle, "conflict-rate-monitor", config.conflict_check_interval, move || {
            rate.check(&c);
        })?;

        let (retention, stale_after) = (config.retention, config.stale_after);
        spawn_periodic(&mut handle, "operation-cleanup", config.cleanup_interval, move || {
            coordinator.cleanup(retention, stale_after);
        })?;

        Ok(handle)
    }
}

fn spawn_periodic(
    handle: &mut MonitorHandle,
    name: &'static str,
    interval: Duration,
    mut tick: impl FnMut() + Send + 'static,
) -> std::io::Result<()> {
    let (tx, rx) = mpsc::channel::<()>();
    let join = thread::Builder::new().name(name.to_string()).spawn(move || {
        info!(monitor = name, interval_ms = interval.as_millis() as u64, "monitor started");
        loop {
            match rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => tick(),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(monitor = name, "monitor stopped");
    })?;
    handle.shutdown.push(tx);
    handle.joins.push(join);
    Ok(())
}
