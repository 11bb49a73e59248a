//! Operator alerting for threshold breaches. Purely observational.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use stockguard_core::{OperationId, ResourceKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum Alert {
    /// A resource class saw more conflicts per operation than its policy allows.
    ConflictRateExceeded {
        resource_class: String,
        rate: f64,
        threshold: f64,
        operations: u64,
        conflicts: u64,
    },
    /// An operation gave up waiting for a key.
    LockTimeout {
        resource_key: ResourceKey,
        operation_id: OperationId,
        waited_ms: u64,
    },
    /// The durable audit sink rejected an event.
    AuditSinkFailure { operation_id: OperationId, error: String },
}

pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

impl<S> AlertSink for Arc<S>
where
    S: AlertSink + ?Sized,
{
    fn raise(&self, alert: Alert) {
        (**self).raise(alert)
    }
}

/// Logs alerts at `warn` on the `alert` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: Alert) {
        match serde_json::to_string(&alert) {
            Ok(json) => warn!(target: "alert", alert = %json, "operator alert"),
            Err(_) => warn!(target: "alert", alert = ?alert, "operator alert"),
        }
    }
}

/// Keeps alerts in memory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for InMemoryAlertSink {
    fn raise(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}
