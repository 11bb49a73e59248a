use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use super::ledger::AuditEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuditSinkError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Durable, append-only destination for audit events.
///
/// Failures never block an operation; they are counted and alerted on.
pub trait AuditSink: Send + Sync {
    fn append(&self, event: &AuditEvent) -> Result<(), AuditSinkError>;
}

impl<S> AuditSink for Arc<S>
where
    S: AuditSink + ?Sized,
{
    fn append(&self, event: &AuditEvent) -> Result<(), AuditSinkError> {
        (**self).append(event)
    }
}

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, event: &AuditEvent) -> Result<(), AuditSinkError> {
        info!(
            target: "audit",
            operation_id = %event.operation_id,
            resource_key = %event.resource_key,
            sequence = event.sequence,
            kind = event.kind.as_str(),
            severity = ?event.severity,
            hash = %event.hash,
            detail = %event.detail,
            "audit event"
        );
        Ok(())
    }
}

/// Collects events in memory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn append(&self, event: &AuditEvent) -> Result<(), AuditSinkError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
