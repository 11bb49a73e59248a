use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use stockguard_core::{OperationId, ResourceKey};

use super::sink::AuditSink;
use crate::alert::{Alert, AlertSink};
use crate::metrics::MetricsCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    Created,
    Validated,
    Approved,
    LockAcquired,
    ConflictDetected,
    ConflictResolved,
    /// Another operation contended for a key this operation holds.
    Contended,
    RetryScheduled,
    Merged,
    OverrideUsed,
    VersionMismatch,
    LockReleased,
    Completed,
    Failed,
    RolledBack,
}

impl AuditEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEventKind::Created => "created",
            AuditEventKind::Validated => "validated",
            AuditEventKind::Approved => "approved",
            AuditEventKind::LockAcquired => "lock_acquired",
            AuditEventKind::ConflictDetected => "conflict_detected",
            AuditEventKind::ConflictResolved => "conflict_resolved",
            AuditEventKind::Contended => "contended",
            AuditEventKind::RetryScheduled => "retry_scheduled",
            AuditEventKind::Merged => "merged",
            AuditEventKind::OverrideUsed => "override_used",
            AuditEventKind::VersionMismatch => "version_mismatch",
            AuditEventKind::LockReleased => "lock_released",
            AuditEventKind::Completed => "completed",
            AuditEventKind::Failed => "failed",
            AuditEventKind::RolledBack => "rolled_back",
        }
    }

    /// `completed` and `failed` close a trail.
    pub fn is_terminal(self) -> bool {
        matches!(self, AuditEventKind::Completed | AuditEventKind::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One entry of an operation's hash-chained audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub sequence: u64,
    pub operation_id: OperationId,
    pub resource_key: ResourceKey,
    pub kind: AuditEventKind,
    pub severity: Severity,
    pub at: DateTime<Utc>,
    pub detail: JsonValue,
    pub prev_hash: String,
    pub hash: String,
}

/// SHA256(sequence || operation_id || kind_len || kind || at_micros || detail_len || detail || prev_hash)
fn compute_hash(
    sequence: u64,
    operation_id: OperationId,
    kind: AuditEventKind,
    at: DateTime<Utc>,
    detail: &JsonValue,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(operation_id.as_uuid().as_bytes());
    let kind = kind.as_str();
    hasher.update((kind.len() as u32).to_le_bytes());
    hasher.update(kind.as_bytes());
    hasher.update(at.timestamp_micros().to_le_bytes());
    let detail = serde_json::to_vec(detail).unwrap_or_default();
    hasher.update((detail.len() as u32).to_le_bytes());
    hasher.update(&detail);
    hasher.update(prev_hash.as_bytes());
    STANDARD.encode(hasher.finalize())
}

fn genesis_hash() -> String {
    STANDARD.encode([0u8; 32])
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("no audit trail for operation {0}")]
    UnknownOperation(OperationId),

    #[error("audit trail of {operation_id} broken at sequence {sequence}: {reason}")]
    Broken {
        operation_id: OperationId,
        sequence: u64,
        reason: &'static str,
    },
}

#[derive(Debug)]
struct Trail {
    events: Vec<AuditEvent>,
    sealed: bool,
}

/// Append-only, per-operation audit trails.
///
/// Trails are sealed by their terminal event; later appends are dropped.
/// Timestamps within a trail never go backwards.
pub struct AuditLedger {
    trails: DashMap<OperationId, Trail>,
    sink: Arc<dyn AuditSink>,
    metrics: Arc<MetricsCollector>,
    alerts: Arc<dyn AlertSink>,
}

impl core::fmt::Debug for AuditLedger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AuditLedger").field("trails", &self.trails.len()).finish()
    }
}

impl AuditLedger {
    pub fn new(sink: Arc<dyn AuditSink>, metrics: Arc<MetricsCollector>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            trails: DashMap::new(),
            sink,
            metrics,
            alerts,
        }
    }

    /// Append to the trail of `operation_id`, opening it if needed.
    ///
    /// Returns `None` when the trail is already sealed.
    pub fn record(
        &self,
        operation_id: OperationId,
        resource_key: &ResourceKey,
        kind: AuditEventKind,
        severity: Severity,
        detail: JsonValue,
    ) -> Option<AuditEvent> {
        let event = {
            let mut trail = self.trails.entry(operation_id).or_insert_with(|| Trail {
                events: Vec::new(),
                sealed: false,
            });
            Self::append_to(&mut trail, operation_id, resource_key, kind, severity, detail)?
        };
        self.forward(&event);
        Some(event)
    }

    /// Append to an existing, unsealed trail only (e.g. noting contention on a
    /// winner that may already have finished).
    pub fn annotate(
        &self,
        operation_id: OperationId,
        resource_key: &ResourceKey,
        kind: AuditEventKind,
        severity: Severity,
        detail: JsonValue,
    ) -> Option<AuditEvent> {
        let event = {
            let mut trail = self.trails.get_mut(&operation_id)?;
            Self::append_to(&mut trail, operation_id, resource_key, kind, severity, detail)?
        };
        self.forward(&event);
        Some(event)
    }

    /// Send an event straight to the sink without touching any trail.
    ///
    /// Used for facts learned after a trail was sealed (compensation).
    pub fn publish_detached(
        &self,
        operation_id: OperationId,
        resource_key: &ResourceKey,
        kind: AuditEventKind,
        severity: Severity,
        detail: JsonValue,
    ) -> AuditEvent {
        let at = Utc::now();
        let prev_hash = self
            .trails
            .get(&operation_id)
            .and_then(|t| t.events.last().map(|e| e.hash.clone()))
            .unwrap_or_else(genesis_hash);
        let event = AuditEvent {
            sequence: 0,
            operation_id,
            resource_key: resource_key.clone(),
            kind,
            severity,
            at,
            hash: compute_hash(0, operation_id, kind, at, &detail, &prev_hash),
            detail,
            prev_hash,
        };
        self.forward(&event);
        event
    }

    fn append_to(
        trail: &mut Trail,
        operation_id: OperationId,
        resource_key: &ResourceKey,
        kind: AuditEventKind,
        severity: Severity,
        detail: JsonValue,
    ) -> Option<AuditEvent> {
        if trail.sealed {
            debug!(operation_id = %operation_id, kind = kind.as_str(), "audit trail sealed; event dropped");
            return None;
        }

        let (sequence, prev_hash, at) = match trail.events.last() {
            Some(last) => (last.sequence + 1, last.hash.clone(), Utc::now().max(last.at)),
            None => (1, genesis_hash(), Utc::now()),
        };
        let event = AuditEvent {
            sequence,
            operation_id,
            resource_key: resource_key.clone(),
            kind,
            severity,
            at,
            hash: compute_hash(sequence, operation_id, kind, at, &detail, &prev_hash),
            detail,
            prev_hash,
        };
        trail.events.push(event.clone());
        trail.sealed = kind.is_terminal();
        Some(event)
    }

    fn forward(&self, event: &AuditEvent) {
        if let Err(e) = self.sink.append(event) {
            self.metrics.record_audit_sink_failure();
            warn!(operation_id = %event.operation_id, error = %e, "audit sink append failed");
            self.alerts.raise(Alert::AuditSinkFailure {
                operation_id: event.operation_id,
                error: e.to_string(),
            });
        }
    }

    pub fn trail(&self, operation_id: OperationId) -> Vec<AuditEvent> {
        self.trails
            .get(&operation_id)
            .map(|t| t.events.clone())
            .unwrap_or_default()
    }

    pub fn is_sealed(&self, operation_id: OperationId) -> bool {
        self.trails.get(&operation_id).is_some_and(|t| t.sealed)
    }

    /// Recompute the hash chain; returns the number of verified events.
    pub fn verify(&self, operation_id: OperationId) -> Result<usize, LedgerError> {
        let trail = self
            .trails
            .get(&operation_id)
            .ok_or(LedgerError::UnknownOperation(operation_id))?;

        let mut prev_hash = genesis_hash();
        let mut prev_at: Option<DateTime<Utc>> = None;
        for (idx, event) in trail.events.iter().enumerate() {
            let broken = |reason| LedgerError::Broken {
                operation_id,
                sequence: event.sequence,
                reason,
            };
            if event.sequence != idx as u64 + 1 {
                return Err(broken("sequence gap"));
            }
            if event.prev_hash != prev_hash {
                return Err(broken("previous hash mismatch"));
            }
            if prev_at.is_some_and(|p| event.at < p) {
                return Err(broken("timestamp went backwards"));
            }
            let expected = compute_hash(
                event.sequence,
                event.operation_id,
                event.kind,
                event.at,
                &event.detail,
                &event.prev_hash,
            );
            if event.hash != expected {
                return Err(broken("hash mismatch"));
            }
            prev_hash = event.hash.clone();
            prev_at = Some(event.at);
        }
        Ok(trail.events.len())
    }

    /// Drop sealed trails whose last event is older than `cutoff`.
    pub fn prune_sealed(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.trails.len();
        self.trails
            .retain(|_, t| !(t.sealed && t.events.last().is_some_and(|e| e.at < cutoff)));
        before.saturating_sub(self.trails.len())
    }

    pub fn len(&self) -> usize {
        self.trails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trails.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn tamper(&self, operation_id: OperationId, sequence: u64, detail: JsonValue) {
        if let Some(mut trail) = self.trails.get_mut(&operation_id) {
            if let Some(e) = trail.events.iter_mut().find(|e| e.sequence == sequence) {
                e.detail = detail;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::InMemoryAlertSink;
    use crate::audit::sink::{AuditSinkError, InMemoryAuditSink};
    use serde_json::json;

    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn append(&self, _event: &AuditEvent) -> Result<(), AuditSinkError> {
            Err(AuditSinkError::Unavailable("disk full".to_string()))
        }
    }

    fn key() -> ResourceKey {
        ResourceKey::new("P1", "S1").unwrap()
    }

    fn ledger_with(sink: Arc<dyn AuditSink>) -> (AuditLedger, Arc<MetricsCollector>, Arc<InMemoryAlertSink>) {
        let metrics = Arc::new(MetricsCollector::new());
        let alerts = Arc::new(InMemoryAlertSink::new());
        (AuditLedger::new(sink, metrics.clone(), alerts.clone()), metrics, alerts)
    }

    #[test]
    fn events_are_chained_and_verifiable() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let (ledger, _, _) = ledger_with(sink.clone());
        let op = OperationId::new();

        ledger.record(op, &key(), AuditEventKind::Created, Severity::Info, json!({}));
        ledger.record(op, &key(), AuditEventKind::Validated, Severity::Info, json!({}));
        ledger.record(op, &key(), AuditEventKind::Completed, Severity::Info, json!({ "version": 4 }));

        let trail = ledger.trail(op);
        assert_eq!(trail.len(), 3);
        assert_eq!(trail[1].prev_hash, trail[0].hash);
        assert_eq!(ledger.verify(op).unwrap(), 3);
        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn terminal_event_seals_the_trail() {
        let (ledger, _, _) = ledger_with(Arc::new(InMemoryAuditSink::new()));
        let op = OperationId::new();

        ledger.record(op, &key(), AuditEventKind::Failed, Severity::Warning, json!({}));
        assert!(ledger.is_sealed(op));
        assert!(ledger.record(op, &key(), AuditEventKind::Contended, Severity::Info, json!({})).is_none());
        assert!(ledger.annotate(op, &key(), AuditEventKind::Contended, Severity::Info, json!({})).is_none());
        assert_eq!(ledger.trail(op).len(), 1);
    }

    #[test]
    fn annotate_does_not_open_trails() {
        let (ledger, _, _) = ledger_with(Arc::new(InMemoryAuditSink::new()));
        let op = OperationId::new();
        assert!(ledger.annotate(op, &key(), AuditEventKind::Contended, Severity::Info, json!({})).is_none());
        assert!(ledger.trail(op).is_empty());
    }

    #[test]
    fn tampering_is_detected() {
        let (ledger, _, _) = ledger_with(Arc::new(InMemoryAuditSink::new()));
        let op = OperationId::new();
        ledger.record(op, &key(), AuditEventKind::Created, Severity::Info, json!({ "delta": 10 }));
        ledger.record(op, &key(), AuditEventKind::Completed, Severity::Info, json!({}));

        ledger.tamper(op, 1, json!({ "delta": 1000 }));
        assert!(matches!(
            ledger.verify(op),
            Err(LedgerError::Broken { sequence: 1, .. })
        ));
    }

    #[test]
    fn sink_failures_are_counted_and_alerted_but_not_fatal() {
        let (ledger, metrics, alerts) = ledger_with(Arc::new(BrokenSink));
        let op = OperationId::new();

        assert!(ledger.record(op, &key(), AuditEventKind::Created, Severity::Info, json!({})).is_some());
        assert_eq!(ledger.trail(op).len(), 1);
        assert_eq!(metrics.snapshot().audit_sink_failures, 1);
        assert!(matches!(alerts.alerts()[0], Alert::AuditSinkFailure { .. }));
    }

    #[test]
    fn prune_removes_only_old_sealed_trails() {
        let (ledger, _, _) = ledger_with(Arc::new(InMemoryAuditSink::new()));
        let done = OperationId::new();
        let running = OperationId::new();
        ledger.record(done, &key(), AuditEventKind::Completed, Severity::Info, json!({}));
        ledger.record(running, &key(), AuditEventKind::Created, Severity::Info, json!({}));

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(ledger.prune_sealed(cutoff), 1);
        assert!(ledger.trail(done).is_empty());
        assert_eq!(ledger.trail(running).len(), 1);
    }
}
