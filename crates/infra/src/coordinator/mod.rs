//! Operation coordination service.
//!
//! `OperationCoordinator` drives one mutation request through its lifecycle:
//!
//! ```text
//! execute(class, key, kind, delta, options)
//!   ↓
//! 1. Resolve policy, read current record           (pending)
//!   ↓
//! 2. Business-rule validation                      (validated)
//!   ↓
//! 3. Approval gate                                 (approved)
//!   ↓
//! 4. Acquire the key lock, resolving contention    (locked)
//!   ↓
//! 5. Versioned write                               (executing)
//!   ↓        stale version → conflict resolution → back to 4
//! 6. Sign, release lock, audit                     (completed)
//! ```
//!
//! ## Guarantees
//!
//! - The storage compare-and-swap always runs; the in-process lock only cuts
//!   wasted work under contention.
//! - The lock is released on every exit path (the guard releases on drop,
//!   including during unwinding).
//! - Every operation's audit trail ends with exactly one `completed` or
//!   `failed` event, and every exit updates the metrics.
//!
//! Collaborators (record store, approval workflow, distributed lock, audit and
//! alert sinks) are injected as trait objects through
//! [`OperationCoordinatorBuilder`].

mod error;
mod options;

pub use error::{ErrorClass, ExecuteError, OperationError};
pub use options::ExecuteOptions;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, error, info, info_span, warn};

use stockguard_core::{ConflictId, OperationId, ResourceKey, VersionedRecord};
use stockguard_inventory::{
    BusinessRuleValidator, ConflictCause, ConflictRecord, ConflictResolution, ConflictResolver, Operation,
    OperationKind, OperationStatus, Policy, PolicyRegistry, Resolution, merge_quantity,
};

use crate::alert::{Alert, AlertSink, TracingAlertSink};
use crate::approval::{ApprovalGate, ApprovalGrant, ApprovalWorkflow, AutoApprove, GateOutcome};
use crate::audit::{
    AuditEvent, AuditEventKind, AuditLedger, AuditSink, LedgerError, OperationSigner, Severity, TracingAuditSink,
};
use crate::config::CoordinatorConfig;
use crate::context::OperationContext;
use crate::lock::{Acquire, DistributedLock, LockCoordinator, LockError, LockGuard, coordinator::DEFAULT_LEASE_TTL};
use crate::metrics::{ClassCounts, MetricsCollector, MetricsSnapshot};
use crate::record_store::{RecordStore, RecordStoreError};

const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_APPROVAL_POLL: Duration = Duration::from_millis(50);

/// What to do after a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    /// Try the lock again without waiting.
    Reacquire,
    /// Wait for the current holder, up to the policy lock timeout.
    Wait,
    /// Join the current holders.
    Override,
}

/// Result of a [`OperationCoordinator::cleanup`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub operations_removed: usize,
    pub trails_pruned: usize,
    pub conflicts_removed: usize,
    /// Non-terminal operations older than the stale threshold.
    pub stale: Vec<OperationId>,
}

/// Builder for [`OperationCoordinator`]. Unset collaborators default to
/// auto-approval, single-instance locking and tracing sinks.
pub struct OperationCoordinatorBuilder {
    policies: PolicyRegistry,
    store: Arc<dyn RecordStore>,
    signer: OperationSigner,
    approvals: Arc<dyn ApprovalWorkflow>,
    approval_timeout: Duration,
    approval_poll_interval: Duration,
    distributed: Option<Arc<dyn DistributedLock>>,
    lease_ttl: Duration,
    audit_sink: Arc<dyn AuditSink>,
    alert_sink: Arc<dyn AlertSink>,
}

impl OperationCoordinatorBuilder {
    pub fn approval_workflow(mut self, workflow: Arc<dyn ApprovalWorkflow>) -> Self {
        self.approvals = workflow;
        self
    }

    pub fn approval_timeout(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.approval_timeout = timeout;
        self.approval_poll_interval = poll_interval;
        self
    }

    pub fn distributed_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.distributed = Some(lock);
        self
    }

    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = sink;
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = sink;
        self
    }

    /// Apply approval and lease timings from process configuration.
    pub fn with_config(self, config: &CoordinatorConfig) -> Self {
        self.approval_timeout(config.approval_timeout, config.approval_poll_interval)
            .lease_ttl(config.lease_ttl)
    }

    pub fn build(self) -> OperationCoordinator {
        let metrics = Arc::new(MetricsCollector::new());
        let locks = match self.distributed {
            Some(lock) => LockCoordinator::with_distributed(lock, self.lease_ttl),
            None => LockCoordinator::new(),
        };
        OperationCoordinator {
            policies: self.policies,
            store: self.store,
            locks,
            gate: ApprovalGate::new(self.approvals, self.approval_timeout, self.approval_poll_interval),
            validator: BusinessRuleValidator::new(),
            resolver: ConflictResolver::new(),
            ledger: AuditLedger::new(self.audit_sink, metrics.clone(), self.alert_sink.clone()),
            signer: self.signer,
            metrics,
            alerts: self.alert_sink,
            operations: DashMap::new(),
            conflicts: DashMap::new(),
            compensating: DashSet::new(),
        }
    }
}

/// Coordinates concurrent mutations of versioned inventory records.
///
/// One instance serves any number of threads; unrelated keys never contend.
pub struct OperationCoordinator {
    policies: PolicyRegistry,
    store: Arc<dyn RecordStore>,
    pub(crate) locks: LockCoordinator,
    gate: ApprovalGate,
    validator: BusinessRuleValidator,
    resolver: ConflictResolver,
    ledger: AuditLedger,
    signer: OperationSigner,
    metrics: Arc<MetricsCollector>,
    alerts: Arc<dyn AlertSink>,
    operations: DashMap<OperationId, Operation>,
    conflicts: DashMap<ConflictId, ConflictRecord>,
    compensating: DashSet<OperationId>,
}

impl core::fmt::Debug for OperationCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OperationCoordinator")
            .field("policies", &self.policies.len())
            .field("locks", &self.locks)
            .field("operations", &self.operations.len())
            .field("conflicts", &self.conflicts.len())
            .finish()
    }
}

impl OperationCoordinator {
    pub fn builder(
        policies: PolicyRegistry,
        store: Arc<dyn RecordStore>,
        signer: OperationSigner,
    ) -> OperationCoordinatorBuilder {
        OperationCoordinatorBuilder {
            policies,
            store,
            signer,
            approvals: Arc::new(AutoApprove),
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            approval_poll_interval: DEFAULT_APPROVAL_POLL,
            distributed: None,
            lease_ttl: DEFAULT_LEASE_TTL,
            audit_sink: Arc::new(TracingAuditSink),
            alert_sink: Arc::new(TracingAlertSink),
        }
    }

    /// Apply `kind`/`requested_delta` to the record at `resource_key` under
    /// the policy of `resource_class`.
    ///
    /// Returns the id of the committed operation. On failure the id is carried
    /// in [`ExecuteError`] so the operation can still be inspected.
    pub fn execute(
        &self,
        resource_class: &str,
        resource_key: ResourceKey,
        kind: OperationKind,
        requested_delta: i64,
        options: ExecuteOptions,
    ) -> Result<OperationId, ExecuteError> {
        self.run(resource_class, resource_key, kind, requested_delta, &options, None)
    }

    /// Undo a completed operation by executing its inverse.
    ///
    /// On success the original moves to `rolled_back`. Precondition failures
    /// are reported against the original operation's id.
    pub fn compensate(&self, operation_id: OperationId, options: ExecuteOptions) -> Result<OperationId, ExecuteError> {
        let reject = |error| ExecuteError { operation_id, error };

        let original = self
            .operation(operation_id)
            .ok_or_else(|| reject(OperationError::UnknownOperation(operation_id)))?;
        let invalid = || {
            reject(OperationError::InvalidState {
                operation_id,
                status: original.status(),
            })
        };
        if original.status() != OperationStatus::Completed {
            return Err(invalid());
        }
        let (kind, delta) = original
            .kind()
            .compensation(original.requested_delta())
            .map_err(|violation| reject(violation.into()))?;
        // One compensation at a time per operation.
        if !self.compensating.insert(operation_id) {
            return Err(invalid());
        }

        let outcome = self.run(
            original.resource_class(),
            original.resource_key().clone(),
            kind,
            delta,
            &options,
            Some(operation_id),
        );
        if let Ok(compensating_id) = &outcome {
            self.mark_rolled_back(&original, *compensating_id);
        }
        self.compensating.remove(&operation_id);
        outcome
    }

    pub fn operation(&self, operation_id: OperationId) -> Option<Operation> {
        self.operations.get(&operation_id).map(|o| o.value().clone())
    }

    pub fn audit_trail(&self, operation_id: OperationId) -> Vec<AuditEvent> {
        self.ledger.trail(operation_id)
    }

    /// Recompute the hash chain of an operation's audit trail.
    pub fn verify_audit_trail(&self, operation_id: OperationId) -> Result<usize, LedgerError> {
        self.ledger.verify(operation_id)
    }

    /// Check the signature of a completed operation.
    pub fn verify_signature(&self, operation: &Operation) -> bool {
        match (operation.committed_version(), operation.committed_at(), operation.signature()) {
            (Some(version), Some(at), Some(signature)) => self.signer.verify(operation, version, at, signature),
            _ => false,
        }
    }

    /// Conflict records, oldest first.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        let mut records: Vec<ConflictRecord> = self.conflicts.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.detected_at);
        records
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    /// Operations currently holding `key`.
    pub fn holders(&self, key: &ResourceKey) -> Vec<OperationId> {
        self.locks.holders(key)
    }

    pub(crate) fn class_counts(&self) -> Vec<(String, ClassCounts)> {
        self.metrics.class_counts()
    }

    pub(crate) fn raise(&self, alert: Alert) {
        self.alerts.raise(alert);
    }

    /// Forget terminal operations, sealed trails and settled conflicts older
    /// than `retention`; report non-terminal operations older than `stale_after`.
    pub fn cleanup(&self, retention: Duration, stale_after: Duration) -> CleanupReport {
        let now = Utc::now();
        let mut report = CleanupReport::default();

        if let Some(cutoff) = older_than(now, retention) {
            let before = self.operations.len();
            self.operations
                .retain(|_, op| !(op.status().is_terminal() && op.updated_at() < cutoff));
            report.operations_removed = before.saturating_sub(self.operations.len());

            report.trails_pruned = self.ledger.prune_sealed(cutoff);

            let before = self.conflicts.len();
            self.conflicts.retain(|_, r| {
                let settled = r.resolved
                    || !self
                        .operations
                        .get(&r.contender)
                        .is_some_and(|op| !op.status().is_terminal());
                !(settled && r.detected_at < cutoff)
            });
            report.conflicts_removed = before.saturating_sub(self.conflicts.len());
        }

        if let Some(stale_cutoff) = older_than(now, stale_after) {
            report.stale = self
                .operations
                .iter()
                .filter(|op| !op.status().is_terminal() && op.created_at() < stale_cutoff)
                .map(|op| op.id())
                .collect();
            for id in &report.stale {
                warn!(operation_id = %id, "operation has not reached a terminal state");
            }
        }

        debug!(
            operations_removed = report.operations_removed,
            trails_pruned = report.trails_pruned,
            conflicts_removed = report.conflicts_removed,
            stale = report.stale.len(),
            "cleanup pass finished"
        );
        report
    }

    fn run(
        &self,
        resource_class: &str,
        resource_key: ResourceKey,
        kind: OperationKind,
        requested_delta: i64,
        options: &ExecuteOptions,
        compensates: Option<OperationId>,
    ) -> Result<OperationId, ExecuteError> {
        let started = Instant::now();
        let id = OperationId::new();
        let span = info_span!(
            "operation",
            operation_id = %id,
            resource_key = %resource_key,
            kind = kind.as_str()
        );
        let _entered = span.enter();
        self.metrics.record_started(resource_class);

        let (mut op, policy, current) =
            match self.prepare(id, resource_class, &resource_key, kind, requested_delta, options) {
                Ok(prepared) => prepared,
                Err(error) => return Err(self.reject(id, &resource_key, error, started)),
            };

        self.audit(
            &op,
            AuditEventKind::Created,
            Severity::Info,
            json!({
                "resource_class": resource_class,
                "kind": kind,
                "requested_delta": requested_delta,
                "actor": op.actor(),
                "expected_version": op.expected_version(),
                "baseline_quantity": op.baseline_quantity(),
                "computed_new_quantity": op.computed_new_quantity(),
                "override_reason": op.override_reason(),
                "compensates": compensates,
            }),
        );
        self.snapshot(&op);
        debug!("operation created");

        match self.drive(&mut op, &policy, &current, options) {
            Ok(()) => {
                self.metrics.record_completed(started.elapsed());
                self.snapshot(&op);
                Ok(id)
            }
            Err(error) => Err(self.fail(&mut op, error, started)),
        }
    }

    fn prepare(
        &self,
        id: OperationId,
        resource_class: &str,
        key: &ResourceKey,
        kind: OperationKind,
        requested_delta: i64,
        options: &ExecuteOptions,
    ) -> Result<(Operation, Arc<Policy>, VersionedRecord), OperationError> {
        options.context.check()?;
        let policy = self
            .policies
            .resolve(resource_class)
            .map_err(|_| OperationError::ConfigNotFound(resource_class.to_string()))?;
        let current = self.read(key)?;

        let mut op = Operation::new(id, resource_class, key.clone(), kind, requested_delta, options.actor, current)?;
        if let Some(version) = options.expected_version {
            op = op.with_expected_version(version);
        }
        if let Some(reason) = &options.emergency_override {
            op = op.with_override_reason(reason.clone());
        }
        Ok((op, policy, current))
    }

    fn drive(
        &self,
        op: &mut Operation,
        policy: &Policy,
        current: &VersionedRecord,
        options: &ExecuteOptions,
    ) -> Result<(), OperationError> {
        let ctx = &options.context;

        self.check_rules(op, current, policy)?;
        op.transition(OperationStatus::Validated)?;
        self.audit(
            op,
            AuditEventKind::Validated,
            Severity::Info,
            json!({ "computed_new_quantity": op.computed_new_quantity() }),
        );

        let grant = self.authorize(op, policy, options)?;
        op.transition(OperationStatus::Approved)?;
        self.audit(op, AuditEventKind::Approved, Severity::Info, json!({ "grant": grant }));

        let mut next = Next::Reacquire;
        loop {
            ctx.check()?;
            let guard = self.acquire(op, policy, ctx, next)?;
            op.transition(OperationStatus::Locked)?;
            self.audit(
                op,
                AuditEventKind::LockAcquired,
                Severity::Info,
                json!({ "expected_version": op.expected_version() }),
            );
            self.snapshot(op);

            if let Err(interrupted) = ctx.check() {
                self.release(op, guard);
                return Err(interrupted.into());
            }
            op.transition(OperationStatus::Executing)?;

            match self
                .store
                .write_if_version(op.resource_key(), op.expected_version(), op.computed_new_quantity())
            {
                Ok(version) => {
                    let at = Utc::now();
                    let signature = self.signer.sign(op, version, at);
                    self.release(op, guard);
                    op.mark_completed(version, signature.clone(), at)?;
                    self.audit(
                        op,
                        AuditEventKind::Completed,
                        Severity::Info,
                        json!({
                            "version": version,
                            "quantity": op.computed_new_quantity(),
                            "retries": op.retry_count(),
                            "signature": signature,
                        }),
                    );
                    info!(
                        version,
                        quantity = op.computed_new_quantity(),
                        retries = op.retry_count(),
                        "operation committed"
                    );
                    return Ok(());
                }
                Err(RecordStoreError::VersionMismatch { expected, actual, .. }) => {
                    self.release(op, guard);
                    op.transition(OperationStatus::Approved)?;
                    self.audit(
                        op,
                        AuditEventKind::VersionMismatch,
                        Severity::Warning,
                        json!({ "expected": expected, "actual": actual }),
                    );
                    debug!(expected, actual, "stale write");
                    next = self.resolve(op, policy, ConflictCause::VersionMismatch, Vec::new(), ctx)?;
                }
                Err(e) => {
                    self.release(op, guard);
                    return Err(storage_error(e));
                }
            }
        }
    }

    fn check_rules(&self, op: &Operation, current: &VersionedRecord, policy: &Policy) -> Result<(), OperationError> {
        self.validator
            .validate(op, current, policy)
            .into_result()
            .map_err(OperationError::Validation)
    }

    fn authorize(
        &self,
        op: &Operation,
        policy: &Policy,
        options: &ExecuteOptions,
    ) -> Result<ApprovalGrant, OperationError> {
        let ctx = &options.context;
        let outcome = self
            .gate
            .await_decision(op, policy, &options.actor_roles, ctx)
            .map_err(|e| OperationError::Internal(e.to_string()))?;

        match outcome {
            GateOutcome::Approved(grant) => Ok(grant),
            GateOutcome::Denied { reason } => Err(OperationError::ApprovalDenied { reason }),
            GateOutcome::TimedOut => {
                ctx.check()?;
                Err(OperationError::ApprovalTimeout)
            }
            GateOutcome::Interrupted(interrupted) => Err(interrupted.into()),
        }
    }

    /// Take the key lock, starting as `next` says (a merge waits, a retry
    /// does not) and resolving any further contention per policy.
    fn acquire<'a>(
        &'a self,
        op: &mut Operation,
        policy: &Policy,
        ctx: &OperationContext,
        mut next: Next,
    ) -> Result<LockGuard<'a>, OperationError> {
        let key = op.resource_key().clone();

        loop {
            let wait = match next {
                Next::Reacquire => None,
                Next::Wait => Some(policy.lock_timeout),
                Next::Override => return self.locks.acquire_override(&key, op.id()).map_err(lock_error),
            };
            let waiting_since = Instant::now();

            match self.locks.acquire(&key, op.id(), wait, ctx).map_err(lock_error)? {
                Acquire::Acquired(guard) => return Ok(guard),
                Acquire::Conflict { holders } => {
                    next = self.resolve(op, policy, ConflictCause::LockContention, holders, ctx)?;
                }
                Acquire::Timeout { holders } => {
                    ctx.check()?;
                    return Err(self.lock_timeout(op, waiting_since.elapsed(), holders));
                }
            }
        }
    }

    /// Record the conflict, then apply the policy's resolution to `op`.
    fn resolve(
        &self,
        op: &mut Operation,
        policy: &Policy,
        cause: ConflictCause,
        holders: Vec<OperationId>,
        ctx: &OperationContext,
    ) -> Result<Next, OperationError> {
        let strategy = self.resolver.strategy_for(op, policy);
        let merge_strategy = match strategy {
            ConflictResolution::Merge => policy.merge_strategy,
            _ => None,
        };
        let record = ConflictRecord::new(op, holders.clone(), cause, strategy, merge_strategy);
        let conflict_id = record.id;
        let label = record.strategy_label();

        self.metrics.record_conflict(op.resource_class(), label);
        warn!(
            conflict_id = %conflict_id,
            cause = ?cause,
            holders = ?holders,
            strategy = label,
            "conflict detected"
        );
        self.audit(
            op,
            AuditEventKind::ConflictDetected,
            Severity::Warning,
            json!({
                "conflict_id": conflict_id,
                "cause": cause,
                "holders": holders,
                "strategy": label,
            }),
        );
        for holder in &holders {
            self.ledger.annotate(
                *holder,
                op.resource_key(),
                AuditEventKind::Contended,
                Severity::Warning,
                json!({ "conflict_id": conflict_id, "contender": op.id() }),
            );
        }
        self.conflicts.insert(conflict_id, record);

        let next = match self.resolver.plan(op, policy, cause) {
            Resolution::Fail => {
                return Err(OperationError::ConflictDetected {
                    resource_key: op.resource_key().clone(),
                    holders,
                });
            }
            Resolution::Exhausted { attempts } => {
                return Err(OperationError::RetriesExhausted { attempts });
            }
            Resolution::Retry { attempt, backoff } => {
                op.begin_retry();
                self.metrics.record_retry();
                self.audit(
                    op,
                    AuditEventKind::RetryScheduled,
                    Severity::Info,
                    json!({ "attempt": attempt, "backoff_ms": millis(backoff) }),
                );
                debug!(attempt, backoff_ms = millis(backoff), "retrying after backoff");
                ctx.sleep(backoff)?;

                let latest = self.read(op.resource_key())?;
                op.rebase(latest)?;
                self.check_rules(op, &latest, policy)?;
                Next::Reacquire
            }
            Resolution::Merge { attempt, strategy } => {
                op.begin_retry();
                self.metrics.record_retry();

                let latest = self.read(op.resource_key())?;
                let quantity = merge_quantity(strategy, &latest, op)?;
                op.adopt(latest, quantity);
                self.check_rules(op, &latest, policy)?;
                self.audit(
                    op,
                    AuditEventKind::Merged,
                    Severity::Info,
                    json!({
                        "attempt": attempt,
                        "strategy": strategy,
                        "latest_version": latest.version,
                        "latest_quantity": latest.quantity,
                        "quantity": quantity,
                    }),
                );
                debug!(attempt, strategy = strategy.as_str(), quantity, "merged with latest record");
                Next::Wait
            }
            Resolution::Override => {
                self.metrics.record_override();
                self.audit(
                    op,
                    AuditEventKind::OverrideUsed,
                    Severity::Critical,
                    json!({ "reason": op.override_reason(), "displaced": holders }),
                );
                warn!(
                    reason = op.override_reason().unwrap_or_default(),
                    "emergency override bypasses mutual exclusion"
                );
                Next::Override
            }
        };

        if let Some(mut record) = self.conflicts.get_mut(&conflict_id) {
            record.mark_resolved();
        }
        self.audit(
            op,
            AuditEventKind::ConflictResolved,
            Severity::Info,
            json!({ "conflict_id": conflict_id, "strategy": label }),
        );
        Ok(next)
    }

    fn lock_timeout(&self, op: &Operation, waited: Duration, holders: Vec<OperationId>) -> OperationError {
        self.metrics.record_lock_timeout();
        warn!(waited_ms = millis(waited), holders = ?holders, "lock wait timed out");
        self.alerts.raise(Alert::LockTimeout {
            resource_key: op.resource_key().clone(),
            operation_id: op.id(),
            waited_ms: millis(waited),
        });
        OperationError::LockTimeout {
            resource_key: op.resource_key().clone(),
            waited,
        }
    }

    fn release(&self, op: &Operation, guard: LockGuard<'_>) {
        match guard.release() {
            Ok(held) => {
                self.metrics.record_lock_hold(held);
                self.audit(
                    op,
                    AuditEventKind::LockReleased,
                    Severity::Info,
                    json!({ "held_ms": millis(held) }),
                );
            }
            Err(e) => {
                warn!(error = %e, "lock release failed");
                self.audit(
                    op,
                    AuditEventKind::LockReleased,
                    Severity::Warning,
                    json!({ "error": e.to_string() }),
                );
            }
        }
    }

    fn read(&self, key: &ResourceKey) -> Result<VersionedRecord, OperationError> {
        self.store.read(key).map_err(storage_error)
    }

    fn audit(&self, op: &Operation, kind: AuditEventKind, severity: Severity, detail: JsonValue) {
        self.ledger.record(op.id(), op.resource_key(), kind, severity, detail);
    }

    fn snapshot(&self, op: &Operation) {
        self.operations.insert(op.id(), op.clone());
    }

    /// Terminal failure of an operation that never got past the record read.
    fn reject(&self, id: OperationId, key: &ResourceKey, error: OperationError, started: Instant) -> ExecuteError {
        self.ledger.record(
            id,
            key,
            AuditEventKind::Failed,
            severity_of(&error),
            json!({ "error": error.kind(), "message": error.to_string(), "retries": 0 }),
        );
        self.metrics.record_failed(error.kind(), started.elapsed());
        log_failure(&error);
        ExecuteError {
            operation_id: id,
            error,
        }
    }

    fn fail(&self, op: &mut Operation, error: OperationError, started: Instant) -> ExecuteError {
        if let Err(e) = op.mark_failed(error.to_string()) {
            warn!(error = %e, "could not mark operation failed");
        }
        self.audit(
            op,
            AuditEventKind::Failed,
            severity_of(&error),
            json!({
                "error": error.kind(),
                "message": error.to_string(),
                "retries": op.retry_count(),
            }),
        );
        self.metrics.record_failed(error.kind(), started.elapsed());
        self.snapshot(op);
        log_failure(&error);
        ExecuteError {
            operation_id: op.id(),
            error,
        }
    }

    fn mark_rolled_back(&self, original: &Operation, compensated_by: OperationId) {
        let updated = self
            .operations
            .get_mut(&original.id())
            .map(|mut op| op.transition(OperationStatus::RolledBack));

        match updated {
            Some(Ok(())) => {
                self.ledger.publish_detached(
                    original.id(),
                    original.resource_key(),
                    AuditEventKind::RolledBack,
                    Severity::Warning,
                    json!({ "compensated_by": compensated_by }),
                );
                info!(operation_id = %original.id(), compensated_by = %compensated_by, "operation rolled back");
            }
            Some(Err(e)) => warn!(operation_id = %original.id(), error = %e, "could not mark operation rolled back"),
            None => warn!(operation_id = %original.id(), "compensated operation is no longer tracked"),
        }
    }
}

fn storage_error(e: RecordStoreError) -> OperationError {
    match e {
        RecordStoreError::NotFound(key) => OperationError::RecordNotFound(key),
        other => OperationError::Storage(other.to_string()),
    }
}

fn lock_error(e: LockError) -> OperationError {
    match e {
        LockError::Interrupted(interrupted) => OperationError::Cancelled(interrupted),
        LockError::Distributed(e) => OperationError::Internal(e.to_string()),
    }
}

fn severity_of(error: &OperationError) -> Severity {
    match error.class() {
        ErrorClass::System => Severity::Critical,
        ErrorClass::FixRequest | ErrorClass::TryAgain => Severity::Warning,
    }
}

fn log_failure(error: &OperationError) {
    match error.class() {
        ErrorClass::System => error!(kind = error.kind(), error = %error, "operation failed"),
        ErrorClass::FixRequest | ErrorClass::TryAgain => {
            warn!(kind = error.kind(), error = %error, "operation failed")
        }
    }
}

fn older_than(now: chrono::DateTime<Utc>, age: Duration) -> Option<chrono::DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
