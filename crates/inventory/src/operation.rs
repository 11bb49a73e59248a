//! A single mutation attempt and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockguard_core::{ActorId, OperationId, ResourceKey, VersionedRecord};

use crate::validation::RuleViolation;

/// What a mutation does to the stored quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Increase,
    Decrease,
    Reserve,
    Release,
    /// Signed correction (stock count, shrinkage, ...).
    Adjust,
    /// Signed change of a price stored in minor units.
    PriceUpdate,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Increase => "increase",
            OperationKind::Decrease => "decrease",
            OperationKind::Reserve => "reserve",
            OperationKind::Release => "release",
            OperationKind::Adjust => "adjust",
            OperationKind::PriceUpdate => "price_update",
        }
    }

    /// Signed kinds accept any delta; the others take a positive magnitude.
    pub fn is_adjustment(self) -> bool {
        matches!(self, OperationKind::Adjust | OperationKind::PriceUpdate)
    }

    /// Quantity after applying `requested_delta` to `quantity`.
    ///
    /// Fails with [`RuleViolation::QuantityOverflow`] when the result does not fit.
    pub fn apply(self, quantity: i64, requested_delta: i64) -> Result<i64, RuleViolation> {
        let applied = match self {
            OperationKind::Increase | OperationKind::Release => quantity.checked_add(requested_delta),
            OperationKind::Decrease | OperationKind::Reserve => quantity.checked_sub(requested_delta),
            OperationKind::Adjust | OperationKind::PriceUpdate => quantity.checked_add(requested_delta),
        };
        applied.ok_or(RuleViolation::QuantityOverflow {
            kind: self,
            quantity,
            delta: requested_delta,
        })
    }

    /// The kind and delta that undo a committed mutation.
    pub fn compensation(self, requested_delta: i64) -> Result<(OperationKind, i64), RuleViolation> {
        Ok(match self {
            OperationKind::Increase => (OperationKind::Decrease, requested_delta),
            OperationKind::Decrease => (OperationKind::Increase, requested_delta),
            OperationKind::Reserve => (OperationKind::Release, requested_delta),
            OperationKind::Release => (OperationKind::Reserve, requested_delta),
            OperationKind::Adjust | OperationKind::PriceUpdate => {
                let negated = requested_delta.checked_neg().ok_or(RuleViolation::QuantityOverflow {
                    kind: self,
                    quantity: 0,
                    delta: requested_delta,
                })?;
                (self, negated)
            }
        })
    }
}

impl core::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an operation.
///
/// `pending → validated → approved → locked → executing → {completed | failed}`.
/// `rolled_back` is only reachable from `completed`, through a compensation
/// requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Validated,
    Approved,
    Locked,
    Executing,
    Completed,
    Failed,
    RolledBack,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::RolledBack
        )
    }

    fn can_transition_to(self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        match (self, next) {
            (Pending, Validated) => true,
            (Validated, Approved) => true,
            (Approved, Locked) => true,
            (Locked, Executing) => true,
            (Executing, Completed) => true,
            // A stale write hands the operation back to conflict resolution.
            (Locked | Executing, Approved) => true,
            (Completed, RolledBack) => true,
            (Pending | Validated | Approved | Locked | Executing, Failed) => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Validated => "validated",
            OperationStatus::Approved => "approved",
            OperationStatus::Locked => "locked",
            OperationStatus::Executing => "executing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid transition for operation {operation_id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub operation_id: OperationId,
    pub from: OperationStatus,
    pub to: OperationStatus,
}

/// One mutation attempt against a single resource key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    id: OperationId,
    resource_class: String,
    resource_key: ResourceKey,
    kind: OperationKind,
    requested_delta: i64,
    actor: ActorId,
    expected_version: u64,
    baseline_quantity: i64,
    computed_new_quantity: i64,
    status: OperationStatus,
    retry_count: u32,
    override_reason: Option<String>,
    committed_version: Option<u64>,
    committed_at: Option<DateTime<Utc>>,
    signature: Option<String>,
    failure: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Operation {
    /// Create a pending operation from a request and the record it was read against.
    ///
    /// Fails when the requested delta cannot be applied without overflow.
    pub fn new(
        id: OperationId,
        resource_class: impl Into<String>,
        resource_key: ResourceKey,
        kind: OperationKind,
        requested_delta: i64,
        actor: ActorId,
        current: VersionedRecord,
    ) -> Result<Self, RuleViolation> {
        let computed_new_quantity = kind.apply(current.quantity, requested_delta)?;
        let now = Utc::now();
        Ok(Self {
            id,
            resource_class: resource_class.into(),
            resource_key,
            kind,
            requested_delta,
            actor,
            expected_version: current.version,
            baseline_quantity: current.quantity,
            computed_new_quantity,
            status: OperationStatus::Pending,
            retry_count: 0,
            override_reason: None,
            committed_version: None,
            committed_at: None,
            signature: None,
            failure: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_override_reason(mut self, reason: impl Into<String>) -> Self {
        self.override_reason = Some(reason.into());
        self
    }

    /// Pin the version the caller believes is current.
    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = version;
        self
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn resource_class(&self) -> &str {
        &self.resource_class
    }

    pub fn resource_key(&self) -> &ResourceKey {
        &self.resource_key
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn requested_delta(&self) -> i64 {
        self.requested_delta
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    pub fn expected_version(&self) -> u64 {
        self.expected_version
    }

    /// Quantity the operation was last computed against.
    pub fn baseline_quantity(&self) -> i64 {
        self.baseline_quantity
    }

    pub fn computed_new_quantity(&self) -> i64 {
        self.computed_new_quantity
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn override_reason(&self) -> Option<&str> {
        self.override_reason.as_deref()
    }

    pub fn is_emergency_override(&self) -> bool {
        self.override_reason.is_some()
    }

    pub fn committed_version(&self) -> Option<u64> {
        self.committed_version
    }

    pub fn committed_at(&self) -> Option<DateTime<Utc>> {
        self.committed_at
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Move to `next`, enforcing the lifecycle graph.
    pub fn transition(&mut self, next: OperationStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                operation_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Count one more conflict-resolution round.
    pub fn begin_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.updated_at = Utc::now();
        self.retry_count
    }

    /// Recompute the requested delta against a freshly read record.
    pub fn rebase(&mut self, latest: VersionedRecord) -> Result<(), RuleViolation> {
        let quantity = self.kind.apply(latest.quantity, self.requested_delta)?;
        self.adopt(latest, quantity);
        Ok(())
    }

    /// Take `latest.version` as the new expectation and write `quantity`.
    pub fn adopt(&mut self, latest: VersionedRecord, quantity: i64) {
        self.expected_version = latest.version;
        self.baseline_quantity = latest.quantity;
        self.computed_new_quantity = quantity;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(
        &mut self,
        version: u64,
        signature: String,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(OperationStatus::Completed)?;
        self.committed_version = Some(version);
        self.committed_at = Some(at);
        self.signature = Some(signature);
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(OperationStatus::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OperationKind, delta: i64) -> Operation {
        Operation::new(
            OperationId::new(),
            "products",
            ResourceKey::new("P1", "S1").unwrap(),
            kind,
            delta,
            ActorId::new(),
            VersionedRecord::new(100, 3),
        )
        .unwrap()
    }

    #[test]
    fn computes_new_quantity_from_kind() {
        assert_eq!(op(OperationKind::Increase, 10).computed_new_quantity(), 110);
        assert_eq!(op(OperationKind::Decrease, 10).computed_new_quantity(), 90);
        assert_eq!(op(OperationKind::Reserve, 20).computed_new_quantity(), 80);
        assert_eq!(op(OperationKind::Release, 5).computed_new_quantity(), 105);
        assert_eq!(op(OperationKind::Adjust, -7).computed_new_quantity(), 93);
        assert_eq!(op(OperationKind::Increase, 10).expected_version(), 3);
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut o = op(OperationKind::Increase, 10);
        o.transition(OperationStatus::Validated).unwrap();
        o.transition(OperationStatus::Approved).unwrap();
        o.transition(OperationStatus::Locked).unwrap();
        o.transition(OperationStatus::Executing).unwrap();
        let at = Utc::now();
        o.mark_completed(4, "sig".to_string(), at).unwrap();

        assert_eq!(o.status(), OperationStatus::Completed);
        assert_eq!(o.committed_version(), Some(4));
        assert_eq!(o.committed_at(), Some(at));
        assert!(o.status().is_terminal());
    }

    #[test]
    fn cannot_skip_states_or_leave_terminal_ones() {
        let mut o = op(OperationKind::Increase, 10);
        assert!(o.transition(OperationStatus::Locked).is_err());

        o.mark_failed("validation").unwrap();
        assert!(o.transition(OperationStatus::Validated).is_err());
        assert!(o.mark_failed("again").is_err());
        assert!(o.transition(OperationStatus::RolledBack).is_err());
    }

    #[test]
    fn stale_write_returns_to_approved() {
        let mut o = op(OperationKind::Decrease, 3);
        o.transition(OperationStatus::Validated).unwrap();
        o.transition(OperationStatus::Approved).unwrap();
        o.transition(OperationStatus::Locked).unwrap();
        o.transition(OperationStatus::Executing).unwrap();
        o.transition(OperationStatus::Approved).unwrap();

        assert_eq!(o.begin_retry(), 1);
        o.rebase(VersionedRecord::new(95, 6)).unwrap();
        assert_eq!(o.expected_version(), 6);
        assert_eq!(o.computed_new_quantity(), 92);
    }

    #[test]
    fn compensation_inverts_the_effect() {
        for (kind, delta) in [
            (OperationKind::Increase, 10),
            (OperationKind::Decrease, 4),
            (OperationKind::Reserve, 6),
            (OperationKind::Release, 2),
            (OperationKind::Adjust, -9),
            (OperationKind::PriceUpdate, 150),
        ] {
            let (inverse, inverse_delta) = kind.compensation(delta).unwrap();
            let applied = kind.apply(100, delta).unwrap();
            assert_eq!(inverse.apply(applied, inverse_delta).unwrap(), 100, "{kind} did not invert");
        }
    }

    #[test]
    fn overflowing_deltas_are_rejected_not_clamped() {
        let at_max = VersionedRecord::new(100, 1);
        let err = Operation::new(
            OperationId::new(),
            "products",
            ResourceKey::new("P1", "S1").unwrap(),
            OperationKind::Increase,
            i64::MAX,
            ActorId::new(),
            at_max,
        )
        .unwrap_err();
        assert_eq!(
            err,
            RuleViolation::QuantityOverflow {
                kind: OperationKind::Increase,
                quantity: 100,
                delta: i64::MAX
            }
        );

        assert!(OperationKind::Decrease.apply(-10, i64::MAX).is_err());
        assert!(OperationKind::Adjust.compensation(i64::MIN).is_err());

        let mut o = op(OperationKind::Increase, 10);
        assert!(o.rebase(VersionedRecord::new(i64::MAX - 5, 9)).is_err());
        assert_eq!(o.expected_version(), 3);
        assert_eq!(o.computed_new_quantity(), 110);
    }
}
