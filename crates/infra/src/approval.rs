//! Approval gate in front of lock acquisition.
//!
//! Classes that do not require approval are auto-approved. Otherwise an actor
//! holding one of the policy's approver roles approves inline; everyone else is
//! delegated to an external [`ApprovalWorkflow`], which may answer later.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use stockguard_core::OperationId;
use stockguard_inventory::{Operation, Policy};

use crate::context::{Interrupted, OperationContext};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Pending,
    Denied { reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("approval workflow unavailable: {0}")]
    Unavailable(String),
}

/// External approval system (ticketing, four-eyes UI, ...).
pub trait ApprovalWorkflow: Send + Sync {
    /// Submit an operation for approval.
    fn request_approval(&self, operation: &Operation) -> Result<ApprovalDecision, ApprovalError>;

    /// Current decision for a previously submitted operation.
    fn status(&self, operation_id: OperationId) -> Result<ApprovalDecision, ApprovalError>;
}

impl<W> ApprovalWorkflow for Arc<W>
where
    W: ApprovalWorkflow + ?Sized,
{
    fn request_approval(&self, operation: &Operation) -> Result<ApprovalDecision, ApprovalError> {
        (**self).request_approval(operation)
    }

    fn status(&self, operation_id: OperationId) -> Result<ApprovalDecision, ApprovalError> {
        (**self).status(operation_id)
    }
}

/// Workflow stub that approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl ApprovalWorkflow for AutoApprove {
    fn request_approval(&self, _operation: &Operation) -> Result<ApprovalDecision, ApprovalError> {
        Ok(ApprovalDecision::Approved)
    }

    fn status(&self, _operation_id: OperationId) -> Result<ApprovalDecision, ApprovalError> {
        Ok(ApprovalDecision::Approved)
    }
}

/// In-memory workflow whose decisions are set by hand (tests/dev).
///
/// Requests start with `initial`; [`decide`](Self::decide) changes the answer.
#[derive(Debug)]
pub struct InMemoryApprovalWorkflow {
    initial: ApprovalDecision,
    decisions: DashMap<OperationId, ApprovalDecision>,
}

impl InMemoryApprovalWorkflow {
    pub fn new(initial: ApprovalDecision) -> Self {
        Self {
            initial,
            decisions: DashMap::new(),
        }
    }

    pub fn decide(&self, operation_id: OperationId, decision: ApprovalDecision) {
        self.decisions.insert(operation_id, decision);
    }

    pub fn requested(&self) -> Vec<OperationId> {
        self.decisions.iter().map(|e| *e.key()).collect()
    }
}

impl ApprovalWorkflow for InMemoryApprovalWorkflow {
    fn request_approval(&self, operation: &Operation) -> Result<ApprovalDecision, ApprovalError> {
        Ok(self
            .decisions
            .entry(operation.id())
            .or_insert_with(|| self.initial.clone())
            .value()
            .clone())
    }

    fn status(&self, operation_id: OperationId) -> Result<ApprovalDecision, ApprovalError> {
        self.decisions
            .get(&operation_id)
            .map(|d| d.value().clone())
            .ok_or_else(|| ApprovalError::Unavailable(format!("unknown approval request {operation_id}")))
    }
}

/// How an approval was granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum ApprovalGrant {
    NotRequired,
    ActorRole { role: String },
    Workflow,
}

/// Final gate outcome once pending decisions have been waited out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Approved(ApprovalGrant),
    Denied { reason: String },
    TimedOut,
    Interrupted(Interrupted),
}

pub struct ApprovalGate {
    workflow: Arc<dyn ApprovalWorkflow>,
    timeout: Duration,
    poll_interval: Duration,
}

impl core::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl ApprovalGate {
    pub fn new(workflow: Arc<dyn ApprovalWorkflow>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            workflow,
            timeout,
            poll_interval,
        }
    }

    /// Single, non-blocking authorization check.
    pub fn authorize(
        &self,
        operation: &Operation,
        policy: &Policy,
        actor_roles: &BTreeSet<String>,
    ) -> Result<(ApprovalDecision, Option<ApprovalGrant>), ApprovalError> {
        if !policy.require_approval {
            return Ok((ApprovalDecision::Approved, Some(ApprovalGrant::NotRequired)));
        }
        if let Some(role) = policy.approver_roles.intersection(actor_roles).next() {
            return Ok((
                ApprovalDecision::Approved,
                Some(ApprovalGrant::ActorRole { role: role.clone() }),
            ));
        }
        let decision = self.workflow.request_approval(operation)?;
        let grant = matches!(decision, ApprovalDecision::Approved).then_some(ApprovalGrant::Workflow);
        Ok((decision, grant))
    }

    /// Authorize, polling the workflow while the decision is pending.
    ///
    /// Gives up after the gate timeout or the context deadline, whichever is first.
    pub fn await_decision(
        &self,
        operation: &Operation,
        policy: &Policy,
        actor_roles: &BTreeSet<String>,
        ctx: &OperationContext,
    ) -> Result<GateOutcome, ApprovalError> {
        let (mut decision, grant) = self.authorize(operation, policy, actor_roles)?;
        let give_up = Instant::now() + ctx.bound(self.timeout);

        loop {
            match decision {
                ApprovalDecision::Approved => {
                    return Ok(GateOutcome::Approved(grant.clone().unwrap_or(ApprovalGrant::Workflow)));
                }
                ApprovalDecision::Denied { reason } => return Ok(GateOutcome::Denied { reason }),
                ApprovalDecision::Pending => {}
            }

            if let Err(Interrupted::Cancelled) = ctx.check() {
                return Ok(GateOutcome::Interrupted(Interrupted::Cancelled));
            }
            let now = Instant::now();
            if now >= give_up {
                return Ok(GateOutcome::TimedOut);
            }
            debug!(operation_id = %operation.id(), "approval pending");
            if let Err(i @ Interrupted::Cancelled) = ctx.sleep(self.poll_interval.min(give_up - now)) {
                return Ok(GateOutcome::Interrupted(i));
            }
            decision = self.workflow.status(operation.id())?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockguard_core::{ActorId, ResourceKey, VersionedRecord};
    use stockguard_inventory::OperationKind;

    fn operation() -> Operation {
        Operation::new(
            OperationId::new(),
            "prices",
            ResourceKey::new("P1", "S1").unwrap(),
            OperationKind::PriceUpdate,
            100,
            ActorId::new(),
            VersionedRecord::new(1_000, 1),
        )
        .unwrap()
    }

    fn gate(workflow: Arc<dyn ApprovalWorkflow>) -> ApprovalGate {
        ApprovalGate::new(workflow, Duration::from_millis(200), Duration::from_millis(5))
    }

    fn roles(r: &[&str]) -> BTreeSet<String> {
        r.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn not_required_is_auto_approved() {
        let workflow = Arc::new(InMemoryApprovalWorkflow::new(ApprovalDecision::Pending));
        let outcome = gate(workflow.clone())
            .await_decision(&operation(), &Policy::default(), &roles(&[]), &OperationContext::new())
            .unwrap();
        assert_eq!(outcome, GateOutcome::Approved(ApprovalGrant::NotRequired));
        assert!(workflow.requested().is_empty());
    }

    #[test]
    fn approver_role_approves_inline() {
        let workflow = Arc::new(InMemoryApprovalWorkflow::new(ApprovalDecision::Pending));
        let policy = Policy::default().with_approval(["pricing_manager"]);
        let outcome = gate(workflow.clone())
            .await_decision(&operation(), &policy, &roles(&["clerk", "pricing_manager"]), &OperationContext::new())
            .unwrap();
        assert_eq!(
            outcome,
            GateOutcome::Approved(ApprovalGrant::ActorRole {
                role: "pricing_manager".to_string()
            })
        );
        assert!(workflow.requested().is_empty());
    }

    #[test]
    fn pending_decision_is_polled_until_approved() {
        let workflow = Arc::new(InMemoryApprovalWorkflow::new(ApprovalDecision::Pending));
        let policy = Policy::default().with_approval(["pricing_manager"]);
        let op = operation();
        let id = op.id();

        let approver = {
            let workflow = workflow.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                workflow.decide(id, ApprovalDecision::Approved);
            })
        };
        let outcome = gate(workflow)
            .await_decision(&op, &policy, &roles(&["clerk"]), &OperationContext::new())
            .unwrap();
        approver.join().unwrap();
        assert_eq!(outcome, GateOutcome::Approved(ApprovalGrant::Workflow));
    }

    #[test]
    fn denial_and_timeout_are_reported() {
        let policy = Policy::default().with_approval(["pricing_manager"]);
        let denied = Arc::new(InMemoryApprovalWorkflow::new(ApprovalDecision::Denied {
            reason: "price freeze".to_string(),
        }));
        assert_eq!(
            gate(denied)
                .await_decision(&operation(), &policy, &roles(&[]), &OperationContext::new())
                .unwrap(),
            GateOutcome::Denied {
                reason: "price freeze".to_string()
            }
        );

        let stuck = Arc::new(InMemoryApprovalWorkflow::new(ApprovalDecision::Pending));
        assert_eq!(
            gate(stuck)
                .await_decision(&operation(), &policy, &roles(&[]), &OperationContext::new())
                .unwrap(),
            GateOutcome::TimedOut
        );
    }

    #[test]
    fn cancellation_releases_a_stuck_approval() {
        let policy = Policy::default().with_approval(["pricing_manager"]);
        let stuck = Arc::new(InMemoryApprovalWorkflow::new(ApprovalDecision::Pending));
        let ctx = OperationContext::new();
        ctx.cancel();
        assert_eq!(
            gate(stuck).await_decision(&operation(), &policy, &roles(&[]), &ctx).unwrap(),
            GateOutcome::Interrupted(Interrupted::Cancelled)
        );
    }
}
