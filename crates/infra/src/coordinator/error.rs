use std::time::Duration;

use thiserror::Error;

use stockguard_core::{OperationId, ResourceKey};
use stockguard_inventory::{InvalidTransition, OperationStatus, RuleViolation};

use crate::context::Interrupted;

/// How a caller should react to a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Change the request before resubmitting.
    FixRequest,
    /// Resubmitting the same request may succeed.
    TryAgain,
    /// Storage or configuration problem; needs an operator.
    System,
}

/// Why an operation did not commit.
///
/// A version mismatch at write time never surfaces as such; it is resolved
/// per policy and reported as one of the conflict variants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("validation failed: {}", join(.0))]
    Validation(Vec<RuleViolation>),

    #[error("approval denied: {reason}")]
    ApprovalDenied { reason: String },

    #[error("approval not granted in time")]
    ApprovalTimeout,

    #[error("conflict on {resource_key} (holders: {holders:?})")]
    ConflictDetected {
        resource_key: ResourceKey,
        holders: Vec<OperationId>,
    },

    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("lock on {resource_key} not acquired within {waited:?}")]
    LockTimeout { resource_key: ResourceKey, waited: Duration },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("no policy configured for resource class {0}")]
    ConfigNotFound(String),

    #[error("record {0} not found")]
    RecordNotFound(ResourceKey),

    #[error("operation interrupted: {0}")]
    Cancelled(Interrupted),

    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),

    #[error("operation {operation_id} is {status}")]
    InvalidState {
        operation_id: OperationId,
        status: OperationStatus,
    },

    /// Lock backend, approval backend or lifecycle bookkeeping failure.
    #[error("internal coordination failure: {0}")]
    Internal(String),
}

fn join(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl OperationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OperationError::Validation(_)
            | OperationError::ApprovalDenied { .. }
            | OperationError::RecordNotFound(_)
            | OperationError::UnknownOperation(_)
            | OperationError::InvalidState { .. } => ErrorClass::FixRequest,
            OperationError::ApprovalTimeout
            | OperationError::ConflictDetected { .. }
            | OperationError::RetriesExhausted { .. }
            | OperationError::LockTimeout { .. }
            | OperationError::Cancelled(_) => ErrorClass::TryAgain,
            OperationError::Storage(_) | OperationError::ConfigNotFound(_) | OperationError::Internal(_) => {
                ErrorClass::System
            }
        }
    }

    /// Stable label used in audit events and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            OperationError::Validation(_) => "validation",
            OperationError::ApprovalDenied { .. } => "approval_denied",
            OperationError::ApprovalTimeout => "approval_timeout",
            OperationError::ConflictDetected { .. } => "conflict_detected",
            OperationError::RetriesExhausted { .. } => "retries_exhausted",
            OperationError::LockTimeout { .. } => "lock_timeout",
            OperationError::Storage(_) => "storage",
            OperationError::ConfigNotFound(_) => "config_not_found",
            OperationError::RecordNotFound(_) => "record_not_found",
            OperationError::Cancelled(_) => "cancelled",
            OperationError::UnknownOperation(_) => "unknown_operation",
            OperationError::InvalidState { .. } => "invalid_state",
            OperationError::Internal(_) => "internal",
        }
    }
}

impl From<Interrupted> for OperationError {
    fn from(value: Interrupted) -> Self {
        OperationError::Cancelled(value)
    }
}

impl From<RuleViolation> for OperationError {
    fn from(value: RuleViolation) -> Self {
        OperationError::Validation(vec![value])
    }
}

impl From<InvalidTransition> for OperationError {
    fn from(value: InvalidTransition) -> Self {
        OperationError::Internal(value.to_string())
    }
}

/// A failed `execute`/`compensate`, keeping the id so the operation's status
/// and audit trail can still be inspected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("operation {operation_id} failed: {error}")]
pub struct ExecuteError {
    pub operation_id: OperationId,
    #[source]
    pub error: OperationError,
}

impl ExecuteError {
    pub fn class(&self) -> ErrorClass {
        self.error.class()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_classified_for_client_retry_decisions() {
        let key = ResourceKey::new("P1", "S1").unwrap();
        assert_eq!(
            OperationError::Validation(vec![RuleViolation::OverrideNotPermitted]).class(),
            ErrorClass::FixRequest
        );
        assert_eq!(
            OperationError::ConflictDetected {
                resource_key: key.clone(),
                holders: vec![]
            }
            .class(),
            ErrorClass::TryAgain
        );
        assert_eq!(
            OperationError::LockTimeout {
                resource_key: key,
                waited: Duration::from_millis(5)
            }
            .class(),
            ErrorClass::TryAgain
        );
        assert_eq!(OperationError::Storage("down".into()).class(), ErrorClass::System);
        assert_eq!(OperationError::ConfigNotFound("x".into()).class(), ErrorClass::System);
    }

    #[test]
    fn validation_message_lists_every_violation() {
        let err = OperationError::Validation(vec![
            RuleViolation::NegativeStock { resulting: -100 },
            RuleViolation::OverrideNotPermitted,
        ]);
        let msg = err.to_string();
        assert!(msg.contains("-100"));
        assert!(msg.contains("override"));
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn a_single_rule_violation_converts_to_validation() {
        let violation = RuleViolation::QuantityOverflow {
            kind: stockguard_inventory::OperationKind::Increase,
            quantity: 100,
            delta: i64::MAX,
        };
        let err = OperationError::from(violation.clone());
        assert_eq!(err, OperationError::Validation(vec![violation]));
        assert_eq!(err.class(), ErrorClass::FixRequest);
    }
}
