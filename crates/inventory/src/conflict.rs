//! Conflict records, merge functions and resolution planning.
//!
//! The planner is pure: it decides *what* to do about a contended key. Sleeping,
//! re-reading and re-acquiring is left to the coordinator.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockguard_core::{ConflictId, OperationId, ResourceKey, VersionedRecord};

use crate::operation::Operation;
use crate::policy::{ConflictResolution, MergeStrategy, Policy};
use crate::validation::RuleViolation;

/// Where the contention was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCause {
    /// Another operation holds the in-process or distributed lock.
    LockContention,
    /// The versioned write found a newer record than expected.
    VersionMismatch,
}

/// Forensic record of two (or more) operations contending for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub resource_key: ResourceKey,
    pub resource_class: String,
    /// Operations holding the key when the conflict was detected. Empty when the
    /// winner is only known to storage (version mismatch).
    pub holders: Vec<OperationId>,
    pub contender: OperationId,
    pub cause: ConflictCause,
    pub strategy: ConflictResolution,
    pub merge_strategy: Option<MergeStrategy>,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    pub fn new(
        operation: &Operation,
        holders: Vec<OperationId>,
        cause: ConflictCause,
        strategy: ConflictResolution,
        merge_strategy: Option<MergeStrategy>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            resource_key: operation.resource_key().clone(),
            resource_class: operation.resource_class().to_string(),
            holders,
            contender: operation.id(),
            cause,
            strategy,
            merge_strategy,
            detected_at: Utc::now(),
            resolved: false,
            resolved_at: None,
        }
    }

    pub fn mark_resolved(&mut self) {
        self.resolved = true;
        self.resolved_at = Some(Utc::now());
    }

    /// Name of the strategy that settled the conflict (`sum`, `retry`, ...).
    pub fn strategy_label(&self) -> &'static str {
        match (self.strategy, self.merge_strategy) {
            (ConflictResolution::Merge, Some(m)) => m.as_str(),
            (s, _) => s.as_str(),
        }
    }
}

/// Quantity to write after merging with the latest stored record.
pub fn merge_quantity(
    strategy: MergeStrategy,
    latest: &VersionedRecord,
    operation: &Operation,
) -> Result<i64, RuleViolation> {
    Ok(match strategy {
        MergeStrategy::Sum => operation.kind().apply(latest.quantity, operation.requested_delta())?,
        MergeStrategy::Max => latest.quantity.max(operation.computed_new_quantity()),
        MergeStrategy::Min => latest.quantity.min(operation.computed_new_quantity()),
        MergeStrategy::LastWriterWins => operation.computed_new_quantity(),
    })
}

/// What the coordinator should do next about a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Give up and report the conflict (strategy `fail`).
    Fail,
    /// Sleep `backoff`, re-read, rebase and try again as attempt `attempt`.
    Retry { attempt: u32, backoff: Duration },
    /// Re-read, merge with `strategy` and try again as attempt `attempt`.
    Merge { attempt: u32, strategy: MergeStrategy },
    /// Take the lock alongside the current holder.
    Override,
    /// The retry budget is spent.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// The strategy governing `operation`: the class policy, unless an emergency
    /// override was requested.
    pub fn strategy_for(&self, operation: &Operation, policy: &Policy) -> ConflictResolution {
        if operation.is_emergency_override() {
            ConflictResolution::Override
        } else {
            policy.conflict_resolution
        }
    }

    pub fn plan(&self, operation: &Operation, policy: &Policy, cause: ConflictCause) -> Resolution {
        let attempts_left = operation.retry_count() < policy.max_retry_attempts;
        let next_attempt = operation.retry_count() + 1;
        let exhausted = Resolution::Exhausted {
            attempts: operation.retry_count() + 1,
        };

        match self.strategy_for(operation, policy) {
            ConflictResolution::Fail => Resolution::Fail,
            ConflictResolution::Retry if attempts_left => Resolution::Retry {
                attempt: next_attempt,
                backoff: policy.backoff_for_attempt(next_attempt),
            },
            ConflictResolution::Merge if attempts_left => Resolution::Merge {
                attempt: next_attempt,
                strategy: policy.merge_strategy.unwrap_or(MergeStrategy::LastWriterWins),
            },
            ConflictResolution::Override => match cause {
                ConflictCause::LockContention => Resolution::Override,
                // Storage already moved on; rebase without waiting, within budget.
                ConflictCause::VersionMismatch if attempts_left => Resolution::Retry {
                    attempt: next_attempt,
                    backoff: Duration::ZERO,
                },
                ConflictCause::VersionMismatch => exhausted,
            },
            ConflictResolution::Retry | ConflictResolution::Merge => exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;
    use proptest::prelude::*;
    use stockguard_core::ActorId;

    fn reserve(delta: i64, on: VersionedRecord) -> Operation {
        Operation::new(
            OperationId::new(),
            "reservations",
            ResourceKey::new("P1", "S1").unwrap(),
            OperationKind::Reserve,
            delta,
            ActorId::new(),
            on,
        )
        .unwrap()
    }

    #[test]
    fn merge_functions() {
        let op = reserve(20, VersionedRecord::new(100, 1));
        let latest = VersionedRecord::new(85, 2);

        assert_eq!(merge_quantity(MergeStrategy::Sum, &latest, &op).unwrap(), 65);
        assert_eq!(merge_quantity(MergeStrategy::Max, &latest, &op).unwrap(), 85);
        assert_eq!(merge_quantity(MergeStrategy::Min, &latest, &op).unwrap(), 80);
        assert_eq!(merge_quantity(MergeStrategy::LastWriterWins, &latest, &op).unwrap(), 80);
    }

    #[test]
    fn sum_merge_reports_overflow() {
        let op = reserve(20, VersionedRecord::new(100, 1));
        let latest = VersionedRecord::new(i64::MIN + 5, 2);
        assert_eq!(
            merge_quantity(MergeStrategy::Sum, &latest, &op),
            Err(RuleViolation::QuantityOverflow {
                kind: OperationKind::Reserve,
                quantity: i64::MIN + 5,
                delta: 20
            })
        );
    }

    #[test]
    fn fail_never_retries() {
        let policy = Policy::default().with_conflict_resolution(ConflictResolution::Fail);
        let op = reserve(1, VersionedRecord::new(10, 1));
        assert_eq!(
            ConflictResolver::new().plan(&op, &policy, ConflictCause::LockContention),
            Resolution::Fail
        );
    }

    #[test]
    fn retry_backs_off_linearly_until_exhausted() {
        let policy = Policy::default().with_retries(2, Duration::from_millis(10));
        let resolver = ConflictResolver::new();
        let mut op = reserve(1, VersionedRecord::new(10, 1));

        assert_eq!(
            resolver.plan(&op, &policy, ConflictCause::LockContention),
            Resolution::Retry {
                attempt: 1,
                backoff: Duration::from_millis(10)
            }
        );
        op.begin_retry();
        assert_eq!(
            resolver.plan(&op, &policy, ConflictCause::VersionMismatch),
            Resolution::Retry {
                attempt: 2,
                backoff: Duration::from_millis(20)
            }
        );
        op.begin_retry();
        assert_eq!(
            resolver.plan(&op, &policy, ConflictCause::LockContention),
            Resolution::Exhausted { attempts: 3 }
        );
    }

    #[test]
    fn merge_uses_policy_strategy() {
        let policy = Policy::default().with_merge_strategy(MergeStrategy::Sum);
        let op = reserve(1, VersionedRecord::new(10, 1));
        assert_eq!(
            ConflictResolver::new().plan(&op, &policy, ConflictCause::LockContention),
            Resolution::Merge {
                attempt: 1,
                strategy: MergeStrategy::Sum
            }
        );
    }

    #[test]
    fn emergency_override_bypasses_contention_only() {
        let policy = Policy::default()
            .with_conflict_resolution(ConflictResolution::Fail)
            .allowing_emergency_override();
        let op = reserve(1, VersionedRecord::new(10, 1)).with_override_reason("holder crashed");
        let resolver = ConflictResolver::new();

        assert_eq!(resolver.strategy_for(&op, &policy), ConflictResolution::Override);
        assert_eq!(resolver.plan(&op, &policy, ConflictCause::LockContention), Resolution::Override);
        assert!(matches!(
            resolver.plan(&op, &policy, ConflictCause::VersionMismatch),
            Resolution::Retry { backoff: Duration::ZERO, .. }
        ));
    }

    #[test]
    fn record_labels_merge_by_merge_strategy() {
        let op = reserve(1, VersionedRecord::new(10, 1));
        let mut record = ConflictRecord::new(
            &op,
            vec![OperationId::new()],
            ConflictCause::LockContention,
            ConflictResolution::Merge,
            Some(MergeStrategy::Sum),
        );
        assert_eq!(record.strategy_label(), "sum");
        assert!(!record.resolved);
        record.mark_resolved();
        assert!(record.resolved && record.resolved_at.is_some());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            .. ProptestConfig::default()
        })]

        /// Two reservations merged with `sum` land on `Q - D1 - D2` in either order.
        #[test]
        fn sum_merge_is_order_independent(q in 0i64..1_000_000, d1 in 1i64..10_000, d2 in 1i64..10_000) {
            let base = VersionedRecord::new(q, 1);
            let first = reserve(d1, base);
            let second = reserve(d2, base);

            let after_first = base.next(first.computed_new_quantity());
            let merged = merge_quantity(MergeStrategy::Sum, &after_first, &second).unwrap();

            let after_second = base.next(second.computed_new_quantity());
            let merged_rev = merge_quantity(MergeStrategy::Sum, &after_second, &first).unwrap();

            prop_assert_eq!(merged, q - d1 - d2);
            prop_assert_eq!(merged_rev, q - d1 - d2);
        }

        #[test]
        fn attempts_never_exceed_budget(max in 0u32..6) {
            let policy = Policy::default().with_retries(max, Duration::ZERO);
            let resolver = ConflictResolver::new();
            let mut op = reserve(1, VersionedRecord::new(10, 1));
            let mut attempts = 1u32;
            while let Resolution::Retry { .. } = resolver.plan(&op, &policy, ConflictCause::VersionMismatch) {
                op.begin_retry();
                attempts += 1;
            }
            prop_assert_eq!(attempts, max + 1);
        }
    }
}
