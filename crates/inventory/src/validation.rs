//! Business-rule validation of a proposed mutation.
//!
//! Pure: no IO, no locks. All violations are collected rather than stopping at
//! the first one.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockguard_core::VersionedRecord;

use crate::operation::{Operation, OperationKind};
use crate::policy::Policy;

/// A reservation may not exceed this share of the current quantity (80%).
pub const RESERVATION_CEILING: (i64, i64) = (4, 5);

/// A price update may not move the price by more than this share (50%).
pub const PRICE_DELTA_CEILING: (i64, i64) = (1, 2);

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleViolation {
    #[error("resulting quantity {resulting} would be negative")]
    NegativeStock { resulting: i64 },

    #[error("reservation of {requested} exceeds 80% of available quantity {available}")]
    ReservationLimitExceeded { requested: i64, available: i64 },

    #[error("{kind} requires a positive delta, got {delta}")]
    NonPositiveDelta { kind: OperationKind, delta: i64 },

    #[error("price change of {delta} exceeds 50% of previous price {previous}")]
    PriceChangeTooLarge { previous: i64, delta: i64 },

    #[error("{kind} of {delta} on quantity {quantity} overflows")]
    QuantityOverflow { kind: OperationKind, quantity: i64, delta: i64 },

    #[error("emergency override is not permitted for this resource class")]
    OverrideNotPermitted,
}

/// Outcome of [`BusinessRuleValidator::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<RuleViolation>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<(), Vec<RuleViolation>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BusinessRuleValidator;

impl BusinessRuleValidator {
    pub fn new() -> Self {
        Self
    }

    /// Check `operation.computed_new_quantity()` and its delta against `policy`.
    pub fn validate(&self, operation: &Operation, current: &VersionedRecord, policy: &Policy) -> ValidationResult {
        let mut errors = Vec::new();
        let kind = operation.kind();
        let delta = operation.requested_delta();

        let resulting = operation.computed_new_quantity();
        if resulting < 0 && !policy.allow_negative_stock {
            errors.push(RuleViolation::NegativeStock { resulting });
        }

        if policy.enforce_reservation_limit
            && kind == OperationKind::Reserve
            && exceeds_ratio(delta, current.quantity, RESERVATION_CEILING)
        {
            errors.push(RuleViolation::ReservationLimitExceeded {
                requested: delta,
                available: current.quantity,
            });
        }

        if !kind.is_adjustment() && delta <= 0 {
            errors.push(RuleViolation::NonPositiveDelta { kind, delta });
        }

        // A zero previous price has no meaningful ratio.
        if kind == OperationKind::PriceUpdate
            && current.quantity != 0
            && exceeds_ratio(delta.saturating_abs(), current.quantity.saturating_abs(), PRICE_DELTA_CEILING)
        {
            errors.push(RuleViolation::PriceChangeTooLarge {
                previous: current.quantity,
                delta,
            });
        }

        if operation.is_emergency_override() && !policy.allow_emergency_override {
            errors.push(RuleViolation::OverrideNotPermitted);
        }

        ValidationResult { errors }
    }
}

/// `value > base × num / den`, computed without rounding or overflow.
fn exceeds_ratio(value: i64, base: i64, (num, den): (i64, i64)) -> bool {
    (value as i128) * (den as i128) > (base as i128) * (num as i128)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use stockguard_core::{ActorId, OperationId, ResourceKey};

    fn op_on(record: VersionedRecord, kind: OperationKind, delta: i64) -> Operation {
        Operation::new(
            OperationId::new(),
            "products",
            ResourceKey::new("P1", "S1").unwrap(),
            kind,
            delta,
            ActorId::new(),
            record,
        )
        .unwrap()
    }

    fn check(record: VersionedRecord, kind: OperationKind, delta: i64, policy: &Policy) -> ValidationResult {
        BusinessRuleValidator::new().validate(&op_on(record, kind, delta), &record, policy)
    }

    #[test]
    fn rejects_negative_stock_unless_allowed() {
        let record = VersionedRecord::new(100, 1);
        let result = check(record, OperationKind::Decrease, 200, &Policy::default());
        assert_eq!(result.errors, vec![RuleViolation::NegativeStock { resulting: -100 }]);

        let lenient = Policy::default().allowing_negative_stock();
        assert!(check(record, OperationKind::Decrease, 200, &lenient).is_ok());
    }

    #[test]
    fn reservation_ceiling_is_eighty_percent() {
        let record = VersionedRecord::new(100, 1);
        assert!(check(record, OperationKind::Reserve, 80, &Policy::default()).is_ok());
        assert_eq!(
            check(record, OperationKind::Reserve, 81, &Policy::default()).errors,
            vec![RuleViolation::ReservationLimitExceeded {
                requested: 81,
                available: 100
            }]
        );

        let mut relaxed = Policy::default();
        relaxed.enforce_reservation_limit = false;
        assert!(check(record, OperationKind::Reserve, 81, &relaxed).is_ok());
    }

    #[test]
    fn collects_every_violation_in_rule_order() {
        let record = VersionedRecord::new(10, 1);
        let result = check(record, OperationKind::Reserve, -5, &Policy::default());
        // -5 reserve increases quantity, so only the delta rule fires.
        assert_eq!(
            result.errors,
            vec![RuleViolation::NonPositiveDelta {
                kind: OperationKind::Reserve,
                delta: -5
            }]
        );

        let result = check(record, OperationKind::Reserve, 50, &Policy::default());
        assert_eq!(
            result.errors,
            vec![
                RuleViolation::NegativeStock { resulting: -40 },
                RuleViolation::ReservationLimitExceeded {
                    requested: 50,
                    available: 10
                },
            ]
        );
    }

    #[test]
    fn price_updates_are_capped_at_half() {
        let price = VersionedRecord::new(1_000, 7);
        assert!(check(price, OperationKind::PriceUpdate, 500, &Policy::default()).is_ok());
        assert!(check(price, OperationKind::PriceUpdate, -500, &Policy::default()).is_ok());
        assert_eq!(
            check(price, OperationKind::PriceUpdate, 501, &Policy::default()).errors,
            vec![RuleViolation::PriceChangeTooLarge {
                previous: 1_000,
                delta: 501
            }]
        );
        assert!(check(price, OperationKind::PriceUpdate, 0, &Policy::default()).is_ok());
        assert!(check(VersionedRecord::new(40, 2), OperationKind::Adjust, 0, &Policy::default()).is_ok());
    }

    #[test]
    fn override_requires_policy_opt_in() {
        let record = VersionedRecord::new(100, 1);
        let op = op_on(record, OperationKind::Increase, 5).with_override_reason("stuck holder");
        let validator = BusinessRuleValidator::new();

        assert_eq!(
            validator.validate(&op, &record, &Policy::default()).errors,
            vec![RuleViolation::OverrideNotPermitted]
        );
        assert!(
            validator
                .validate(&op, &record, &Policy::default().allowing_emergency_override())
                .is_ok()
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            .. ProptestConfig::default()
        })]

        #[test]
        fn accepted_decreases_never_go_negative(quantity in 0i64..10_000, delta in 1i64..20_000) {
            let record = VersionedRecord::new(quantity, 1);
            let result = check(record, OperationKind::Decrease, delta, &Policy::default());
            prop_assert_eq!(result.is_ok(), delta <= quantity);
        }

        #[test]
        fn non_adjustment_kinds_require_positive_delta(delta in -1_000i64..=0) {
            let record = VersionedRecord::new(1_000_000, 1);
            for kind in [OperationKind::Increase, OperationKind::Decrease, OperationKind::Reserve, OperationKind::Release] {
                let result = check(record, kind, delta, &Policy::default());
                let expected = RuleViolation::NonPositiveDelta { kind, delta };
                prop_assert!(result.errors.contains(&expected));
            }
        }
    }
}
