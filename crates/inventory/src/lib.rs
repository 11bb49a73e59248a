//! Inventory mutation domain (policies, operations, rules, conflicts).
//!
//! This crate contains the business rules for coordinating writes to versioned
//! inventory records, implemented purely as deterministic domain logic (no IO,
//! no locks, no storage).

pub mod conflict;
pub mod operation;
pub mod policy;
pub mod validation;

pub use conflict::{ConflictCause, ConflictRecord, ConflictResolver, Resolution, merge_quantity};
pub use operation::{InvalidTransition, Operation, OperationKind, OperationStatus};
pub use policy::{ConflictResolution, MergeStrategy, Policy, PolicyDocument, PolicyError, PolicyRegistry};
pub use validation::{BusinessRuleValidator, RuleViolation, ValidationResult};
