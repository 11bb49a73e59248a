//! `stockguard-core`: shared primitives for versioned inventory records.
//!
//! This crate contains **pure** building blocks (no infrastructure concerns):
//! identifiers, resource keys, versioned records and the domain error model.

pub mod error;
pub mod id;
pub mod record;

pub use error::DomainError;
pub use id::{ActorId, ConflictId, LockId, OperationId};
pub use record::{ResourceKey, VersionedRecord};
