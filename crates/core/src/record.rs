//! Resource keys and versioned records.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The contention boundary: one mutable unit of inventory state.
///
/// Rendered as `entity/scope` or `entity/scope/variant`. Immutable once derived
/// from a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    entity_id: String,
    scope_id: String,
    variant_id: Option<String>,
}

impl ResourceKey {
    pub fn new(entity_id: impl Into<String>, scope_id: impl Into<String>) -> Result<Self, DomainError> {
        Self::build(entity_id.into(), scope_id.into(), None)
    }

    pub fn with_variant(
        entity_id: impl Into<String>,
        scope_id: impl Into<String>,
        variant_id: impl Into<String>,
    ) -> Result<Self, DomainError> {
        Self::build(entity_id.into(), scope_id.into(), Some(variant_id.into()))
    }

    fn build(entity_id: String, scope_id: String, variant_id: Option<String>) -> Result<Self, DomainError> {
        check_segment("entity_id", &entity_id)?;
        check_segment("scope_id", &scope_id)?;
        if let Some(v) = &variant_id {
            check_segment("variant_id", v)?;
        }
        Ok(Self {
            entity_id,
            scope_id,
            variant_id,
        })
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn variant_id(&self) -> Option<&str> {
        self.variant_id.as_deref()
    }
}

fn check_segment(field: &str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::invalid_key(format!("{field} cannot be empty")));
    }
    if value.contains('/') {
        return Err(DomainError::invalid_key(format!("{field} cannot contain '/'")));
    }
    Ok(())
}

impl core::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.entity_id, self.scope_id)?;
        if let Some(v) = &self.variant_id {
            write!(f, "/{v}")?;
        }
        Ok(())
    }
}

impl FromStr for ResourceKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [entity, scope] => Self::new(*entity, *scope),
            [entity, scope, variant] => Self::with_variant(*entity, *scope, *variant),
            _ => Err(DomainError::invalid_key(format!(
                "expected 'entity/scope[/variant]', got '{s}'"
            ))),
        }
    }
}

/// Current state of a resource as owned by the storage layer.
///
/// `version` increments by exactly one on every successful write.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub quantity: i64,
    pub version: u64,
}

impl VersionedRecord {
    pub fn new(quantity: i64, version: u64) -> Self {
        Self { quantity, version }
    }

    /// The record that results from a successful write of `quantity`.
    pub fn next(&self, quantity: i64) -> Self {
        Self {
            quantity,
            version: self.version + 1,
        }
    }
}
