//! Errors raised while constructing core primitives.

use thiserror::Error;

/// A primitive could not be built from its input.
///
/// Coordination failures (conflicts, timeouts, storage) have their own
/// taxonomy in the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A resource key segment or the key's textual form was malformed.
    #[error("invalid resource key: {0}")]
    InvalidKey(String),

    /// An identifier did not parse as a UUID.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
