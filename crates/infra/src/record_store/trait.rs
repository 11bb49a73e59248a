use std::sync::Arc;

use thiserror::Error;

use stockguard_core::{ResourceKey, VersionedRecord};

/// Record store operation error.
///
/// `VersionMismatch` is not a failure of the store: it is the optimistic
/// concurrency signal and the coordinator always routes it back through
/// conflict resolution. Everything else is a storage failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordStoreError {
    #[error("record not found: {0}")]
    NotFound(ResourceKey),

    #[error("version mismatch on {key}: expected {expected}, found {actual}")]
    VersionMismatch {
        key: ResourceKey,
        expected: u64,
        actual: u64,
    },

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Access to `(quantity, version)` records with an atomic versioned write.
///
/// ## Contract
///
/// - `read` returns the latest committed record for a key.
/// - `write_if_version` applies `new_quantity` only if the stored version equals
///   `expected_version`, and returns the new version, which is exactly
///   `expected_version + 1`.
/// - Concurrent writers with the same expectation: at most one succeeds, the
///   others observe `VersionMismatch`.
/// - Writes never create records; a missing key is `NotFound`.
///
/// Backed by any transactional store supporting optimistic version columns.
pub trait RecordStore: Send + Sync {
    fn read(&self, key: &ResourceKey) -> Result<VersionedRecord, RecordStoreError>;

    fn write_if_version(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        new_quantity: i64,
    ) -> Result<u64, RecordStoreError>;
}

impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    fn read(&self, key: &ResourceKey) -> Result<VersionedRecord, RecordStoreError> {
        (**self).read(key)
    }

    fn write_if_version(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        new_quantity: i64,
    ) -> Result<u64, RecordStoreError> {
        (**self).write_if_version(key, expected_version, new_quantity)
    }
}
