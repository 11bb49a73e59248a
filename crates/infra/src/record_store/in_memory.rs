use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use stockguard_core::{ResourceKey, VersionedRecord};

use super::r#trait::{RecordStore, RecordStoreError};

/// In-memory record store with deterministic CAS semantics.
///
/// Keeps every committed version per key so tests can inspect the history.
/// Sharded by key; writes to different keys never contend.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: DashMap<ResourceKey, Vec<VersionedRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed (or replace) a record.
    pub fn insert(&self, key: ResourceKey, record: VersionedRecord) {
        self.records.insert(key, vec![record]);
    }

    pub fn with_record(self, key: ResourceKey, record: VersionedRecord) -> Self {
        self.insert(key, record);
        self
    }

    /// Every record the key has held, oldest first.
    pub fn history(&self, key: &ResourceKey) -> Vec<VersionedRecord> {
        self.records.get(key).map(|h| h.value().clone()).unwrap_or_default()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn read(&self, key: &ResourceKey) -> Result<VersionedRecord, RecordStoreError> {
        self.records
            .get(key)
            .and_then(|history| history.last().copied())
            .ok_or_else(|| RecordStoreError::NotFound(key.clone()))
    }

    fn write_if_version(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        new_quantity: i64,
    ) -> Result<u64, RecordStoreError> {
        // The entry guard holds the shard lock for the whole check-and-set.
        match self.records.entry(key.clone()) {
            Entry::Vacant(_) => Err(RecordStoreError::NotFound(key.clone())),
            Entry::Occupied(mut entry) => {
                let history = entry.get_mut();
                let current = history
                    .last()
                    .copied()
                    .ok_or_else(|| RecordStoreError::Backend(format!("empty history for {key}")))?;

                if current.version != expected_version {
                    return Err(RecordStoreError::VersionMismatch {
                        key: key.clone(),
                        expected: expected_version,
                        actual: current.version,
                    });
                }

                let next = current.next(new_quantity);
                history.push(next);
                Ok(next.version)
            }
        }
    }
}
