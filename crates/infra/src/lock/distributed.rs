use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use stockguard_core::{LockId, ResourceKey};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DistributedLockError {
    #[error("distributed lock backend failure: {0}")]
    Backend(String),
}

/// Cluster-wide TTL lock, required only for multi-instance deployments.
///
/// Leases expire on their own so a crashed holder cannot wedge a key. Expiry is
/// a liveness safeguard only.
pub trait DistributedLock: Send + Sync {
    /// Returns `Some(lock_id)` when acquired, `None` when the key is busy.
    fn try_acquire(&self, key: &ResourceKey, ttl: Duration) -> Result<Option<LockId>, DistributedLockError>;

    /// Release a lease. Only the matching `lock_id` clears it; returns whether
    /// anything was released.
    fn release(&self, key: &ResourceKey, lock_id: LockId) -> Result<bool, DistributedLockError>;
}

impl<L> DistributedLock for Arc<L>
where
    L: DistributedLock + ?Sized,
{
    fn try_acquire(&self, key: &ResourceKey, ttl: Duration) -> Result<Option<LockId>, DistributedLockError> {
        (**self).try_acquire(key, ttl)
    }

    fn release(&self, key: &ResourceKey, lock_id: LockId) -> Result<bool, DistributedLockError> {
        (**self).release(key, lock_id)
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    lock_id: LockId,
    expires_at: Instant,
}

/// Single-process stand-in for a cluster lock service (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryDistributedLock {
    leases: DashMap<ResourceKey, Lease>,
}

impl InMemoryDistributedLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &ResourceKey) -> bool {
        self.leases
            .get(key)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }
}

impl DistributedLock for InMemoryDistributedLock {
    fn try_acquire(&self, key: &ResourceKey, ttl: Duration) -> Result<Option<LockId>, DistributedLockError> {
        let now = Instant::now();
        let lease = Lease {
            lock_id: LockId::new(),
            expires_at: now + ttl,
        };

        match self.leases.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at > now {
                    return Ok(None);
                }
                entry.insert(lease);
            }
            Entry::Vacant(entry) => {
                entry.insert(lease);
            }
        }
        Ok(Some(lease.lock_id))
    }

    fn release(&self, key: &ResourceKey, lock_id: LockId) -> Result<bool, DistributedLockError> {
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.lock_id == lock_id)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ResourceKey {
        ResourceKey::new("P1", "S1").unwrap()
    }

    #[test]
    fn second_acquire_is_busy_until_release() {
        let lock = InMemoryDistributedLock::new();
        let id = lock.try_acquire(&key(), Duration::from_secs(30)).unwrap().unwrap();

        assert_eq!(lock.try_acquire(&key(), Duration::from_secs(30)).unwrap(), None);
        assert!(lock.release(&key(), id).unwrap());
        assert!(lock.try_acquire(&key(), Duration::from_secs(30)).unwrap().is_some());
    }

    #[test]
    fn release_with_foreign_lock_id_is_ignored() {
        let lock = InMemoryDistributedLock::new();
        lock.try_acquire(&key(), Duration::from_secs(30)).unwrap().unwrap();

        assert!(!lock.release(&key(), LockId::new()).unwrap());
        assert!(lock.is_held(&key()));
    }

    #[test]
    fn expired_leases_can_be_taken_over() {
        let lock = InMemoryDistributedLock::new();
        let stale = lock.try_acquire(&key(), Duration::from_millis(5)).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let fresh = lock.try_acquire(&key(), Duration::from_secs(30)).unwrap().unwrap();
        assert_ne!(stale, fresh);
        // The crashed holder's late release must not clear the new lease.
        assert!(!lock.release(&key(), stale).unwrap());
        assert!(lock.is_held(&key()));
    }
}
