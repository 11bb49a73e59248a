use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use stockguard_core::{LockId, OperationId, ResourceKey};

use super::distributed::{DistributedLock, DistributedLockError};
use crate::context::{Interrupted, OperationContext};

/// Default lease TTL for the distributed lock.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock wait interrupted: {0}")]
    Interrupted(Interrupted),

    #[error(transparent)]
    Distributed(#[from] DistributedLockError),
}

/// Result of an acquisition attempt.
#[derive(Debug)]
pub enum Acquire<'a> {
    Acquired(LockGuard<'a>),
    /// The key is held and the caller did not ask to wait.
    Conflict { holders: Vec<OperationId> },
    /// The key stayed held for the whole wait.
    Timeout { holders: Vec<OperationId> },
}

#[derive(Debug, Default)]
struct SlotState {
    holders: BTreeSet<OperationId>,
    lease: Option<(OperationId, LockId)>,
}

#[derive(Debug, Default)]
struct KeySlot {
    state: Mutex<SlotState>,
    released: Condvar,
}

enum Lease {
    Taken(Option<LockId>),
    Busy,
}

/// Tracks, per resource key, the operations currently holding it.
///
/// Slots live in a sharded map, so unrelated keys never share a mutex. Waiters
/// park on a per-key condition variable.
pub struct LockCoordinator {
    slots: DashMap<ResourceKey, Arc<KeySlot>>,
    distributed: Option<Arc<dyn DistributedLock>>,
    lease_ttl: Duration,
}

impl core::fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("keys", &self.slots.len())
            .field("distributed", &self.distributed.is_some())
            .field("lease_ttl", &self.lease_ttl)
            .finish()
    }
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl LockCoordinator {
    /// Single-instance coordinator (no distributed lock).
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            distributed: None,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_distributed(lock: Arc<dyn DistributedLock>, lease_ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            distributed: Some(lock),
            lease_ttl,
        }
    }

    fn slot(&self, key: &ResourceKey) -> Arc<KeySlot> {
        self.slots.entry(key.clone()).or_default().value().clone()
    }

    fn take_lease(&self, key: &ResourceKey) -> Result<Lease, LockError> {
        match &self.distributed {
            None => Ok(Lease::Taken(None)),
            Some(lock) => Ok(match lock.try_acquire(key, self.lease_ttl)? {
                Some(id) => Lease::Taken(Some(id)),
                None => Lease::Busy,
            }),
        }
    }

    /// Acquire `key` for `operation_id`.
    ///
    /// With `wait = None` this never blocks and reports `Conflict` when the key
    /// is held. With `Some(timeout)` it parks until the key frees up, the
    /// timeout (clamped to the context deadline) elapses, or the context is
    /// cancelled.
    pub fn acquire(
        &self,
        key: &ResourceKey,
        operation_id: OperationId,
        wait: Option<Duration>,
        ctx: &OperationContext,
    ) -> Result<Acquire<'_>, LockError> {
        let slot = self.slot(key);
        let deadline = wait.map(|w| Instant::now() + ctx.bound(w));
        let mut state = slot.state.lock();

        loop {
            if state.holders.is_empty() {
                if let Lease::Taken(lease) = self.take_lease(key)? {
                    state.holders.insert(operation_id);
                    state.lease = lease.map(|id| (operation_id, id));
                    debug!(resource_key = %key, operation_id = %operation_id, "lock acquired");
                    return Ok(Acquire::Acquired(LockGuard::new(self, key.clone(), operation_id)));
                }
            }

            let holders: Vec<OperationId> = state.holders.iter().copied().collect();
            let Some(deadline) = deadline else {
                return Ok(Acquire::Conflict { holders });
            };

            if ctx.is_cancelled() {
                return Err(LockError::Interrupted(Interrupted::Cancelled));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Acquire::Timeout { holders });
            }
            // Bounded wait: a remote lease holder cannot notify us.
            let slice = (deadline - now).min(OperationContext::wait_slice());
            slot.released.wait_for(&mut state, slice);
        }
    }

    /// Join the holders of `key` without waiting for the current ones.
    ///
    /// Breaks mutual exclusion on purpose; callers must audit every use.
    pub fn acquire_override(&self, key: &ResourceKey, operation_id: OperationId) -> Result<LockGuard<'_>, LockError> {
        let slot = self.slot(key);
        let mut state = slot.state.lock();

        if state.lease.is_none() {
            if let Lease::Taken(Some(id)) = self.take_lease(key)? {
                state.lease = Some((operation_id, id));
            }
        }
        let displaced: Vec<OperationId> = state.holders.iter().copied().collect();
        state.holders.insert(operation_id);
        warn!(
            resource_key = %key,
            operation_id = %operation_id,
            displaced = ?displaced,
            "lock taken by emergency override"
        );
        Ok(LockGuard::new(self, key.clone(), operation_id))
    }

    /// Remove `operation_id` from the holders of `key`. Idempotent.
    ///
    /// The distributed lease is cleared only when this operation owns it.
    pub fn release(&self, key: &ResourceKey, operation_id: OperationId) -> Result<bool, LockError> {
        let Some(slot) = self.slots.get(key).map(|s| s.value().clone()) else {
            return Ok(false);
        };

        let (removed, lease) = {
            let mut state = slot.state.lock();
            let removed = state.holders.remove(&operation_id);
            let lease = match state.lease {
                Some((owner, id)) if owner == operation_id => {
                    state.lease = None;
                    Some(id)
                }
                _ => None,
            };
            (removed, lease)
        };
        slot.released.notify_all();
        drop(slot);

        let mut outcome = Ok(removed);
        if let (Some(id), Some(lock)) = (lease, &self.distributed) {
            if let Err(e) = lock.release(key, id) {
                outcome = Err(LockError::from(e));
            }
        }

        // Drop idle slots; a slot referenced elsewhere is still in use.
        self.slots
            .remove_if(key, |_, s| Arc::strong_count(s) == 1 && s.state.lock().holders.is_empty());

        if removed {
            debug!(resource_key = %key, operation_id = %operation_id, "lock released");
        }
        outcome
    }

    pub fn holders(&self, key: &ResourceKey) -> Vec<OperationId> {
        self.slots
            .get(key)
            .map(|s| s.state.lock().holders.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_locked(&self, key: &ResourceKey) -> bool {
        !self.holders(key).is_empty()
    }
}

/// Held lock on one key. Released on drop, including during unwinding.
#[derive(Debug)]
pub struct LockGuard<'a> {
    coordinator: &'a LockCoordinator,
    key: ResourceKey,
    operation_id: OperationId,
    acquired_at: Instant,
    released: bool,
}

impl<'a> LockGuard<'a> {
    fn new(coordinator: &'a LockCoordinator, key: ResourceKey, operation_id: OperationId) -> Self {
        Self {
            coordinator,
            key,
            operation_id,
            acquired_at: Instant::now(),
            released: false,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Release explicitly and report how long the lock was held.
    pub fn release(mut self) -> Result<Duration, LockError> {
        self.released = true;
        let held = self.held_for();
        self.coordinator.release(&self.key, self.operation_id)?;
        Ok(held)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.coordinator.release(&self.key, self.operation_id) {
            warn!(
                resource_key = %self.key,
                operation_id = %self.operation_id,
                error = %e,
                "failed to release lock on drop"
            );
        }
    }
}
