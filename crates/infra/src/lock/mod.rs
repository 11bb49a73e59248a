//! Per-key lock coordination (in-process holders + optional cluster lease).
//!
//! The lock only reduces wasted work under contention. Correctness comes from
//! the versioned write in the record store, which always runs.

pub mod coordinator;
pub mod distributed;

pub use coordinator::{Acquire, LockCoordinator, LockError, LockGuard};
pub use distributed::{DistributedLock, DistributedLockError, InMemoryDistributedLock};
