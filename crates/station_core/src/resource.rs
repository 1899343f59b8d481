//! The four lock-guarded resources and their mutual-exclusion primitive.
//!
//! Every subsystem that mutates the shared server directory is represented by a
//! [`Resource`]. Each resource owns exactly one [`ResourceLock`]. Locks are
//! never queued for interactive callers: [`ResourceLock::try_acquire`] fails
//! immediately when the lock is held, and the caller reports "busy" instead of
//! waiting. The blocking [`ResourceLock::acquire`] is reserved for background
//! tasks that own the resource (for example the watchdog's crash monitor).
//!
//! # Canonical order
//!
//! Resources have a fixed rank:
//!
//! 1. [`Resource::Repository`]
//! 2. [`Resource::RuntimeInstall`]
//! 3. [`Resource::Compiler`]
//! 4. [`Resource::Watchdog`]
//!
//! Any code path holding more than one lock must have taken them in this
//! order. Call sites never do that by hand; they go through
//! [`Coordinator`](crate::coordinator::Coordinator).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One of the four guarded subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Repository,
    RuntimeInstall,
    Compiler,
    Watchdog,
}

impl Resource {
    /// All resources in canonical lock order.
    pub const ALL: [Resource; 4] = [
        Resource::Repository,
        Resource::RuntimeInstall,
        Resource::Compiler,
        Resource::Watchdog,
    ];

    /// Position in the canonical lock order.
    pub fn rank(self) -> usize {
        match self {
            Resource::Repository => 0,
            Resource::RuntimeInstall => 1,
            Resource::Compiler => 2,
            Resource::Watchdog => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Resource::Repository => "repository",
            Resource::RuntimeInstall => "runtime installer",
            Resource::Compiler => "compiler",
            Resource::Watchdog => "watchdog",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Non-reentrant mutual exclusion token for a single [`Resource`].
pub struct ResourceLock {
    resource: Resource,
    mutex: Arc<Mutex<()>>,
    held: Arc<AtomicBool>,
}

impl ResourceLock {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            mutex: Arc::new(Mutex::new(())),
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    /// Takes the lock if it is free. Never waits.
    ///
    /// A second call while the returned guard is alive fails, even from the
    /// same task.
    pub fn try_acquire(&self) -> Option<ResourceGuard> {
        let permit = self.mutex.clone().try_lock_owned().ok()?;
        Some(self.guard(permit))
    }

    /// Waits until the lock is free and takes it.
    ///
    /// Only background tasks that own the resource call this; RPC handlers
    /// always use [`ResourceLock::try_acquire`].
    pub async fn acquire(&self) -> ResourceGuard {
        let permit = self.mutex.clone().lock_owned().await;
        self.guard(permit)
    }

    /// Whether a guard is currently alive. A snapshot, may be stale immediately.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn guard(&self, permit: OwnedMutexGuard<()>) -> ResourceGuard {
        self.held.store(true, Ordering::Release);
        ResourceGuard {
            resource: self.resource,
            held: self.held.clone(),
            _permit: permit,
        }
    }
}

/// Proof that the holder owns a [`Resource`]'s lock.
///
/// The lock is released when the guard is dropped, on every exit path.
/// Status writes require a reference to the matching guard.
pub struct ResourceGuard {
    resource: Resource,
    held: Arc<AtomicBool>,
    _permit: OwnedMutexGuard<()>,
}

impl ResourceGuard {
    pub fn resource(&self) -> Resource {
        self.resource
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("resource", &self.resource)
            .finish()
    }
}

/// The process-wide set of resource locks, one per [`Resource`].
pub struct LockSet {
    locks: [ResourceLock; 4],
}

impl LockSet {
    pub fn new() -> Self {
        Self {
            locks: Resource::ALL.map(ResourceLock::new),
        }
    }

    pub fn get(&self, resource: Resource) -> &ResourceLock {
        &self.locks[resource.rank()]
    }
}

impl Default for LockSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_matches_all_order() {
        for (index, resource) in Resource::ALL.iter().enumerate() {
            assert_eq!(resource.rank(), index);
        }
        assert!(Resource::Repository < Resource::Watchdog);
    }

    #[tokio::test]
    async fn test_try_acquire_is_not_reentrant() {
        let lock = ResourceLock::new(Resource::Compiler);
        let guard = lock.try_acquire().expect("free lock should be acquired");
        assert!(lock.is_held());
        assert!(lock.try_acquire().is_none());

        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_blocking_acquire_waits_for_release() {
        let lock = Arc::new(ResourceLock::new(Resource::Watchdog));
        let guard = lock.try_acquire().unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let guard = lock.acquire().await;
                guard.resource()
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        let resource = waiter.await.unwrap();
        assert_eq!(resource, Resource::Watchdog);
    }

    #[test]
    fn test_guard_released_on_panic() {
        let lock = ResourceLock::new(Resource::Repository);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = lock.try_acquire().unwrap();
            panic!("job body failed");
        }));
        assert!(result.is_err());
        assert!(lock.try_acquire().is_some());
    }
}
