//! Cross-resource lock coordination.
//!
//! This is the only place in the crate that takes resource locks. Operations
//! that touch several resources describe them as a [`LockChain`]; the
//! [`Coordinator`] acquires the chain in canonical order and hands back a
//! [`ChainGuard`] that releases everything in reverse order when dropped.
//!
//! # Acquisition protocol
//!
//! [`Coordinator::try_acquire`] runs in two phases:
//!
//! 1. **Acquire** - try-lock every resource in canonical order. The first lock
//!    that is already held aborts the attempt; guards taken so far are dropped
//!    in reverse order and `Busy { resource }` names the culprit.
//! 2. **Validate** - with every lock held, re-check each resource's status.
//!    A lock can be free for an instant while a status is still settling, so a
//!    busy status aborts the attempt exactly like a held lock.
//!
//! Nothing is mutated before both phases succeed, so a busy abort leaves the
//! system exactly as it found it.
//!
//! Because [`LockChain`] always sorts its members, and [`ChainGuard::try_extend`]
//! refuses to go backwards, no code path can take two locks out of order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::resource::{LockSet, Resource, ResourceGuard};
use crate::status::StatusBoard;

/// An ordered subset of resources, always in canonical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockChain {
    resources: Vec<Resource>,
}

impl LockChain {
    /// Builds a chain from any collection; order and duplicates are normalized.
    pub fn new(resources: impl IntoIterator<Item = Resource>) -> Self {
        let mut resources: Vec<Resource> = resources.into_iter().collect();
        resources.sort_by_key(|r| r.rank());
        resources.dedup();
        Self { resources }
    }

    pub fn single(resource: Resource) -> Self {
        Self {
            resources: vec![resource],
        }
    }

    /// Every resource, used by operations such as moving the server directory.
    pub fn all() -> Self {
        Self::new(Resource::ALL)
    }

    /// Returns this chain with `resource` added in its canonical position.
    pub fn with(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        Self::new(self.resources)
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn contains(&self, resource: Resource) -> bool {
        self.resources.contains(&resource)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Receives every acquire and release made through a [`Coordinator`].
///
/// `attempt` identifies one acquisition attempt (one chain guard), so an
/// observer can check that each attempt took its locks in increasing rank.
pub trait LockObserver: Send + Sync {
    fn acquired(&self, attempt: u64, resource: Resource);
    fn released(&self, attempt: u64, resource: Resource);
}

/// Owner of the four resource locks.
pub struct Coordinator {
    locks: LockSet,
    statuses: Arc<StatusBoard>,
    observer: Option<Arc<dyn LockObserver>>,
    next_attempt: AtomicU64,
}

impl Coordinator {
    pub fn new(statuses: Arc<StatusBoard>) -> Self {
        Self {
            locks: LockSet::new(),
            statuses,
            observer: None,
            next_attempt: AtomicU64::new(1),
        }
    }

    /// Same as [`Coordinator::new`] but reports lock traffic to `observer`.
    pub fn with_observer(statuses: Arc<StatusBoard>, observer: Arc<dyn LockObserver>) -> Self {
        Self {
            observer: Some(observer),
            ..Self::new(statuses)
        }
    }

    pub fn statuses(&self) -> &Arc<StatusBoard> {
        &self.statuses
    }

    /// Snapshot of whether `resource`'s lock is currently taken.
    pub fn is_locked(&self, resource: Resource) -> bool {
        self.locks.get(resource).is_held()
    }

    /// Acquire-all-or-nothing without waiting. See the module docs.
    pub fn try_acquire(&self, chain: &LockChain) -> ControlResult<ChainGuard> {
        let mut held = self.empty_guard();

        for &resource in chain.resources() {
            match self.locks.get(resource).try_acquire() {
                Some(guard) => held.push(guard),
                None => {
                    debug!("🔒 {} locked, releasing {:?}", resource, held.resources());
                    return Err(ControlError::Busy { resource });
                }
            }
        }

        for &resource in chain.resources() {
            if self.statuses.is_busy(resource) {
                debug!("🔒 {} lock free but status busy, aborting", resource);
                return Err(ControlError::Busy { resource });
            }
        }

        Ok(held)
    }

    /// Waits for every lock in the chain, in canonical order.
    ///
    /// Reserved for background tasks that own the resources involved, such as
    /// the watchdog's crash monitor. Interactive callers use
    /// [`Coordinator::try_acquire`].
    pub async fn acquire(&self, chain: &LockChain) -> ChainGuard {
        let mut held = self.empty_guard();
        for &resource in chain.resources() {
            let guard = self.locks.get(resource).acquire().await;
            held.push(guard);
        }
        held
    }

    fn empty_guard(&self) -> ChainGuard {
        ChainGuard {
            attempt: self.next_attempt.fetch_add(1, Ordering::Relaxed),
            guards: Vec::with_capacity(Resource::ALL.len()),
            highest: None,
            observer: self.observer.clone(),
        }
    }
}

/// The locks held by one acquisition attempt.
///
/// Dropping the guard releases every remaining lock in reverse order.
pub struct ChainGuard {
    attempt: u64,
    guards: Vec<ResourceGuard>,
    highest: Option<Resource>,
    observer: Option<Arc<dyn LockObserver>>,
}

impl ChainGuard {
    fn push(&mut self, guard: ResourceGuard) {
        let resource = guard.resource();
        if let Some(observer) = &self.observer {
            observer.acquired(self.attempt, resource);
        }
        self.highest = Some(resource);
        self.guards.push(guard);
    }

    /// The guard for `resource`, if this chain holds it.
    pub fn guard(&self, resource: Resource) -> Option<&ResourceGuard> {
        self.guards.iter().find(|g| g.resource() == resource)
    }

    pub fn holds(&self, resource: Resource) -> bool {
        self.guard(resource).is_some()
    }

    /// Resources currently held, in acquisition order.
    pub fn resources(&self) -> Vec<Resource> {
        self.guards.iter().map(|g| g.resource()).collect()
    }

    /// Releases one lock before the rest of the chain.
    ///
    /// Returns `false` when the lock was not held.
    pub fn release(&mut self, resource: Resource) -> bool {
        let Some(index) = self.guards.iter().position(|g| g.resource() == resource) else {
            return false;
        };
        let guard = self.guards.remove(index);
        self.notify_released(resource);
        drop(guard);
        true
    }

    /// Try-acquires one more resource ranked after everything this attempt
    /// has taken so far.
    pub fn try_extend(&mut self, coordinator: &Coordinator, resource: Resource) -> ControlResult<()> {
        if let Some(highest) = self.highest {
            if resource.rank() <= highest.rank() {
                return Err(ControlError::LockOrder {
                    held: highest,
                    requested: resource,
                });
            }
        }

        let guard = coordinator
            .locks
            .get(resource)
            .try_acquire()
            .ok_or(ControlError::Busy { resource })?;
        self.push(guard);

        if coordinator.statuses.is_busy(resource) {
            self.release(resource);
            return Err(ControlError::Busy { resource });
        }
        Ok(())
    }

    fn notify_released(&self, resource: Resource) {
        if let Some(observer) = &self.observer {
            observer.released(self.attempt, resource);
        }
    }
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            self.notify_released(guard.resource());
            drop(guard);
        }
    }
}
