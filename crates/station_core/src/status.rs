//! Per-resource status, readable without locking.
//!
//! Status polls from RPC clients must never block behind a long job, so every
//! status lives in a [`StatusCell`] backed by an atomic. Reads are plain
//! snapshots. Writes go through [`StatusCell::set`], which demands the
//! [`ResourceGuard`] of the matching resource: only the holder of a resource's
//! lock can move its status, which keeps transitions within a job ordered for
//! every concurrent reader.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::coordinator::ChainGuard;
use crate::job::JobRecord;
use crate::resource::{Resource, ResourceGuard};

/// A status enum belonging to one resource.
pub trait ResourceStatus: Copy + PartialEq + Send + Sync + 'static {
    /// The resource whose lock must be held to write this status.
    const RESOURCE: Resource;

    /// Whether this state means a job is in flight.
    fn is_busy(self) -> bool;

    fn to_raw(self) -> u8;

    fn from_raw(raw: u8) -> Self;
}

/// Atomic status slot for one resource.
pub struct StatusCell<S: ResourceStatus> {
    raw: AtomicU8,
    _status: PhantomData<S>,
}

impl<S: ResourceStatus> StatusCell<S> {
    pub fn new(initial: S) -> Self {
        Self {
            raw: AtomicU8::new(initial.to_raw()),
            _status: PhantomData,
        }
    }

    /// Lock-free snapshot of the current status.
    pub fn get(&self) -> S {
        S::from_raw(self.raw.load(Ordering::Acquire))
    }

    pub fn is_busy(&self) -> bool {
        self.get().is_busy()
    }

    /// Moves to `status`. The caller must hold this resource's lock.
    pub fn set(&self, guard: &ResourceGuard, status: S) {
        if guard.resource() != S::RESOURCE {
            error!(
                "❌ Refusing {} status write while holding the {} lock",
                S::RESOURCE,
                guard.resource()
            );
            debug_assert!(false, "status written with the wrong guard");
            return;
        }
        self.raw.store(status.to_raw(), Ordering::Release);
    }

    /// Same as [`StatusCell::set`], taking the guard out of a lock chain.
    pub fn set_held(&self, locks: &ChainGuard, status: S) {
        match locks.guard(S::RESOURCE) {
            Some(guard) => self.set(guard, status),
            None => {
                error!("❌ {} status write without holding its lock", S::RESOURCE);
                debug_assert!(false, "status written without the resource lock");
            }
        }
    }
}

/// Compiler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilerStatus {
    Uninitialized,
    Initializing,
    Initialized,
    Compiling,
    Compiled,
    Error,
}

impl ResourceStatus for CompilerStatus {
    const RESOURCE: Resource = Resource::Compiler;

    fn is_busy(self) -> bool {
        matches!(self, CompilerStatus::Initializing | CompilerStatus::Compiling)
    }

    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => CompilerStatus::Uninitialized,
            1 => CompilerStatus::Initializing,
            2 => CompilerStatus::Initialized,
            3 => CompilerStatus::Compiling,
            4 => CompilerStatus::Compiled,
            _ => CompilerStatus::Error,
        }
    }
}

/// State of the supervised game-server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogStatus {
    Offline,
    HardRebooting,
    Online,
}

impl ResourceStatus for WatchdogStatus {
    const RESOURCE: Resource = Resource::Watchdog;

    fn is_busy(self) -> bool {
        self == WatchdogStatus::HardRebooting
    }

    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => WatchdogStatus::Offline,
            1 => WatchdogStatus::HardRebooting,
            _ => WatchdogStatus::Online,
        }
    }
}

/// Runtime installer state.
///
/// `Staged` and `Error` are stable: a new install may start from either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Idle,
    Downloading,
    Staging,
    /// A new runtime waits for the next watchdog reboot.
    Staged,
    Error,
}

impl ResourceStatus for RuntimeStatus {
    const RESOURCE: Resource = Resource::RuntimeInstall;

    fn is_busy(self) -> bool {
        matches!(self, RuntimeStatus::Downloading | RuntimeStatus::Staging)
    }

    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => RuntimeStatus::Idle,
            1 => RuntimeStatus::Downloading,
            2 => RuntimeStatus::Staging,
            3 => RuntimeStatus::Staged,
            _ => RuntimeStatus::Error,
        }
    }
}

/// What the repository is doing while busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoOperation {
    Setup,
    Update,
    Reset,
    Checkout,
    Merge,
    Commit,
    Push,
    Snapshot,
    /// The whole server directory is being moved.
    Relocate,
}

impl RepoOperation {
    const ALL: [RepoOperation; 9] = [
        RepoOperation::Setup,
        RepoOperation::Update,
        RepoOperation::Reset,
        RepoOperation::Checkout,
        RepoOperation::Merge,
        RepoOperation::Commit,
        RepoOperation::Push,
        RepoOperation::Snapshot,
        RepoOperation::Relocate,
    ];
}

/// Repository state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "operation")]
pub enum RepositoryStatus {
    NotCloned,
    Idle,
    Busy(RepoOperation),
}

impl ResourceStatus for RepositoryStatus {
    const RESOURCE: Resource = Resource::Repository;

    fn is_busy(self) -> bool {
        matches!(self, RepositoryStatus::Busy(_))
    }

    fn to_raw(self) -> u8 {
        match self {
            RepositoryStatus::NotCloned => 0,
            RepositoryStatus::Idle => 1,
            RepositoryStatus::Busy(op) => 2 + op as u8,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => RepositoryStatus::NotCloned,
            1 => RepositoryStatus::Idle,
            n => RepoOperation::ALL
                .get((n - 2) as usize)
                .map(|op| RepositoryStatus::Busy(*op))
                .unwrap_or(RepositoryStatus::Idle),
        }
    }
}

/// All four status cells, shared by every subsystem and the coordinator.
pub struct StatusBoard {
    pub repository: StatusCell<RepositoryStatus>,
    pub runtime: StatusCell<RuntimeStatus>,
    pub compiler: StatusCell<CompilerStatus>,
    pub watchdog: StatusCell<WatchdogStatus>,
}

impl StatusBoard {
    pub fn new(
        repository: RepositoryStatus,
        runtime: RuntimeStatus,
        compiler: CompilerStatus,
        watchdog: WatchdogStatus,
    ) -> Self {
        Self {
            repository: StatusCell::new(repository),
            runtime: StatusCell::new(runtime),
            compiler: StatusCell::new(compiler),
            watchdog: StatusCell::new(watchdog),
        }
    }

    /// Busy predicate of `resource`'s current status.
    pub fn is_busy(&self, resource: Resource) -> bool {
        match resource {
            Resource::Repository => self.repository.is_busy(),
            Resource::RuntimeInstall => self.runtime.is_busy(),
            Resource::Compiler => self.compiler.is_busy(),
            Resource::Watchdog => self.watchdog.is_busy(),
        }
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new(
            RepositoryStatus::NotCloned,
            RuntimeStatus::Idle,
            CompilerStatus::Uninitialized,
            WatchdogStatus::Offline,
        )
    }
}

/// Serializable view of every resource, returned by the `status` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub repository: RepositoryStatus,
    pub runtime: RuntimeStatus,
    pub compiler: CompilerStatus,
    pub watchdog: WatchdogStatus,
    /// Last job per resource, if any ran since the service started.
    pub jobs: Vec<JobRecord>,
}
