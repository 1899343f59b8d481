//! Job dispatch: one in-flight job per resource, busy instead of queued.
//!
//! A [`Job`] describes a unit of work bound to a primary [`Resource`]. The
//! [`JobRunner`] acquires the job's [`LockChain`] through the
//! [`Coordinator`], lets the job flip its status to the busy variant, and then
//! either
//!
//! * returns a [`JobTicket`] immediately and finishes the work on a tokio task
//!   ([`JobRunner::spawn`], used for setup, install and compile), or
//! * awaits the work inline and returns its result ([`JobRunner::run`], used
//!   for short operations such as commit and push).
//!
//! In both cases the locks stay held for the full duration of the job and are
//! released only after the job has written its terminal status. A second
//! request for a busy resource fails with [`ControlError::Busy`].
//!
//! Jobs are not cancellable by users. On service shutdown the runner cancels
//! its token; in-flight jobs are dropped at their next await point and
//! recorded as [`JobOutcome::Cancelled`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chat::ChatSink;
use crate::coordinator::{ChainGuard, Coordinator, LockChain};
use crate::error::{ControlError, ControlResult, ErrorKind};
use crate::resource::Resource;

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Setup,
    Update,
    Reset,
    Checkout,
    Commit,
    Push,
    MergePullRequest,
    InstallRuntime,
    Initialize,
    Compile,
    Start,
    Stop,
    Restart,
    SetSecurity,
    Move,
}

impl JobKind {
    /// The resource a job of this kind is bound to.
    pub fn resource(self) -> Resource {
        match self {
            JobKind::Setup
            | JobKind::Update
            | JobKind::Reset
            | JobKind::Checkout
            | JobKind::Commit
            | JobKind::Push
            | JobKind::MergePullRequest
            | JobKind::Move => Resource::Repository,
            JobKind::InstallRuntime => Resource::RuntimeInstall,
            JobKind::Initialize | JobKind::Compile | JobKind::SetSecurity => Resource::Compiler,
            JobKind::Start | JobKind::Stop | JobKind::Restart => Resource::Watchdog,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::Setup => "setup",
            JobKind::Update => "update",
            JobKind::Reset => "reset",
            JobKind::Checkout => "checkout",
            JobKind::Commit => "commit",
            JobKind::Push => "push",
            JobKind::MergePullRequest => "merge pull request",
            JobKind::InstallRuntime => "runtime install",
            JobKind::Initialize => "initialize",
            JobKind::Compile => "compile",
            JobKind::Start => "start",
            JobKind::Stop => "stop",
            JobKind::Restart => "restart",
            JobKind::SetSecurity => "set security",
            JobKind::Move => "move server directory",
        };
        f.write_str(name)
    }
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum JobOutcome {
    Succeeded { message: String },
    Failed { kind: ErrorKind, message: String },
    Cancelled,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }
}

/// The last job run on a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: u64,
    pub kind: JobKind,
    pub resource: Resource,
    /// 0-100, `None` while indeterminate.
    pub progress: Option<u8>,
    /// `None` while the job is still running.
    pub outcome: Option<JobOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn is_running(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Acknowledgement returned when a background job was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTicket {
    pub id: u64,
    pub kind: JobKind,
    pub resource: Resource,
}

/// A unit of work the [`JobRunner`] can dispatch.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn kind(&self) -> JobKind;

    /// Locks the job needs. The primary resource is always added.
    fn lock_chain(&self) -> LockChain {
        LockChain::single(self.kind().resource())
    }

    /// Called with the locks held before the dispatching call returns.
    /// Moves statuses to their busy variants.
    fn begin(&self, locks: &ChainGuard);

    /// The work itself.
    async fn run(&self, ctx: &mut JobContext) -> ControlResult<String>;

    /// Called with the remaining locks after `run` finished, failed, panicked
    /// or was cancelled. Moves statuses to a stable value.
    fn settle(&self, locks: &ChainGuard, outcome: &JobOutcome);
}

/// Everything a running job owns.
pub struct JobContext {
    pub locks: ChainGuard,
    pub progress: Progress,
    pub cancel: CancellationToken,
    coordinator: Arc<Coordinator>,
}

impl JobContext {
    /// Takes one more lock ranked after everything this job already took.
    pub fn extend(&mut self, resource: Resource) -> ControlResult<()> {
        self.locks.try_extend(&self.coordinator, resource)
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

/// Progress reporter handed to a running job.
#[derive(Clone)]
pub struct Progress {
    shared: Arc<JobShared>,
    resource: Resource,
    job_id: u64,
}

impl Progress {
    pub fn set(&self, percent: u8) {
        let mut slot = self.shared.records[self.resource.rank()].lock();
        if let Some(record) = slot.as_mut() {
            if record.id == self.job_id {
                record.progress = Some(percent.min(100));
            }
        }
    }
}

struct JobShared {
    coordinator: Arc<Coordinator>,
    records: [Mutex<Option<JobRecord>>; 4],
    next_id: AtomicU64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    chat: Arc<dyn ChatSink>,
}

/// Dispatches jobs and keeps the last record per resource.
pub struct JobRunner {
    shared: Arc<JobShared>,
}

impl JobRunner {
    pub fn new(coordinator: Arc<Coordinator>, chat: Arc<dyn ChatSink>) -> Self {
        Self {
            shared: Arc::new(JobShared {
                coordinator,
                records: Default::default(),
                next_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                chat,
            }),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.shared.coordinator
    }

    /// Starts `job` on a background task and returns as soon as it holds its
    /// locks.
    pub fn spawn(&self, job: Arc<dyn Job>) -> ControlResult<JobTicket> {
        let ctx = self.prepare(job.as_ref())?;
        let ticket = JobTicket {
            id: ctx.progress.job_id,
            kind: job.kind(),
            resource: job.kind().resource(),
        };

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let _ = execute(shared, job, ctx).await;
        });

        let mut tasks = self.shared.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);

        Ok(ticket)
    }

    /// Runs `job` to completion on the calling task.
    pub async fn run(&self, job: Arc<dyn Job>) -> ControlResult<String> {
        let ctx = self.prepare(job.as_ref())?;
        execute(self.shared.clone(), job, ctx).await
    }

    /// The last job recorded for `resource`.
    pub fn last(&self, resource: Resource) -> Option<JobRecord> {
        self.shared.records[resource.rank()].lock().clone()
    }

    /// Last records of every resource that ran a job.
    pub fn records(&self) -> Vec<JobRecord> {
        Resource::ALL
            .iter()
            .filter_map(|resource| self.last(*resource))
            .collect()
    }

    /// Progress of the job currently running on `resource`.
    pub fn progress(&self, resource: Resource) -> Option<u8> {
        self.last(resource)
            .filter(JobRecord::is_running)
            .and_then(|record| record.progress)
    }

    /// A token cancelled when the runner shuts down.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Waits for every background job to finish without cancelling them.
    pub async fn wait_idle(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.shared.tasks.lock());
        futures::future::join_all(tasks).await;
    }

    /// Cancels in-flight jobs, refuses new ones and waits for their tasks.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.wait_idle().await;
    }

    fn prepare(&self, job: &dyn Job) -> ControlResult<JobContext> {
        if self.shared.cancel.is_cancelled() {
            return Err(ControlError::ShuttingDown);
        }

        let kind = job.kind();
        let resource = kind.resource();
        let chain = job.lock_chain().with(resource);
        let locks = self.shared.coordinator.try_acquire(&chain)?;

        job.begin(&locks);

        let job_id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        *self.shared.records[resource.rank()].lock() = Some(JobRecord {
            id: job_id,
            kind,
            resource,
            progress: None,
            outcome: None,
            started_at: Utc::now(),
            finished_at: None,
        });
        info!("▶️ Started {} job #{} on the {}", kind, job_id, resource);

        Ok(JobContext {
            locks,
            progress: Progress {
                shared: self.shared.clone(),
                resource,
                job_id,
            },
            cancel: self.shared.cancel.child_token(),
            coordinator: self.shared.coordinator.clone(),
        })
    }
}

async fn execute(
    shared: Arc<JobShared>,
    job: Arc<dyn Job>,
    mut ctx: JobContext,
) -> ControlResult<String> {
    let kind = job.kind();
    let cancel = ctx.cancel.clone();

    let result = {
        let run = AssertUnwindSafe(job.run(&mut ctx)).catch_unwind();
        tokio::select! {
            _ = cancel.cancelled() => None,
            caught = run => Some(caught.unwrap_or_else(|_| {
                Err(ControlError::Internal(format!("{} job panicked", kind)))
            })),
        }
    };

    let outcome = match &result {
        None => JobOutcome::Cancelled,
        Some(Ok(message)) => JobOutcome::Succeeded {
            message: message.clone(),
        },
        Some(Err(err)) => JobOutcome::Failed {
            kind: err.kind(),
            message: err.to_string(),
        },
    };

    job.settle(&ctx.locks, &outcome);
    let job_id = ctx.progress.job_id;
    drop(ctx);

    // Recorded only once the locks are gone, so a finished record means the
    // resource is free again.
    {
        let mut slot = shared.records[kind.resource().rank()].lock();
        if let Some(record) = slot.as_mut() {
            if record.id == job_id {
                if outcome.is_success() {
                    record.progress = Some(100);
                }
                record.outcome = Some(outcome.clone());
                record.finished_at = Some(Utc::now());
            }
        }
    }

    match &outcome {
        JobOutcome::Succeeded { message } => {
            info!("✅ {} job finished: {}", kind, message);
            shared
                .chat
                .send_message(&format!("{} complete: {}", kind, message), true)
                .await;
        }
        JobOutcome::Failed { message, .. } => {
            error!("❌ {} job failed: {}", kind, message);
            shared
                .chat
                .send_message(&format!("{} failed: {}", kind, message), true)
                .await;
        }
        JobOutcome::Cancelled => {
            warn!("🛑 {} job cancelled by shutdown", kind);
        }
    }

    result.unwrap_or(Err(ControlError::ShuttingDown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::LogChat;
    use crate::status::{CompilerStatus, StatusBoard};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct GatedCompile {
        statuses: Arc<StatusBoard>,
        gate: Arc<Notify>,
        fail: bool,
    }

    #[async_trait]
    impl Job for GatedCompile {
        fn kind(&self) -> JobKind {
            JobKind::Compile
        }

        fn begin(&self, locks: &ChainGuard) {
            self.statuses.compiler.set_held(locks, CompilerStatus::Compiling);
        }

        async fn run(&self, ctx: &mut JobContext) -> ControlResult<String> {
            ctx.progress.set(40);
            self.gate.notified().await;
            if self.fail {
                return Err(ControlError::external("compiler", "syntax error"));
            }
            Ok("compiled".to_string())
        }

        fn settle(&self, locks: &ChainGuard, outcome: &JobOutcome) {
            let status = if outcome.is_success() {
                CompilerStatus::Compiled
            } else {
                CompilerStatus::Error
            };
            self.statuses.compiler.set_held(locks, status);
        }
    }

    struct Panicking;

    #[async_trait]
    impl Job for Panicking {
        fn kind(&self) -> JobKind {
            JobKind::Push
        }

        fn begin(&self, _locks: &ChainGuard) {}

        async fn run(&self, _ctx: &mut JobContext) -> ControlResult<String> {
            panic!("remote hung up");
        }

        fn settle(&self, _locks: &ChainGuard, _outcome: &JobOutcome) {}
    }

    fn runner() -> (JobRunner, Arc<StatusBoard>) {
        let statuses = Arc::new(StatusBoard::default());
        let coordinator = Arc::new(Coordinator::new(statuses.clone()));
        (JobRunner::new(coordinator, Arc::new(LogChat)), statuses)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_job_is_rejected_while_first_runs() {
        let (runner, statuses) = runner();
        let gate = Arc::new(Notify::new());
        let job = || {
            Arc::new(GatedCompile {
                statuses: statuses.clone(),
                gate: gate.clone(),
                fail: false,
            })
        };

        let ticket = runner.spawn(job()).expect("first job should start");
        assert_eq!(ticket.resource, Resource::Compiler);
        assert_eq!(statuses.compiler.get(), CompilerStatus::Compiling);

        let err = runner.spawn(job()).unwrap_err();
        assert!(matches!(err, ControlError::Busy { resource: Resource::Compiler }));

        wait_for(|| runner.progress(Resource::Compiler) == Some(40)).await;
        gate.notify_one();
        runner.wait_idle().await;

        assert_eq!(statuses.compiler.get(), CompilerStatus::Compiled);
        let record = runner.last(Resource::Compiler).unwrap();
        assert_eq!(record.id, ticket.id);
        assert_eq!(record.progress, Some(100));
        assert!(record.outcome.unwrap().is_success());

        gate.notify_one();
        assert!(runner.spawn(job()).is_ok());
        runner.wait_idle().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_job_returns_to_stable_status() {
        let (runner, statuses) = runner();
        let gate = Arc::new(Notify::new());
        gate.notify_one();

        let err = runner
            .run(Arc::new(GatedCompile {
                statuses: statuses.clone(),
                gate,
                fail: true,
            }))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ExternalTool);
        assert_eq!(statuses.compiler.get(), CompilerStatus::Error);
        assert!(!runner.coordinator().is_locked(Resource::Compiler));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_job_releases_lock() {
        let (runner, _) = runner();
        let err = runner.run(Arc::new(Panicking)).await.unwrap_err();
        assert!(matches!(err, ControlError::Internal(_)));
        assert!(!runner.coordinator().is_locked(Resource::Repository));
        assert!(matches!(
            runner.last(Resource::Repository).unwrap().outcome,
            Some(JobOutcome::Failed { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_cancels_running_jobs() {
        let (runner, statuses) = runner();
        runner
            .spawn(Arc::new(GatedCompile {
                statuses: statuses.clone(),
                gate: Arc::new(Notify::new()),
                fail: false,
            }))
            .unwrap();

        runner.shutdown().await;

        assert_eq!(
            runner.last(Resource::Compiler).unwrap().outcome,
            Some(JobOutcome::Cancelled)
        );
        assert_eq!(statuses.compiler.get(), CompilerStatus::Error);
        assert!(!runner.coordinator().is_locked(Resource::Compiler));

        let err = runner
            .spawn(Arc::new(GatedCompile {
                statuses,
                gate: Arc::new(Notify::new()),
                fail: false,
            }))
            .unwrap_err();
        assert!(matches!(err, ControlError::ShuttingDown));
    }
}
