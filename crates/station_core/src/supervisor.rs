//! Watchdog for the game server process.
//!
//! The supervisor owns at most one child process. Its status moves
//! `Offline -> HardRebooting -> Online -> Offline`:
//!
//! * **start** kills any stale process, swaps a pending compile live, applies
//!   a staged runtime and spawns the server with the pending launch settings.
//!   It holds the runtime installer, compiler and watchdog locks throughout.
//! * **stop** force-kills the process. There is no graceful protocol, so every
//!   connected player is dropped.
//! * **restart** is stop followed by start under one lock acquisition.
//!
//! Each spawned process gets a monitor task. When the process exits without a
//! stop request the monitor takes the same locks (waiting for them, as the
//! owner of the watchdog) and, if `restart_on_crash` is enabled, relaunches it
//! with exponential backoff up to `max_restarts` times.
//!
//! Security, visibility and port changes are recorded as pending settings and
//! only reach the process on its next launch.

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chat::ChatSink;
use crate::compiler;
use crate::config::ConfigStore;
use crate::coordinator::{ChainGuard, Coordinator, LockChain};
use crate::error::{ControlError, ControlResult, ValidationError};
use crate::job::{Job, JobContext, JobKind, JobOutcome, JobRunner};
use crate::resource::Resource;
use crate::runtime;
use crate::status::{RuntimeStatus, StatusBoard, WatchdogStatus};

/// How long a stop waits for the monitor to confirm the process is gone.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A process that ran this long before crashing resets the restart count.
const STABLE_UPTIME: Duration = Duration::from_secs(60);

/// Trust level the server runs its code with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Security {
    /// Full access. The only level that keeps server commands enabled.
    Trusted,
    Safe,
    Ultrasafe,
}

impl Security {
    pub fn name(self) -> &'static str {
        match self {
            Security::Trusted => "trusted",
            Security::Safe => "safe",
            Security::Ultrasafe => "ultrasafe",
        }
    }

    fn flag(self) -> String {
        format!("-{}", self.name())
    }
}

impl FromStr for Security {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trusted" => Ok(Security::Trusted),
            "safe" => Ok(Security::Safe),
            "ultrasafe" => Ok(Security::Ultrasafe),
            other => Err(ValidationError::Other(format!(
                "Unknown security level: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hub listing of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
    Invisible,
}

impl Visibility {
    pub fn name(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
            Visibility::Invisible => "invisible",
        }
    }

    fn flag(self) -> String {
        format!("-{}", self.name())
    }
}

impl FromStr for Visibility {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            "invisible" => Ok(Visibility::Invisible),
            other => Err(ValidationError::Other(format!(
                "Unknown visibility: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the server is launched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSettings {
    pub port: u16,
    pub security: Security,
    pub visibility: Visibility,
}

impl LaunchSettings {
    /// Arguments following the artifact path.
    pub fn arguments(&self) -> Vec<String> {
        vec![
            "-port".to_string(),
            self.port.to_string(),
            self.security.flag(),
            self.visibility.flag(),
            "-close".to_string(),
        ]
    }
}

struct ProcessHandle {
    generation: u64,
    stop: oneshot::Sender<oneshot::Sender<()>>,
    pid: Option<u32>,
}

struct SupervisorShared {
    config: Arc<ConfigStore>,
    statuses: Arc<StatusBoard>,
    coordinator: Arc<Coordinator>,
    chat: Arc<dyn ChatSink>,
    pending: Mutex<LaunchSettings>,
    active: Mutex<Option<LaunchSettings>>,
    process: Mutex<Option<ProcessHandle>>,
    /// Bumped on every launch and every kill; a monitor only acts on a crash
    /// while its generation is current.
    generation: AtomicU64,
    /// Relaunches since the last operator start or stable run.
    crash_streak: AtomicU32,
    cancel: CancellationToken,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl SupervisorShared {
    async fn can_start(&self) -> ControlResult<()> {
        let layout = self.config.layout();
        let artifact = self.config.read(|c| c.compiler.artifact.clone());
        if !compiler::has_artifact(&layout, &artifact).await? {
            return Err(ValidationError::NoCompiledArtifact.into());
        }
        if !runtime::is_installed(&layout) {
            return Err(ValidationError::RuntimeMissing.into());
        }
        Ok(())
    }

    /// Kills the current process, if any. Returns whether one was running.
    async fn kill(&self) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let handle = self.process.lock().take();
        *self.active.lock() = None;

        let Some(handle) = handle else {
            return false;
        };
        info!("🛑 Stopping game server (pid {:?})", handle.pid);

        let (ack_tx, ack_rx) = oneshot::channel();
        if handle.stop.send(ack_tx).is_ok()
            && tokio::time::timeout(STOP_TIMEOUT, ack_rx).await.is_err()
        {
            warn!("⚠️ Game server did not confirm termination in time");
        }
        true
    }

    /// Applies pending compile and runtime, then spawns the server.
    async fn launch(self: &Arc<Self>, locks: &ChainGuard) -> ControlResult<LaunchSettings> {
        let layout = self.config.layout();
        let artifact = self.config.read(|c| c.compiler.artifact.clone());

        if let Some(slot) = compiler::apply_pending(&layout, &artifact).await? {
            info!("🔁 Compiled slot {} is now live", slot);
        }
        if runtime::apply_staged(&layout).await? {
            self.statuses.runtime.set_held(locks, RuntimeStatus::Idle);
            info!("🔁 Staged runtime is now live");
        }

        let executable = self.config.read(|c| c.watchdog.executable.clone());
        let artifact_path = compiler::live_artifact(&layout, &artifact)
            .await?
            .ok_or(ValidationError::NoCompiledArtifact)?;
        let executable = layout.runtime_live().join(executable);
        let settings = *self.pending.lock();

        let mut command = Command::new(&executable);
        command
            .arg(&artifact_path)
            .args(settings.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = artifact_path.parent() {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            ControlError::external(
                "game server",
                format!("could not start {}: {}", executable.display(), e),
            )
        })?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (stop_tx, stop_rx) = oneshot::channel();
        let pid = child.id();
        *self.process.lock() = Some(ProcessHandle {
            generation,
            stop: stop_tx,
            pid,
        });
        *self.active.lock() = Some(settings);

        let monitor = tokio::spawn(watch(self.clone(), child, stop_rx, generation));
        let mut monitors = self.monitors.lock();
        monitors.retain(|m| !m.is_finished());
        monitors.push(monitor);

        info!(
            "🚀 Game server started (pid {:?}) on port {} as {}/{}",
            pid, settings.port, settings.security, settings.visibility
        );
        Ok(settings)
    }
}

enum Wake {
    Stop(Option<oneshot::Sender<()>>),
    Shutdown,
    Exited(io::Result<ExitStatus>),
}

/// Monitor task for one spawned process.
fn watch(
    shared: Arc<SupervisorShared>,
    mut child: Child,
    stop: oneshot::Receiver<oneshot::Sender<()>>,
    generation: u64,
) -> BoxFuture<'static, ()> {
    async move {
        let launched = Instant::now();
        let wake = tokio::select! {
            request = stop => Wake::Stop(request.ok()),
            _ = shared.cancel.cancelled() => Wake::Shutdown,
            exit = child.wait() => Wake::Exited(exit),
        };

        match wake {
            Wake::Stop(ack) => {
                terminate(&mut child).await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Wake::Shutdown => terminate(&mut child).await,
            Wake::Exited(exit) => {
                drop(child);
                recover(shared, generation, exit, launched.elapsed()).await;
            }
        }
    }
    .boxed()
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Kill request failed, process likely gone: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("⚠️ Could not reap game server process: {}", e);
    }
}

/// Handles an unexpected exit of the process launched as `generation`.
async fn recover(
    shared: Arc<SupervisorShared>,
    generation: u64,
    exit: io::Result<ExitStatus>,
    uptime: Duration,
) {
    let description = match exit {
        Ok(status) => status.to_string(),
        Err(e) => e.to_string(),
    };
    warn!("💥 Game server exited unexpectedly ({})", description);
    shared
        .chat
        .send_message(&format!("Server crashed ({})", description), false)
        .await;

    let (restart, max_restarts, backoff_ms) = shared.config.read(|c| {
        (
            c.watchdog.restart_on_crash,
            c.watchdog.max_restarts,
            c.watchdog.restart_backoff_ms,
        )
    });
    let chain = LockChain::new([Resource::RuntimeInstall, Resource::Compiler, Resource::Watchdog]);
    if uptime >= STABLE_UPTIME {
        shared.crash_streak.store(0, Ordering::SeqCst);
    }

    loop {
        let locks = tokio::select! {
            locks = shared.coordinator.acquire(&chain) => locks,
            _ = shared.cancel.cancelled() => return,
        };
        if shared.generation.load(Ordering::SeqCst) != generation {
            debug!("Crash of generation {} already handled by a stop or restart", generation);
            return;
        }
        {
            let mut process = shared.process.lock();
            if process.as_ref().is_some_and(|p| p.generation == generation) {
                process.take();
            }
        }
        *shared.active.lock() = None;

        let attempt = shared.crash_streak.load(Ordering::SeqCst);
        if !restart || attempt >= max_restarts {
            shared
                .statuses
                .watchdog
                .set_held(&locks, WatchdogStatus::Offline);
            if restart {
                error!("❌ Game server could not be restarted after {} attempts", attempt);
                shared
                    .chat
                    .send_message(
                        &format!("Server could not be restarted after {} attempts", attempt),
                        true,
                    )
                    .await;
            }
            return;
        }

        let attempt = attempt + 1;
        shared.crash_streak.store(attempt, Ordering::SeqCst);
        shared
            .statuses
            .watchdog
            .set_held(&locks, WatchdogStatus::HardRebooting);
        let delay = Duration::from_millis(backoff_ms.saturating_mul(1 << (attempt - 1).min(6)));
        info!("🔄 Relaunching game server in {:?} (attempt {})", delay, attempt);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.cancel.cancelled() => {
                shared.statuses.watchdog.set_held(&locks, WatchdogStatus::Offline);
                return;
            }
        }

        match shared.launch(&locks).await {
            Ok(_) => {
                shared
                    .statuses
                    .watchdog
                    .set_held(&locks, WatchdogStatus::Online);
                shared
                    .chat
                    .send_message("Server restarted after a crash", false)
                    .await;
                return;
            }
            Err(e) => warn!("⚠️ Relaunch attempt {} failed: {}", attempt, e),
        }
    }
}

struct StartJob {
    shared: Arc<SupervisorShared>,
    restart: bool,
}

#[async_trait]
impl Job for StartJob {
    fn kind(&self) -> JobKind {
        if self.restart {
            JobKind::Restart
        } else {
            JobKind::Start
        }
    }

    fn lock_chain(&self) -> LockChain {
        LockChain::new([Resource::RuntimeInstall, Resource::Compiler, Resource::Watchdog])
    }

    fn begin(&self, locks: &ChainGuard) {
        self.shared
            .statuses
            .watchdog
            .set_held(locks, WatchdogStatus::HardRebooting);
    }

    async fn run(&self, ctx: &mut JobContext) -> ControlResult<String> {
        let shared = &self.shared;
        if !self.restart && shared.process.lock().is_some() {
            return Err(ValidationError::Other("The server is already running".to_string()).into());
        }
        shared.can_start().await?;

        if shared.kill().await {
            info!("🛑 Stale game server process killed");
        }
        shared.crash_streak.store(0, Ordering::SeqCst);
        let settings = shared.launch(&ctx.locks).await?;
        Ok(format!("server online on port {}", settings.port))
    }

    fn settle(&self, locks: &ChainGuard, outcome: &JobOutcome) {
        let status = if outcome.is_success() {
            WatchdogStatus::Online
        } else {
            WatchdogStatus::Offline
        };
        self.shared.statuses.watchdog.set_held(locks, status);
    }
}

struct StopJob {
    shared: Arc<SupervisorShared>,
}

#[async_trait]
impl Job for StopJob {
    fn kind(&self) -> JobKind {
        JobKind::Stop
    }

    fn begin(&self, _locks: &ChainGuard) {}

    async fn run(&self, _ctx: &mut JobContext) -> ControlResult<String> {
        if self.shared.kill().await {
            Ok("server stopped".to_string())
        } else {
            Ok("server was not running".to_string())
        }
    }

    fn settle(&self, locks: &ChainGuard, _outcome: &JobOutcome) {
        self.shared
            .statuses
            .watchdog
            .set_held(locks, WatchdogStatus::Offline);
    }
}

/// The watchdog resource.
pub struct Supervisor {
    shared: Arc<SupervisorShared>,
    jobs: Arc<JobRunner>,
}

impl Supervisor {
    pub fn new(
        config: Arc<ConfigStore>,
        statuses: Arc<StatusBoard>,
        chat: Arc<dyn ChatSink>,
        jobs: Arc<JobRunner>,
    ) -> Self {
        let pending = config.read(|c| LaunchSettings {
            port: c.watchdog.port,
            security: c.watchdog.security,
            visibility: c.watchdog.visibility,
        });
        Self {
            shared: Arc::new(SupervisorShared {
                config,
                statuses,
                coordinator: jobs.coordinator().clone(),
                chat,
                pending: Mutex::new(pending),
                active: Mutex::new(None),
                process: Mutex::new(None),
                generation: AtomicU64::new(0),
                crash_streak: AtomicU32::new(0),
                cancel: jobs.cancellation(),
                monitors: Mutex::new(Vec::new()),
            }),
            jobs,
        }
    }

    pub fn status(&self) -> WatchdogStatus {
        self.shared.statuses.watchdog.get()
    }

    /// Checks that a start could succeed, without changing anything.
    pub async fn can_start(&self) -> ControlResult<()> {
        self.shared.can_start().await
    }

    pub async fn start(&self) -> ControlResult<String> {
        if self.status() == WatchdogStatus::Online {
            return Err(ValidationError::Other("The server is already running".to_string()).into());
        }
        self.shared.can_start().await?;
        self.jobs
            .run(Arc::new(StartJob {
                shared: self.shared.clone(),
                restart: false,
            }))
            .await
    }

    /// Kills the server. Succeeds when it is already offline.
    pub async fn stop(&self) -> ControlResult<String> {
        self.jobs
            .run(Arc::new(StopJob {
                shared: self.shared.clone(),
            }))
            .await
    }

    pub async fn restart(&self) -> ControlResult<String> {
        self.shared.can_start().await?;
        self.jobs
            .run(Arc::new(StartJob {
                shared: self.shared.clone(),
                restart: true,
            }))
            .await
    }

    /// Settings the next launch will use.
    pub fn pending_settings(&self) -> LaunchSettings {
        *self.shared.pending.lock()
    }

    /// Settings of the running process.
    pub fn active_settings(&self) -> Option<LaunchSettings> {
        *self.shared.active.lock()
    }

    /// Takes effect on the next reboot.
    pub async fn set_security(&self, level: Security) -> ControlResult<()> {
        self.apply_security(level);
        self.shared.config.save().await
    }

    /// Takes effect on the next reboot.
    pub async fn set_visibility(&self, visibility: Visibility) -> ControlResult<()> {
        self.shared.pending.lock().visibility = visibility;
        self.shared
            .config
            .update(|c| c.watchdog.visibility = visibility);
        self.shared.config.save().await
    }

    /// Takes effect on the next reboot.
    pub async fn set_port(&self, port: u16) -> ControlResult<()> {
        if port == 0 {
            return Err(ValidationError::InvalidPort.into());
        }
        self.shared.pending.lock().port = port;
        self.shared.config.update(|c| c.watchdog.port = port);
        self.shared.config.save().await
    }

    pub(crate) fn apply_security(&self, level: Security) {
        self.shared.pending.lock().security = level;
        self.shared.config.update(|c| c.watchdog.security = level);
    }

    /// Kills the server for good and waits for its monitor.
    ///
    /// Expects the job runner to be shut down already.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let monitors: Vec<_> = std::mem::take(&mut *self.shared.monitors.lock());
        futures::future::join_all(monitors).await;

        self.shared.process.lock().take();
        *self.shared.active.lock() = None;
        let locks = self
            .shared
            .coordinator
            .acquire(&LockChain::single(Resource::Watchdog))
            .await;
        self.shared
            .statuses
            .watchdog
            .set_held(&locks, WatchdogStatus::Offline);
        info!("🛑 Watchdog shut down");
    }
}
