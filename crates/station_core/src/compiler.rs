//! Game code compilation.
//!
//! Compiled output lives in one of two slots, `game/a` and `game/b`. The live
//! slot is named by `game/live.txt` and is what the running server uses. A
//! compile copies the repository into the other slot, builds there, and names
//! it in `game/pending.txt`. The watchdog swaps the pending slot live the next
//! time it starts the server, so compiling never disturbs a running game.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{ConfigStore, Layout};
use crate::coordinator::{ChainGuard, LockChain};
use crate::error::{ControlError, ControlResult, ValidationError};
use crate::files;
use crate::job::{Job, JobContext, JobKind, JobOutcome, JobRunner, JobTicket};
use crate::resource::Resource;
use crate::status::{CompilerStatus, RepoOperation, RepositoryStatus, StatusBoard};
use crate::supervisor::Security;

const SLOTS: [&str; 2] = ["a", "b"];
const LIVE_MARKER: &str = "live.txt";
const PENDING_MARKER: &str = "pending.txt";
const SECURITY_MARKER: &str = "security.txt";

/// The external compiler.
#[async_trait]
pub trait CompilerTool: Send + Sync {
    /// Builds `project` inside `workdir`, returning the compiler's output.
    async fn compile(&self, workdir: &Path, project: &str) -> ControlResult<String>;
}

/// Runs the configured compiler command with the project file appended.
pub struct CommandCompiler {
    config: Arc<ConfigStore>,
}

impl CommandCompiler {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CompilerTool for CommandCompiler {
    async fn compile(&self, workdir: &Path, project: &str) -> ControlResult<String> {
        let command = self.config.read(|c| c.compiler.command.clone());
        let Some((program, args)) = command.split_first() else {
            return Err(ControlError::external("compiler", "no compiler command configured"));
        };

        let output = Command::new(program)
            .args(args)
            .arg(project)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ControlError::external("compiler", format!("could not run {}: {}", program, e)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let text = text.trim().to_string();

        if output.status.success() {
            Ok(text)
        } else {
            Err(ControlError::external("compiler", text))
        }
    }
}

/// Slot directory by name.
fn slot_dir(layout: &Layout, slot: &str) -> PathBuf {
    layout.game().join(slot)
}

pub(crate) async fn live_slot(layout: &Layout) -> ControlResult<Option<String>> {
    files::read_marker(&layout.game().join(LIVE_MARKER)).await
}

pub(crate) async fn pending_slot(layout: &Layout) -> ControlResult<Option<String>> {
    files::read_marker(&layout.game().join(PENDING_MARKER)).await
}

/// Whether a compiled artifact is ready to be started, live or pending.
pub(crate) async fn has_artifact(layout: &Layout, artifact: &str) -> ControlResult<bool> {
    for slot in [pending_slot(layout).await?, live_slot(layout).await?]
        .into_iter()
        .flatten()
    {
        if slot_dir(layout, &slot).join(artifact).exists() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Makes the pending slot live. Returns the slot that was swapped in, if any.
///
/// A pending marker naming a slot without an artifact is dropped and the live
/// slot stays as it is. The caller must hold the compiler and watchdog locks,
/// with the server stopped.
pub(crate) async fn apply_pending(layout: &Layout, artifact: &str) -> ControlResult<Option<String>> {
    let Some(slot) = pending_slot(layout).await? else {
        return Ok(None);
    };
    let marker = layout.game().join(PENDING_MARKER);
    if !slot_dir(layout, &slot).join(artifact).exists() {
        warn!("⚠️ Pending slot {} has no {}, keeping the live slot", slot, artifact);
        files::remove_marker(&marker).await?;
        return Ok(None);
    }
    files::write_marker(&layout.game().join(LIVE_MARKER), &slot).await?;
    tokio::fs::remove_file(&marker)
        .await
        .map_err(|e| ControlError::io_partial("clearing the pending compile marker", e))?;
    Ok(Some(slot))
}

/// Path of the live artifact.
pub(crate) async fn live_artifact(layout: &Layout, artifact: &str) -> ControlResult<Option<PathBuf>> {
    Ok(live_slot(layout)
        .await?
        .map(|slot| slot_dir(layout, &slot).join(artifact))
        .filter(|path| path.exists()))
}

/// Records the security level in every compiled slot.
pub(crate) async fn stamp_security(layout: &Layout, level: Security) -> ControlResult<()> {
    for slot in SLOTS {
        let dir = slot_dir(layout, slot);
        if dir.exists() {
            files::write_marker(&dir.join(SECURITY_MARKER), level.name()).await?;
        }
    }
    Ok(())
}

struct CompilerShared {
    tool: Arc<dyn CompilerTool>,
    config: Arc<ConfigStore>,
    statuses: Arc<StatusBoard>,
    last_error: Mutex<Option<String>>,
}

struct InitializeJob {
    shared: Arc<CompilerShared>,
}

#[async_trait]
impl Job for InitializeJob {
    fn kind(&self) -> JobKind {
        JobKind::Initialize
    }

    fn begin(&self, locks: &ChainGuard) {
        self.shared
            .statuses
            .compiler
            .set_held(locks, CompilerStatus::Initializing);
    }

    async fn run(&self, _ctx: &mut JobContext) -> ControlResult<String> {
        let layout = self.shared.config.layout();
        for slot in SLOTS {
            tokio::fs::create_dir_all(slot_dir(&layout, slot))
                .await
                .map_err(|e| ControlError::io_partial("creating the game directory", e))?;
        }
        Ok(format!("game directory ready at {}", layout.game().display()))
    }

    fn settle(&self, locks: &ChainGuard, outcome: &JobOutcome) {
        let status = if outcome.is_success() {
            CompilerStatus::Initialized
        } else {
            CompilerStatus::Error
        };
        self.shared.statuses.compiler.set_held(locks, status);
    }
}

struct CompileJob {
    shared: Arc<CompilerShared>,
}

impl CompileJob {
    async fn snapshot_sources(&self, layout: &Layout) -> ControlResult<String> {
        let live = live_slot(layout).await?;
        let target = SLOTS
            .iter()
            .find(|slot| live.as_deref() != Some(**slot))
            .copied()
            .unwrap_or(SLOTS[0]);
        let dir = slot_dir(layout, target);

        // The slot is about to be emptied, so it must stop being the pending one.
        files::remove_marker(&layout.game().join(PENDING_MARKER)).await?;
        files::remove_dir(dir.clone())
            .await
            .map_err(|e| ControlError::io_untouched("clearing the compile slot", e))?;
        files::copy_dir(layout.repository(), dir, &[".git"])
            .await
            .map_err(|e| ControlError::io_partial("copying sources into the compile slot", e))?;
        Ok(target.to_string())
    }
}

#[async_trait]
impl Job for CompileJob {
    fn kind(&self) -> JobKind {
        JobKind::Compile
    }

    fn lock_chain(&self) -> LockChain {
        LockChain::new([Resource::Repository, Resource::Compiler])
    }

    fn begin(&self, locks: &ChainGuard) {
        let statuses = &self.shared.statuses;
        statuses.compiler.set_held(locks, CompilerStatus::Compiling);
        statuses
            .repository
            .set_held(locks, RepositoryStatus::Busy(RepoOperation::Snapshot));
    }

    async fn run(&self, ctx: &mut JobContext) -> ControlResult<String> {
        let shared = &self.shared;
        let layout = shared.config.layout();
        if !layout.repository().join(".git").exists() {
            return Err(ValidationError::RepositoryMissing.into());
        }

        let slot = self.snapshot_sources(&layout).await?;
        shared
            .statuses
            .repository
            .set_held(&ctx.locks, RepositoryStatus::Idle);
        ctx.locks.release(Resource::Repository);
        ctx.progress.set(30);

        let (project, artifact, security) = shared.config.read(|c| {
            (
                c.compiler.project.clone(),
                c.compiler.artifact.clone(),
                c.watchdog.security,
            )
        });
        let dir = slot_dir(&layout, &slot);
        let output = shared.tool.compile(&dir, &project).await?;
        ctx.progress.set(90);

        if !dir.join(&artifact).exists() {
            return Err(ControlError::external(
                "compiler",
                format!("compilation produced no {}: {}", artifact, output),
            ));
        }
        files::write_marker(&dir.join(SECURITY_MARKER), security.name()).await?;
        files::write_marker(&layout.game().join(PENDING_MARKER), &slot).await?;

        Ok(format!("compiled into slot {}, applies on the next server start", slot))
    }

    fn settle(&self, locks: &ChainGuard, outcome: &JobOutcome) {
        let shared = &self.shared;
        if locks.holds(Resource::Repository) {
            let status = if shared.config.layout().repository().join(".git").exists() {
                RepositoryStatus::Idle
            } else {
                RepositoryStatus::NotCloned
            };
            shared.statuses.repository.set_held(locks, status);
        }

        let (status, error) = match outcome {
            JobOutcome::Succeeded { .. } => (CompilerStatus::Compiled, None),
            JobOutcome::Failed { message, .. } => (CompilerStatus::Error, Some(message.clone())),
            JobOutcome::Cancelled => (
                CompilerStatus::Error,
                Some("compile cancelled by shutdown".to_string()),
            ),
        };
        *shared.last_error.lock() = error;
        shared.statuses.compiler.set_held(locks, status);
    }
}

/// The compiler resource.
pub struct Compiler {
    shared: Arc<CompilerShared>,
    jobs: Arc<JobRunner>,
}

impl Compiler {
    pub fn new(
        tool: Arc<dyn CompilerTool>,
        config: Arc<ConfigStore>,
        statuses: Arc<StatusBoard>,
        jobs: Arc<JobRunner>,
    ) -> Self {
        Self {
            shared: Arc::new(CompilerShared {
                tool,
                config,
                statuses,
                last_error: Mutex::new(None),
            }),
            jobs,
        }
    }

    pub fn initial_status(config: &ConfigStore) -> CompilerStatus {
        let game = config.layout().game();
        if game.join(LIVE_MARKER).exists() || game.join(PENDING_MARKER).exists() {
            CompilerStatus::Compiled
        } else if SLOTS.iter().all(|slot| game.join(slot).is_dir()) {
            CompilerStatus::Initialized
        } else {
            CompilerStatus::Uninitialized
        }
    }

    pub fn status(&self) -> CompilerStatus {
        self.shared.statuses.compiler.get()
    }

    pub fn progress(&self) -> Option<u8> {
        self.jobs.progress(Resource::Compiler)
    }

    /// Error message of the last failed compile.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Creates the game directory and its slots.
    pub async fn initialize(&self) -> ControlResult<String> {
        self.jobs
            .run(Arc::new(InitializeJob {
                shared: self.shared.clone(),
            }))
            .await
    }

    /// Compiles the current repository content in the background.
    pub fn compile(&self) -> ControlResult<JobTicket> {
        if self.status() == CompilerStatus::Uninitialized {
            return Err(ValidationError::CompilerUninitialized.into());
        }
        if !self.shared.config.layout().repository().join(".git").exists() {
            return Err(ValidationError::RepositoryMissing.into());
        }
        info!("🔨 Starting compile");
        self.jobs.spawn(Arc::new(CompileJob {
            shared: self.shared.clone(),
        }))
    }

    /// Slot waiting to go live.
    pub async fn pending(&self) -> ControlResult<Option<String>> {
        pending_slot(&self.shared.config.layout()).await
    }

    /// Slot the server runs from.
    pub async fn live(&self) -> ControlResult<Option<String>> {
        live_slot(&self.shared.config.layout()).await
    }

    /// Security level compiled into the live slot.
    pub async fn live_security(&self) -> ControlResult<Option<Security>> {
        let layout = self.shared.config.layout();
        let Some(slot) = live_slot(&layout).await? else {
            return Ok(None);
        };
        let marker = files::read_marker(&slot_dir(&layout, &slot).join(SECURITY_MARKER)).await?;
        Ok(marker.and_then(|name| match name.parse() {
            Ok(level) => Some(level),
            Err(_) => {
                warn!("⚠️ Unreadable security marker in slot {}: {}", slot, name);
                None
            }
        }))
    }
}
