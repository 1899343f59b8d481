//! The assembled control plane.
//!
//! [`StationService`] builds the four resources around one [`Coordinator`] and
//! one [`JobRunner`], and hosts the operations that span several resources.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::chat::{ChatCommands, ChatLine, ChatRelay, ChatSink, LogChat};
use crate::compiler::{self, CommandCompiler, Compiler, CompilerTool};
use crate::config::{ConfigStore, TextConfig};
use crate::coordinator::{ChainGuard, Coordinator, LockChain, LockObserver};
use crate::error::{ControlError, ControlResult, ValidationError};
use crate::files;
use crate::job::{Job, JobContext, JobKind, JobOutcome, JobRunner};
use crate::repository::{GitCli, Repository, VersionControl};
use crate::resource::Resource;
use crate::runtime::{CommandRuntimeSource, RuntimeInstaller, RuntimeSource};
use crate::status::{RepoOperation, RepositoryStatus, StatusBoard, StatusSnapshot, WatchdogStatus};
use crate::supervisor::{Security, Supervisor};

/// External tools the service drives.
pub struct Collaborators {
    pub vcs: Arc<dyn VersionControl>,
    pub runtime_source: Arc<dyn RuntimeSource>,
    pub compiler: Arc<dyn CompilerTool>,
    pub chat: Arc<dyn ChatSink>,
    /// Receives every lock acquire and release, for diagnostics and tests.
    pub lock_observer: Option<Arc<dyn LockObserver>>,
}

impl Collaborators {
    /// git, the configured installer and compiler commands, and log-only chat.
    pub fn external(config: &Arc<ConfigStore>) -> Self {
        Self {
            vcs: Arc::new(GitCli::new()),
            runtime_source: Arc::new(CommandRuntimeSource::new(config.clone())),
            compiler: Arc::new(CommandCompiler::new(config.clone())),
            chat: Arc::new(LogChat),
            lock_observer: None,
        }
    }
}

/// Result of a server directory move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum MoveOutcome {
    Moved { path: PathBuf },
    /// The server now runs from `path`, but cleanup of the old location failed.
    Degraded { path: PathBuf, warning: String },
}

impl MoveOutcome {
    pub fn path(&self) -> &Path {
        match self {
            MoveOutcome::Moved { path } | MoveOutcome::Degraded { path, .. } => path,
        }
    }
}

/// The service: config, resources, jobs and chat.
pub struct StationService {
    config: Arc<ConfigStore>,
    statuses: Arc<StatusBoard>,
    jobs: Arc<JobRunner>,
    repository: Repository,
    runtime: RuntimeInstaller,
    compiler: Compiler,
    supervisor: Arc<Supervisor>,
    text_config: Arc<TextConfig>,
    chat: Arc<ChatRelay>,
}

impl StationService {
    pub fn new(config: Arc<ConfigStore>, collaborators: Collaborators) -> Self {
        let statuses = Arc::new(StatusBoard::new(
            Repository::initial_status(&config),
            RuntimeInstaller::initial_status(&config),
            Compiler::initial_status(&config),
            WatchdogStatus::Offline,
        ));
        let coordinator = Arc::new(match collaborators.lock_observer {
            Some(observer) => Coordinator::with_observer(statuses.clone(), observer),
            None => Coordinator::new(statuses.clone()),
        });
        let chat = Arc::new(ChatRelay::new(collaborators.chat, config.clone()));
        let jobs = Arc::new(JobRunner::new(coordinator, chat.clone()));

        let repository = Repository::new(
            collaborators.vcs,
            config.clone(),
            statuses.clone(),
            jobs.clone(),
        );
        let runtime = RuntimeInstaller::new(
            collaborators.runtime_source,
            config.clone(),
            statuses.clone(),
            jobs.clone(),
        );
        let compiler = Compiler::new(
            collaborators.compiler,
            config.clone(),
            statuses.clone(),
            jobs.clone(),
        );
        let supervisor = Arc::new(Supervisor::new(
            config.clone(),
            statuses.clone(),
            chat.clone(),
            jobs.clone(),
        ));
        let text_config = Arc::new(TextConfig::new(config.clone()));

        Self {
            config,
            statuses,
            jobs,
            repository,
            runtime,
            compiler,
            supervisor,
            text_config,
            chat,
        }
    }

    /// Runs startup tasks such as the configured autostart.
    pub async fn start(&self) {
        let layout = self.config.layout();
        info!("🏗️ Managing server directory {}", layout.root().display());

        if self.config.read(|c| c.watchdog.autostart) {
            match self.supervisor.start().await {
                Ok(message) => info!("🚀 Autostart: {}", message),
                Err(e) => warn!("⚠️ Autostart skipped: {}", e),
            }
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn runtime(&self) -> &RuntimeInstaller {
        &self.runtime
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn text_config(&self) -> &TextConfig {
        &self.text_config
    }

    pub fn jobs(&self) -> &JobRunner {
        &self.jobs
    }

    pub fn chat(&self) -> &Arc<ChatRelay> {
        &self.chat
    }

    /// Reply to a line relayed from a chat transport, if it was a command.
    pub async fn handle_chat_line(&self, line: ChatLine<'_>) -> Option<String> {
        ChatCommands::new(self).handle(line).await
    }

    pub fn server_directory(&self) -> PathBuf {
        self.config.layout().root().to_path_buf()
    }

    /// Lock-free view of every resource and its last job.
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            repository: self.statuses.repository.get(),
            runtime: self.statuses.runtime.get(),
            compiler: self.statuses.compiler.get(),
            watchdog: self.statuses.watchdog.get(),
            jobs: self.jobs.records(),
        }
    }

    /// Relocates the whole server directory. Takes all four locks.
    pub async fn move_server_directory(&self, target: &Path) -> ControlResult<MoveOutcome> {
        let job = Arc::new(MoveJob {
            config: self.config.clone(),
            statuses: self.statuses.clone(),
            text_config: self.text_config.clone(),
            target: target.to_path_buf(),
            outcome: Mutex::new(None),
        });
        self.jobs.run(job.clone()).await?;
        let outcome = job.outcome.lock().take();
        outcome.ok_or_else(|| ControlError::Internal("move finished without an outcome".to_string()))
    }

    /// Changes the security level compiled into the game and used by the next
    /// launch. Takes the compiler and watchdog locks.
    pub async fn set_compiler_security(&self, level: Security) -> ControlResult<String> {
        self.jobs
            .run(Arc::new(SecurityJob {
                config: self.config.clone(),
                supervisor: self.supervisor.clone(),
                level,
            }))
            .await
    }

    /// Re-reads the configuration file.
    pub async fn reload_config(&self) -> ControlResult<()> {
        self.config.reload().await
    }

    /// Cancels running jobs, stops the server and saves the configuration.
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down station service");
        self.jobs.shutdown().await;
        self.supervisor.shutdown().await;
        if let Err(e) = self.config.save().await {
            error!("❌ Could not save configuration on shutdown: {}", e);
        }
        info!("✅ Station service stopped");
    }
}

struct MoveJob {
    config: Arc<ConfigStore>,
    statuses: Arc<StatusBoard>,
    text_config: Arc<TextConfig>,
    target: PathBuf,
    outcome: Mutex<Option<MoveOutcome>>,
}

impl MoveJob {
    /// Resolves both paths and checks the move is allowed. Touches nothing.
    async fn plan(&self) -> ControlResult<(PathBuf, PathBuf)> {
        let current = absolutize(self.config.layout().root())
            .map_err(|e| ControlError::io_untouched("resolving the server directory", e))?;
        let current = match tokio::fs::canonicalize(&current).await {
            Ok(path) => path,
            Err(_) => current,
        };

        let target = absolutize(&self.target)
            .map_err(|e| ControlError::io_untouched("resolving the target directory", e))?;
        let target = match (target.parent(), target.file_name()) {
            (Some(parent), Some(name)) if parent.exists() => {
                match tokio::fs::canonicalize(parent).await {
                    Ok(parent) => parent.join(name),
                    Err(_) => target.clone(),
                }
            }
            _ => target.clone(),
        };

        if target == current {
            return Err(ValidationError::Other(format!(
                "The server directory is already {}",
                current.display()
            ))
            .into());
        }
        if target.starts_with(&current) {
            return Err(ValidationError::MoveIntoChild(target).into());
        }
        if target.exists() {
            return Err(ValidationError::MoveTargetExists(target).into());
        }
        if self.statuses.watchdog.get() != WatchdogStatus::Offline {
            return Err(ValidationError::WatchdogRunning.into());
        }
        Ok((current, target))
    }

    async fn relocate(&self, current: &Path, target: &Path) -> ControlResult<Option<String>> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ControlError::io_untouched("creating the target's parent", e))?;
        }

        if !current.exists() {
            return Ok(None);
        }

        match tokio::fs::rename(current, target).await {
            Ok(()) => return Ok(None),
            Err(e) => info!("📦 Rename failed ({}), copying instead", e),
        }
        copy_across(current, target).await
    }
}

/// Copies `current` to `target`, then deletes `current`.
///
/// A failed copy is undone when possible and reported as nothing changed. A
/// failed delete of `current` is returned as a warning: the copy is complete.
async fn copy_across(current: &Path, target: &Path) -> ControlResult<Option<String>> {
    if let Err(copy_error) = files::copy_dir(current.to_path_buf(), target.to_path_buf(), &[]).await
    {
        if !target.exists() {
            return Err(ControlError::io_untouched("copying the server directory", copy_error));
        }
        return Err(match files::remove_dir(target.to_path_buf()).await {
            Ok(()) => ControlError::io_untouched("copying the server directory", copy_error),
            Err(cleanup_error) => {
                error!(
                    "❌ Could not remove partial copy at {}: {}",
                    target.display(),
                    cleanup_error
                );
                ControlError::io_partial("copying the server directory", copy_error)
            }
        });
    }

    Ok(files::remove_dir(current.to_path_buf())
        .await
        .err()
        .map(|e| {
            format!(
                "The move was successful, but {} could not be fully deleted: {}",
                current.display(),
                e
            )
        }))
}

#[async_trait]
impl Job for MoveJob {
    fn kind(&self) -> JobKind {
        JobKind::Move
    }

    fn lock_chain(&self) -> LockChain {
        LockChain::all()
    }

    fn begin(&self, locks: &ChainGuard) {
        self.statuses
            .repository
            .set_held(locks, RepositoryStatus::Busy(RepoOperation::Relocate));
    }

    async fn run(&self, _ctx: &mut JobContext) -> ControlResult<String> {
        let (current, target) = self.plan().await?;
        let _files = self.text_config.lock_files().await;

        info!(
            "📦 Moving server directory {} -> {}",
            current.display(),
            target.display()
        );
        let mut warning = self.relocate(&current, &target).await?;

        self.config.update(|c| c.server.directory = target.clone());
        if let Err(e) = self.config.save().await {
            let message = format!(
                "The move was successful, but the configuration was not saved: {}",
                e
            );
            warning = Some(match warning {
                Some(previous) => format!("{}. {}", previous, message),
                None => message,
            });
        }

        let outcome = match warning {
            None => MoveOutcome::Moved {
                path: target.clone(),
            },
            Some(warning) => {
                warn!("⚠️ {}", warning);
                MoveOutcome::Degraded {
                    path: target.clone(),
                    warning,
                }
            }
        };
        *self.outcome.lock() = Some(outcome);
        Ok(format!("server directory is now {}", target.display()))
    }

    fn settle(&self, locks: &ChainGuard, _outcome: &JobOutcome) {
        self.statuses
            .repository
            .set_held(locks, Repository::initial_status(&self.config));
    }
}

struct SecurityJob {
    config: Arc<ConfigStore>,
    supervisor: Arc<Supervisor>,
    level: Security,
}

#[async_trait]
impl Job for SecurityJob {
    fn kind(&self) -> JobKind {
        JobKind::SetSecurity
    }

    fn lock_chain(&self) -> LockChain {
        LockChain::new([Resource::Compiler, Resource::Watchdog])
    }

    fn begin(&self, _locks: &ChainGuard) {}

    async fn run(&self, _ctx: &mut JobContext) -> ControlResult<String> {
        compiler::stamp_security(&self.config.layout(), self.level).await?;
        self.supervisor.apply_security(self.level);
        self.config.save().await?;
        Ok(format!(
            "security set to {}, applies on the next server start",
            self.level
        ))
    }

    fn settle(&self, _locks: &ChainGuard, _outcome: &JobOutcome) {}
}

/// Absolute form of `path` with `.` and `..` folded away.
fn absolutize(path: &Path) -> io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoPhase;

    #[test]
    fn test_absolutize_folds_dots() {
        let path = absolutize(Path::new("/srv/station/../games/./tg")).unwrap();
        assert_eq!(path, PathBuf::from("/srv/games/tg"));
        assert!(absolutize(Path::new("relative")).unwrap().is_absolute());
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_nothing_changed() {
        let dir = tempfile::TempDir::new().unwrap();
        let current = dir.path().join("server");
        std::fs::create_dir_all(current.join("game")).unwrap();
        std::fs::write(current.join("game").join("live.txt"), "a\n").unwrap();
        std::fs::write(dir.path().join("blocker"), "not a directory").unwrap();
        let before = std::fs::read_dir(&current).unwrap().count();

        let err = copy_across(&current, &dir.path().join("blocker").join("server"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::Io {
                phase: IoPhase::NothingChanged,
                ..
            }
        ));
        assert_eq!(std::fs::read_dir(&current).unwrap().count(), before);
        assert!(current.join("game").join("live.txt").exists());
    }

    #[tokio::test]
    async fn test_copy_across_removes_the_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let current = dir.path().join("server");
        std::fs::create_dir_all(current.join("repository")).unwrap();
        std::fs::write(current.join("repository").join("code.dm"), "world").unwrap();
        let target = dir.path().join("moved");

        assert_eq!(copy_across(&current, &target).await.unwrap(), None);
        assert!(!current.exists());
        assert_eq!(
            std::fs::read_to_string(target.join("repository").join("code.dm")).unwrap(),
            "world"
        );
    }

    #[test]
    fn test_move_marks_repository_busy_until_settled() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = crate::config::ServiceConfig::default();
        config.server.directory = dir.path().join("server");
        let config = Arc::new(ConfigStore::in_memory(config));
        let statuses = Arc::new(StatusBoard::new(
            RepositoryStatus::NotCloned,
            crate::status::RuntimeStatus::Idle,
            crate::status::CompilerStatus::Uninitialized,
            WatchdogStatus::Offline,
        ));
        let coordinator = Coordinator::new(statuses.clone());
        let job = MoveJob {
            config: config.clone(),
            statuses: statuses.clone(),
            text_config: Arc::new(TextConfig::new(config)),
            target: dir.path().join("moved"),
            outcome: Mutex::new(None),
        };

        let locks = coordinator.try_acquire(&job.lock_chain()).unwrap();
        job.begin(&locks);
        assert_eq!(
            statuses.repository.get(),
            RepositoryStatus::Busy(RepoOperation::Relocate)
        );
        job.settle(&locks, &JobOutcome::Cancelled);
        assert_eq!(statuses.repository.get(), RepositoryStatus::NotCloned);
    }

    #[test]
    fn test_move_outcome_path() {
        let outcome = MoveOutcome::Degraded {
            path: PathBuf::from("/srv/new"),
            warning: "old directory left behind".to_string(),
        };
        assert_eq!(outcome.path(), Path::new("/srv/new"));
    }
}
