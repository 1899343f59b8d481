//! Game runtime installation.
//!
//! A new runtime version is downloaded into `runtime/staging`. If the game
//! server is offline at that point the staging directory replaces
//! `runtime/live` right away; otherwise it stays staged until the watchdog
//! next starts the server.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::config::{ConfigStore, Layout};
use crate::coordinator::ChainGuard;
use crate::error::{ControlError, ControlResult, ValidationError};
use crate::files;
use crate::job::{Job, JobContext, JobKind, JobOutcome, JobRunner, JobTicket, Progress};
use crate::resource::Resource;
use crate::status::{RuntimeStatus, StatusBoard, WatchdogStatus};

const VERSION_FILE: &str = "version.txt";

/// Where runtime builds come from.
#[async_trait]
pub trait RuntimeSource: Send + Sync {
    /// Downloads and unpacks `version` into the empty directory `dest`.
    async fn fetch(&self, version: &str, dest: &Path, progress: &Progress) -> ControlResult<()>;
}

/// Runs the configured installer command.
pub struct CommandRuntimeSource {
    config: Arc<ConfigStore>,
}

impl CommandRuntimeSource {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RuntimeSource for CommandRuntimeSource {
    async fn fetch(&self, version: &str, dest: &Path, progress: &Progress) -> ControlResult<()> {
        let template = self.config.read(|c| c.runtime.installer.clone());
        let dest_str = dest.to_string_lossy();
        let mut args = template
            .iter()
            .map(|arg| arg.replace("{version}", version).replace("{dest}", &dest_str));
        let Some(program) = args.next() else {
            return Err(ControlError::external(
                "runtime installer",
                "no installer command configured",
            ));
        };

        let output = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ControlError::external("runtime installer", format!("could not run {}: {}", program, e))
            })?;
        progress.set(70);

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(ControlError::external("runtime installer", stderr))
        }
    }
}

/// `major.minor`, both numeric.
pub fn validate_version(version: &str) -> Result<(), ValidationError> {
    let valid = version
        .split_once('.')
        .is_some_and(|(major, minor)| {
            [major, minor]
                .iter()
                .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
        });
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidRuntimeVersion(version.to_string()))
    }
}

/// Moves a staged runtime into place. Returns whether there was one.
///
/// The caller must hold the runtime installer and watchdog locks, with the
/// server stopped.
pub(crate) async fn apply_staged(layout: &Layout) -> ControlResult<bool> {
    let staging = layout.runtime_staging();
    if !staging.join(VERSION_FILE).exists() {
        return Ok(false);
    }
    let live = layout.runtime_live();
    files::remove_dir(live.clone())
        .await
        .map_err(|e| ControlError::io_partial("removing the live runtime", e))?;
    tokio::fs::rename(&staging, &live)
        .await
        .map_err(|e| ControlError::io_partial("moving the staged runtime live", e))?;
    Ok(true)
}

pub(crate) fn is_installed(layout: &Layout) -> bool {
    layout.runtime_live().join(VERSION_FILE).exists()
        || layout.runtime_staging().join(VERSION_FILE).exists()
}

struct RuntimeShared {
    source: Arc<dyn RuntimeSource>,
    config: Arc<ConfigStore>,
    statuses: Arc<StatusBoard>,
}

struct InstallJob {
    shared: Arc<RuntimeShared>,
    version: String,
    applied: AtomicBool,
}

#[async_trait]
impl Job for InstallJob {
    fn kind(&self) -> JobKind {
        JobKind::InstallRuntime
    }

    fn begin(&self, locks: &ChainGuard) {
        self.shared
            .statuses
            .runtime
            .set_held(locks, RuntimeStatus::Downloading);
    }

    async fn run(&self, ctx: &mut JobContext) -> ControlResult<String> {
        let shared = &self.shared;
        let layout = shared.config.layout();
        let staging = layout.runtime_staging();

        files::remove_dir(staging.clone())
            .await
            .map_err(|e| ControlError::io_untouched("clearing the runtime staging directory", e))?;
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| ControlError::io_untouched("creating the runtime staging directory", e))?;

        shared
            .source
            .fetch(&self.version, &staging, &ctx.progress)
            .await?;

        shared
            .statuses
            .runtime
            .set_held(&ctx.locks, RuntimeStatus::Staging);
        ctx.progress.set(80);
        files::write_marker(&staging.join(VERSION_FILE), &self.version).await?;

        let server_offline = match ctx.extend(Resource::Watchdog) {
            Ok(()) => shared.statuses.watchdog.get() == WatchdogStatus::Offline,
            Err(e) => {
                info!("📦 Watchdog unavailable ({}), keeping runtime staged", e);
                false
            }
        };

        if server_offline {
            apply_staged(&layout).await?;
            self.applied.store(true, Ordering::Release);
            Ok(format!("runtime {} installed", self.version))
        } else {
            Ok(format!(
                "runtime {} staged, it will apply on the next server start",
                self.version
            ))
        }
    }

    fn settle(&self, locks: &ChainGuard, outcome: &JobOutcome) {
        let status = match outcome {
            JobOutcome::Succeeded { .. } if self.applied.load(Ordering::Acquire) => RuntimeStatus::Idle,
            JobOutcome::Succeeded { .. } => RuntimeStatus::Staged,
            _ => RuntimeStatus::Error,
        };
        self.shared.statuses.runtime.set_held(locks, status);
    }
}

/// The runtime installer resource.
pub struct RuntimeInstaller {
    shared: Arc<RuntimeShared>,
    jobs: Arc<JobRunner>,
}

impl RuntimeInstaller {
    pub fn new(
        source: Arc<dyn RuntimeSource>,
        config: Arc<ConfigStore>,
        statuses: Arc<StatusBoard>,
        jobs: Arc<JobRunner>,
    ) -> Self {
        Self {
            shared: Arc::new(RuntimeShared {
                source,
                config,
                statuses,
            }),
            jobs,
        }
    }

    pub fn initial_status(config: &ConfigStore) -> RuntimeStatus {
        if config.layout().runtime_staging().join(VERSION_FILE).exists() {
            RuntimeStatus::Staged
        } else {
            RuntimeStatus::Idle
        }
    }

    pub fn status(&self) -> RuntimeStatus {
        self.shared.statuses.runtime.get()
    }

    pub fn progress(&self) -> Option<u8> {
        self.jobs.progress(Resource::RuntimeInstall)
    }

    /// Downloads `version` in the background.
    pub fn install(&self, version: &str) -> ControlResult<JobTicket> {
        let version = version.trim();
        validate_version(version)?;
        info!("📦 Installing runtime {}", version);
        self.jobs.spawn(Arc::new(InstallJob {
            shared: self.shared.clone(),
            version: version.to_string(),
            applied: AtomicBool::new(false),
        }))
    }

    /// Installed (or staged) runtime version.
    pub async fn version(&self, staged: bool) -> ControlResult<Option<String>> {
        let layout = self.shared.config.layout();
        let dir = if staged {
            layout.runtime_staging()
        } else {
            layout.runtime_live()
        };
        files::read_marker(&dir.join(VERSION_FILE)).await
    }
}
