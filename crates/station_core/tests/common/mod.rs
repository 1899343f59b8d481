//! In-process stand-ins for git, the compiler, the runtime installer and chat.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use station_core::job::Progress;
use station_core::{
    ChatSink, Collaborators, CompilerTool, ConfigStore, ControlError, ControlResult, Identity,
    JobRecord, LockObserver, MergedPullRequest, Resource, RuntimeSource, ServiceConfig,
    StationService, VersionControl,
};
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

#[derive(Debug, Clone)]
struct FakeRepo {
    branch: String,
    head: String,
}

/// Version control that keeps its state in memory and writes a `.git` marker.
#[derive(Default)]
pub struct FakeVcs {
    repo: Mutex<Option<FakeRepo>>,
    commits: AtomicU32,
    pub pushed: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn clone_repo(&self, remote: &str, branch: &str, dir: &Path) -> ControlResult<()> {
        if remote.contains("unreachable") {
            return Err(ControlError::external("git", "could not resolve host"));
        }
        tokio::fs::create_dir_all(dir.join(".git")).await.unwrap();
        tokio::fs::write(dir.join("tgstation.dme"), "#include \"code/world.dm\"\n")
            .await
            .unwrap();
        *self.repo.lock() = Some(FakeRepo {
            branch: branch.to_string(),
            head: "0000001".to_string(),
        });
        Ok(())
    }

    async fn fetch(&self, _dir: &Path) -> ControlResult<()> {
        Ok(())
    }

    async fn reset_hard(&self, _dir: &Path, _target: &str) -> ControlResult<()> {
        Ok(())
    }

    async fn merge(&self, _dir: &Path, target: &str, _identity: &Identity) -> ControlResult<()> {
        if let Some(repo) = self.repo.lock().as_mut() {
            repo.head = format!("merge-{}", target);
        }
        Ok(())
    }

    async fn checkout(&self, _dir: &Path, reference: &str) -> ControlResult<()> {
        if let Some(repo) = self.repo.lock().as_mut() {
            repo.branch = reference.to_string();
        }
        Ok(())
    }

    async fn head(&self, _dir: &Path) -> ControlResult<String> {
        self.repo
            .lock()
            .as_ref()
            .map(|r| r.head.clone())
            .ok_or_else(|| ControlError::external("git", "not a git repository"))
    }

    async fn branch(&self, _dir: &Path) -> ControlResult<String> {
        self.repo
            .lock()
            .as_ref()
            .map(|r| r.branch.clone())
            .ok_or_else(|| ControlError::external("git", "not a git repository"))
    }

    async fn commit(&self, _dir: &Path, _message: &str, _identity: &Identity) -> ControlResult<String> {
        let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        let head = format!("c0ffee{}", n);
        if let Some(repo) = self.repo.lock().as_mut() {
            repo.head = head.clone();
        }
        Ok(head)
    }

    async fn push(&self, _dir: &Path, remote_url: &str, branch: &str) -> ControlResult<()> {
        self.pushed
            .lock()
            .push((remote_url.to_string(), branch.to_string()));
        Ok(())
    }

    async fn fetch_pull_request(&self, _dir: &Path, number: u32) -> ControlResult<MergedPullRequest> {
        Ok(MergedPullRequest {
            sha: format!("pr{}sha", number),
            title: format!("Fix number {}", number),
            author: "coder".to_string(),
        })
    }
}

/// Compiler that writes the artifact, optionally waiting for the test to let it finish.
pub struct GatedCompiler {
    pub entered: Notify,
    release: Semaphore,
    pub fail: std::sync::atomic::AtomicBool,
}

impl GatedCompiler {
    pub fn open() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(Semaphore::MAX_PERMITS),
            fail: Default::default(),
        }
    }

    pub fn gated() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
            fail: Default::default(),
        }
    }

    /// Lets one waiting compile finish.
    pub fn release_one(&self) {
        self.release.add_permits(1);
    }
}

#[async_trait]
impl CompilerTool for GatedCompiler {
    async fn compile(&self, workdir: &Path, project: &str) -> ControlResult<String> {
        self.entered.notify_one();
        self.release
            .acquire()
            .await
            .map_err(|e| ControlError::Internal(e.to_string()))?
            .forget();
        if self.fail.load(Ordering::SeqCst) {
            return Err(ControlError::external("compiler", "1 error, 0 warnings"));
        }
        let artifact = project.replace(".dme", ".dmb");
        tokio::fs::write(workdir.join(&artifact), b"compiled")
            .await
            .map_err(|e| ControlError::io_untouched("writing artifact", e))?;
        Ok(format!("{} - 0 errors, 0 warnings", artifact))
    }
}

/// Runtime source that installs a tiny shell script as the game server.
pub struct FakeRuntime {
    pub script: Mutex<String>,
}

impl FakeRuntime {
    pub fn long_running() -> Self {
        Self {
            script: Mutex::new("#!/bin/sh\nexec sleep 30\n".to_string()),
        }
    }
}

#[async_trait]
impl RuntimeSource for FakeRuntime {
    async fn fetch(&self, _version: &str, dest: &Path, progress: &Progress) -> ControlResult<()> {
        let path = dest.join("DreamDaemon");
        let script = self.script.lock().clone();
        tokio::fs::write(&path, script)
            .await
            .map_err(|e| ControlError::io_untouched("writing runtime", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(|e| ControlError::io_untouched("marking runtime executable", e))?;
        }
        progress.set(60);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingChat {
    pub messages: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl ChatSink for RecordingChat {
    async fn send_message(&self, text: &str, admin_only: bool) {
        self.messages.lock().push((text.to_string(), admin_only));
    }

    fn connected(&self) -> bool {
        true
    }

    async fn reconnect(&self) -> ControlResult<()> {
        Ok(())
    }
}

/// Every acquire and release, in order.
#[derive(Default)]
pub struct LockLog {
    pub events: Mutex<Vec<(bool, u64, Resource)>>,
}

impl LockObserver for LockLog {
    fn acquired(&self, attempt: u64, resource: Resource) {
        self.events.lock().push((true, attempt, resource));
    }

    fn released(&self, attempt: u64, resource: Resource) {
        self.events.lock().push((false, attempt, resource));
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub service: Arc<StationService>,
    pub vcs: Arc<FakeVcs>,
    pub compiler: Arc<GatedCompiler>,
    pub runtime: Arc<FakeRuntime>,
    pub chat: Arc<RecordingChat>,
    pub locks: Arc<LockLog>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_compiler(GatedCompiler::open())
    }

    pub fn with_compiler(compiler: GatedCompiler) -> Self {
        Self::build(compiler, false)
    }

    /// Harness whose configuration is saved to `station.toml` in the temp dir.
    pub fn file_backed() -> Self {
        Self::build(GatedCompiler::open(), true)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("station.toml")
    }

    fn build(compiler: GatedCompiler, file_backed: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = ServiceConfig::default();
        config.server.directory = dir.path().join("server");
        config.watchdog.restart_backoff_ms = 10;
        config.chat.enabled = true;
        let store = Arc::new(if file_backed {
            ConfigStore::from_loaded(dir.path().join("station.toml"), config)
        } else {
            ConfigStore::in_memory(config)
        });

        let vcs = Arc::new(FakeVcs::default());
        let compiler = Arc::new(compiler);
        let runtime = Arc::new(FakeRuntime::long_running());
        let chat = Arc::new(RecordingChat::default());
        let locks = Arc::new(LockLog::default());

        let service = Arc::new(StationService::new(
            store,
            Collaborators {
                vcs: vcs.clone(),
                runtime_source: runtime.clone(),
                compiler: compiler.clone(),
                chat: chat.clone(),
                lock_observer: Some(locks.clone()),
            },
        ));

        Self {
            dir,
            service,
            vcs,
            compiler,
            runtime,
            chat,
            locks,
        }
    }

    pub fn server_dir(&self) -> PathBuf {
        self.service.server_directory()
    }

    /// Clones, initializes the compiler and installs a runtime.
    pub async fn provision(&self) {
        let ticket = self
            .service
            .repository()
            .setup("https://example.com/station.git", Some("main"))
            .unwrap();
        wait_finished(&self.service, ticket.resource, ticket.id).await;

        self.service.compiler().initialize().await.unwrap();

        let ticket = self.service.runtime().install("514.1589").unwrap();
        wait_finished(&self.service, ticket.resource, ticket.id).await;
    }

    /// Compiles and waits for the result.
    pub async fn compile(&self) -> JobRecord {
        let ticket = self.service.compiler().compile().unwrap();
        wait_finished(&self.service, ticket.resource, ticket.id).await
    }
}

/// Polls until job `id` on `resource` has an outcome.
pub async fn wait_finished(service: &StationService, resource: Resource, id: u64) -> JobRecord {
    for _ in 0..1000 {
        if let Some(record) = service.jobs().last(resource) {
            if record.id == id && !record.is_running() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} on {} did not finish", id, resource);
}

/// Polls `condition` for up to ten seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Snapshot of every file under `root`, relative paths only.
pub fn tree(root: &Path) -> Vec<PathBuf> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            out.push(path.strip_prefix(root).unwrap().to_path_buf());
            if path.is_dir() {
                walk(root, &path, out);
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}
