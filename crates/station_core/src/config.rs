//! Service configuration and the game's text config files.
//!
//! [`ServiceConfig`] is the TOML document the service runs from. It is owned by
//! a [`ConfigStore`] that every subsystem receives at construction; there is no
//! global settings object. Changes go through [`ConfigStore::update`] and are
//! persisted with [`ConfigStore::save`].
//!
//! [`TextConfig`] manages the line-oriented files the game itself reads from
//! `<server>/config/`. Those files are rewritten whole under their own mutex,
//! which is separate from the four resource locks.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::{ControlError, ControlResult, ValidationError};
use crate::supervisor::{Security, Visibility};

/// Top level configuration loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub repository: RepositorySettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub compiler: CompilerSettings,
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Where the service lives and listens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Root of the managed directory tree
    pub directory: PathBuf,
    /// Loopback address the RPC listener binds to
    pub rpc_bind: String,
}

/// Git remote and committer identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySettings {
    /// Remote the repository was cloned from, set by setup
    #[serde(default)]
    pub remote: Option<String>,
    pub branch: String,
    pub committer_name: String,
    pub committer_email: String,
    #[serde(default)]
    pub credential_username: Option<String>,
    /// Stored in plain text; the file is written owner-only on unix.
    #[serde(default)]
    pub credential_password: Option<String>,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            remote: None,
            branch: "master".to_string(),
            committer_name: "station".to_string(),
            committer_email: "station@localhost".to_string(),
            credential_username: None,
            credential_password: None,
        }
    }
}

/// Runtime installer command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Program and arguments; `{version}` and `{dest}` are substituted.
    #[serde(default)]
    pub installer: Vec<String>,
}

/// Compiler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerSettings {
    /// Program and leading arguments; the project file is appended.
    pub command: Vec<String>,
    /// Project file, relative to the repository root
    pub project: String,
    /// File the compiler produces next to the project
    pub artifact: String,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            command: vec!["DreamMaker".to_string()],
            project: "tgstation.dme".to_string(),
            artifact: "tgstation.dmb".to_string(),
        }
    }
}

/// Game server process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogSettings {
    /// Executable inside the live runtime directory
    pub executable: String,
    pub port: u16,
    pub security: Security,
    pub visibility: Visibility,
    #[serde(default = "default_true")]
    pub restart_on_crash: bool,
    /// Start the server when the service starts
    #[serde(default)]
    pub autostart: bool,
    /// Relaunch attempts after a crash before giving up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Delay before the first relaunch, doubled on every further attempt
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_backoff_ms() -> u64 {
    5000
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            executable: "DreamDaemon".to_string(),
            port: 1337,
            security: Security::Safe,
            visibility: Visibility::Public,
            restart_on_crash: true,
            autostart: false,
            max_restarts: default_max_restarts(),
            restart_backoff_ms: default_restart_backoff_ms(),
        }
    }
}

/// Chat relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    pub enabled: bool,
    pub nickname: String,
    /// Nicknames allowed to run admin commands
    #[serde(default)]
    pub admins: Vec<String>,
    /// Channel admin commands must be issued from
    pub admin_channel: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            nickname: "station".to_string(),
            admins: Vec::new(),
            admin_channel: "#admin".to_string(),
            channels: vec!["#station".to_string()],
        }
    }
}

/// Logging output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                directory: PathBuf::from("server"),
                rpc_bind: "127.0.0.1:38607".to_string(),
            },
            repository: RepositorySettings::default(),
            runtime: RuntimeSettings::default(),
            compiler: CompilerSettings::default(),
            watchdog: WatchdogSettings::default(),
            chat: ChatSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration there and
    /// returns it.
    pub async fn load_from_file(path: &Path) -> ControlResult<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ControlError::io_untouched("reading the configuration", e))?;
            toml::from_str(&content)
                .map_err(|e| ControlError::Config(format!("{}: {}", path.display(), e)))
        } else {
            let config = ServiceConfig::default();
            config.write_to(path).await?;
            info!("📝 Created default configuration file: {}", path.display());
            Ok(config)
        }
    }

    async fn write_to(&self, path: &Path) -> ControlResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ControlError::Config(format!("serializing configuration: {}", e)))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ControlError::io_untouched("creating the configuration directory", e))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ControlError::io_untouched("writing the configuration", e))?;
        // May hold push credentials: owner-only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| ControlError::io_untouched("restricting configuration permissions", e))?;
        }
        Ok(())
    }

    /// Checks the configuration for values the service cannot run with.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.server.directory.as_os_str().is_empty() {
            return Err(ValidationError::Other(
                "Server directory cannot be empty".to_string(),
            ));
        }

        match self.server.rpc_bind.parse::<std::net::SocketAddr>() {
            Ok(addr) if addr.ip().is_loopback() => {}
            Ok(addr) => {
                return Err(ValidationError::Other(format!(
                    "RPC bind address must be loopback, got {}",
                    addr
                )))
            }
            Err(_) => {
                return Err(ValidationError::Other(format!(
                    "Invalid RPC bind address: {}",
                    self.server.rpc_bind
                )))
            }
        }

        if self.repository.branch.trim().is_empty() {
            return Err(ValidationError::Other("Branch cannot be empty".to_string()));
        }

        if self.watchdog.port == 0 {
            return Err(ValidationError::InvalidPort);
        }

        if self.compiler.command.is_empty() {
            return Err(ValidationError::Other(
                "Compiler command cannot be empty".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ValidationError::Other(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                self.logging.level
            )));
        }

        Ok(())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.server.directory.clone())
    }
}

/// Paths inside the server directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repository(&self) -> PathBuf {
        self.root.join("repository")
    }

    pub fn runtime_live(&self) -> PathBuf {
        self.root.join("runtime").join("live")
    }

    pub fn runtime_staging(&self) -> PathBuf {
        self.root.join("runtime").join("staging")
    }

    pub fn game(&self) -> PathBuf {
        self.root.join("game")
    }

    pub fn text_config(&self) -> PathBuf {
        self.root.join("config")
    }

    /// Service-owned metadata such as the merged pull request log.
    pub fn metadata(&self) -> PathBuf {
        self.root.join(".station")
    }

    pub fn merged_prs(&self) -> PathBuf {
        self.metadata().join("merged_prs.json")
    }
}

/// Owner of the live [`ServiceConfig`].
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<ServiceConfig>,
}

impl ConfigStore {
    /// A store that is never written to disk. Used by tests and embedders.
    pub fn in_memory(config: ServiceConfig) -> Self {
        Self {
            path: None,
            current: RwLock::new(config),
        }
    }

    /// Loads (or creates) the file at `path` and owns it from now on.
    pub async fn load(path: impl Into<PathBuf>) -> ControlResult<Self> {
        let path = path.into();
        let config = ServiceConfig::load_from_file(&path).await?;
        Ok(Self::from_loaded(path, config))
    }

    /// Wraps a config that was already loaded (and possibly overridden) from `path`.
    pub fn from_loaded(path: impl Into<PathBuf>, config: ServiceConfig) -> Self {
        Self {
            path: Some(path.into()),
            current: RwLock::new(config),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// A copy of the current configuration.
    pub fn get(&self) -> ServiceConfig {
        self.current.read().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&ServiceConfig) -> R) -> R {
        f(&self.current.read())
    }

    /// Mutates the in-memory configuration. Call [`ConfigStore::save`] to persist.
    pub fn update<R>(&self, f: impl FnOnce(&mut ServiceConfig) -> R) -> R {
        f(&mut self.current.write())
    }

    pub fn layout(&self) -> Layout {
        self.read(ServiceConfig::layout)
    }

    /// Writes the current configuration back to its file.
    pub async fn save(&self) -> ControlResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = self.get();
        snapshot.write_to(path).await
    }

    /// Replaces the in-memory configuration with the file's content.
    ///
    /// The server directory is kept: it only changes through a directory move.
    pub async fn reload(&self) -> ControlResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut fresh = ServiceConfig::load_from_file(path).await?;
        fresh.validate()?;
        let mut current = self.current.write();
        if fresh.server.directory != current.server.directory {
            warn!(
                "⚠️ Ignoring server directory change on reload, use a directory move instead"
            );
            fresh.server.directory = current.server.directory.clone();
        }
        *current = fresh;
        info!("🔄 Configuration reloaded from {}", path.display());
        Ok(())
    }
}

/// String list files under `config/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringList {
    AdminNicknames,
    SiliconLaws,
    SillyTips,
    Whitelist,
}

impl StringList {
    pub fn file_name(self) -> &'static str {
        match self {
            StringList::AdminNicknames => "admin_nicknames.txt",
            StringList::SiliconLaws => "silicon_laws.txt",
            StringList::SillyTips => "silly_tips.txt",
            StringList::Whitelist => "whitelist.txt",
        }
    }
}

impl FromStr for StringList {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "admin_nicknames" => Ok(StringList::AdminNicknames),
            "silicon_laws" => Ok(StringList::SiliconLaws),
            "silly_tips" => Ok(StringList::SillyTips),
            "whitelist" => Ok(StringList::Whitelist),
            _ => Err(ValidationError::UnknownConfigList(s.to_string())),
        }
    }
}

impl fmt::Display for StringList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name().trim_end_matches(".txt"))
    }
}

/// `NAME value` option files under `config/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionFile {
    General,
    Database,
    Game,
}

impl OptionFile {
    pub fn file_name(self) -> &'static str {
        match self {
            OptionFile::General => "config.txt",
            OptionFile::Database => "dbconfig.txt",
            OptionFile::Game => "game_options.txt",
        }
    }
}

impl FromStr for OptionFile {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "general" | "config" => Ok(OptionFile::General),
            "database" | "dbconfig" => Ok(OptionFile::Database),
            "game" | "game_options" => Ok(OptionFile::Game),
            _ => Err(ValidationError::UnknownConfigList(s.to_string())),
        }
    }
}

impl fmt::Display for OptionFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name().trim_end_matches(".txt"))
    }
}

const ADMINS_FILE: &str = "admins.txt";

/// Reader and writer for the game's text config files.
pub struct TextConfig {
    store: Arc<ConfigStore>,
    lock: Mutex<()>,
}

impl TextConfig {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Holds off every text config read and write until the guard drops.
    pub async fn lock_files(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    fn path(&self, file: &str) -> PathBuf {
        self.store.layout().text_config().join(file)
    }

    /// Entries of a string list, without blank lines and comments.
    pub async fn entries(&self, list: StringList) -> ControlResult<Vec<String>> {
        let _files = self.lock.lock().await;
        Ok(parse_entries(&read_lines(&self.path(list.file_name())).await?))
    }

    /// Appends `entry` unless it is already listed.
    pub async fn add_entry(&self, list: StringList, entry: &str) -> ControlResult<()> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(ValidationError::Other("Entry cannot be empty".to_string()).into());
        }
        let _files = self.lock.lock().await;
        let path = self.path(list.file_name());
        let mut lines = read_lines(&path).await?;
        if parse_entries(&lines).iter().any(|e| e == entry) {
            return Ok(());
        }
        lines.push(entry.to_string());
        write_lines(&path, &lines).await
    }

    /// Removes `entry`. Returns whether it was present.
    pub async fn remove_entry(&self, list: StringList, entry: &str) -> ControlResult<bool> {
        let entry = entry.trim();
        let _files = self.lock.lock().await;
        let path = self.path(list.file_name());
        let lines = read_lines(&path).await?;
        let kept: Vec<String> = lines
            .iter()
            .filter(|line| line.trim() != entry)
            .cloned()
            .collect();
        if kept.len() == lines.len() {
            return Ok(false);
        }
        write_lines(&path, &kept).await?;
        Ok(true)
    }

    /// `ckey = rank` associations from `admins.txt`.
    pub async fn admins(&self) -> ControlResult<BTreeMap<String, String>> {
        let _files = self.lock.lock().await;
        Ok(parse_admins(&read_lines(&self.path(ADMINS_FILE)).await?))
    }

    pub async fn set_admin(&self, ckey: &str, rank: &str) -> ControlResult<()> {
        let _files = self.lock.lock().await;
        let path = self.path(ADMINS_FILE);
        let mut admins = parse_admins(&read_lines(&path).await?);
        admins.insert(ckey.trim().to_string(), rank.trim().to_string());
        write_lines(&path, &format_admins(&admins)).await
    }

    pub async fn remove_admin(&self, ckey: &str) -> ControlResult<bool> {
        let _files = self.lock.lock().await;
        let path = self.path(ADMINS_FILE);
        let mut admins = parse_admins(&read_lines(&path).await?);
        if admins.remove(ckey.trim()).is_none() {
            return Ok(false);
        }
        write_lines(&path, &format_admins(&admins)).await?;
        Ok(true)
    }

    /// Value of option `key`. `None` when the option is absent or commented out.
    pub async fn get(&self, file: OptionFile, key: &str) -> ControlResult<Option<String>> {
        let _files = self.lock.lock().await;
        let key = key.to_ascii_uppercase();
        let lines = read_lines(&self.path(file.file_name())).await?;
        Ok(lines
            .iter()
            .filter_map(|line| parse_option(line))
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value))
    }

    /// Sets an option that already exists in the file, commented or not.
    ///
    /// `None` comments the option out.
    pub async fn set(&self, file: OptionFile, key: &str, value: Option<&str>) -> ControlResult<()> {
        let _files = self.lock.lock().await;
        let key = key.to_ascii_uppercase();
        let path = self.path(file.file_name());
        let mut lines = read_lines(&path).await?;

        let Some(index) = lines.iter().position(|line| {
            let trimmed = line.trim();
            let uncommented = trimmed.strip_prefix('#').unwrap_or(trimmed).trim();
            !trimmed.starts_with("##")
                && uncommented.split_whitespace().next().map(str::to_ascii_uppercase)
                    == Some(key.clone())
        }) else {
            return Err(ValidationError::UnknownConfigKey(key).into());
        };

        lines[index] = match value {
            Some(value) => format!("{} {}", key, value).trim().to_string(),
            None => format!("#{}", key),
        };
        write_lines(&path, &lines).await
    }
}

fn parse_entries(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn parse_admins(lines: &[String]) -> BTreeMap<String, String> {
    parse_entries(lines)
        .iter()
        .filter_map(|line| {
            let (ckey, rank) = line.split_once('=')?;
            Some((ckey.trim().to_string(), rank.trim().to_string()))
        })
        .collect()
}

fn format_admins(admins: &BTreeMap<String, String>) -> Vec<String> {
    admins
        .iter()
        .map(|(ckey, rank)| format!("{} = {}", ckey, rank))
        .collect()
}

/// `NAME value` for an enabled option line.
fn parse_option(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (name, value) = match trimmed.split_once(char::is_whitespace) {
        Some((name, value)) => (name, value.trim()),
        None => (trimmed, ""),
    };
    Some((name.to_ascii_uppercase(), value.to_string()))
}

async fn read_lines(path: &Path) -> ControlResult<Vec<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ControlError::io_untouched(
            format!("reading {}", path.display()),
            e,
        )),
    }
}

async fn write_lines(path: &Path, lines: &[String]) -> ControlResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ControlError::io_untouched(format!("creating {}", parent.display()), e))?;
    }
    let mut content = lines.join("\n");
    content.push('\n');
    tokio::fs::write(path, content)
        .await
        .map_err(|e| ControlError::io_untouched(format!("writing {}", path.display()), e))
}
