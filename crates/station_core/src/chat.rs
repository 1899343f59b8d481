//! Chat relay.
//!
//! The service reports job results to chat and answers a handful of commands
//! addressed to its nickname. Chat is informational: nothing in the control
//! plane waits on it or changes behavior based on whether it is connected.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::error::{ControlResult, ValidationError};
use crate::service::StationService;

/// Outgoing side of a chat transport (IRC, Discord, ...).
#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Broadcasts `text`, to the admin channel only when `admin_only` is set.
    async fn send_message(&self, text: &str, admin_only: bool);

    fn connected(&self) -> bool;

    async fn reconnect(&self) -> ControlResult<()>;
}

/// Chat sink that writes every message to the service log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChat;

#[async_trait]
impl ChatSink for LogChat {
    async fn send_message(&self, text: &str, admin_only: bool) {
        if admin_only {
            info!("💬 [admin] {}", text);
        } else {
            info!("💬 {}", text);
        }
    }

    fn connected(&self) -> bool {
        true
    }

    async fn reconnect(&self) -> ControlResult<()> {
        Ok(())
    }
}

/// Chat configuration and connection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatState {
    pub enabled: bool,
    pub connected: bool,
    pub nickname: String,
    pub channels: Vec<String>,
    pub admin_channel: String,
    pub admins: Vec<String>,
}

/// A transport governed by the `[chat]` configuration section.
///
/// Messages are dropped while chat is disabled. Setting changes are saved to
/// the configuration file right away.
pub struct ChatRelay {
    sink: Arc<dyn ChatSink>,
    config: Arc<ConfigStore>,
}

impl ChatRelay {
    pub fn new(sink: Arc<dyn ChatSink>, config: Arc<ConfigStore>) -> Self {
        Self { sink, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.read(|c| c.chat.enabled)
    }

    pub fn state(&self) -> ChatState {
        let connected = self.connected();
        self.config.read(|c| ChatState {
            enabled: c.chat.enabled,
            connected,
            nickname: c.chat.nickname.clone(),
            channels: c.chat.channels.clone(),
            admin_channel: c.chat.admin_channel.clone(),
            admins: c.chat.admins.clone(),
        })
    }

    /// Operator broadcast. Unlike job notifications this fails when chat is off.
    pub async fn send(&self, text: &str, admin_only: bool) -> ControlResult<()> {
        if !self.enabled() {
            return Err(ValidationError::ChatDisabled.into());
        }
        self.sink.send_message(text, admin_only).await;
        Ok(())
    }

    pub async fn set_enabled(&self, enabled: bool) -> ControlResult<()> {
        self.config.update(|c| c.chat.enabled = enabled);
        self.config.save().await?;
        info!("💬 Chat {}", if enabled { "enabled" } else { "disabled" });
        if enabled && !self.sink.connected() {
            if let Err(e) = self.sink.reconnect().await {
                warn!("⚠️ Chat enabled but could not connect: {}", e);
            }
        }
        Ok(())
    }

    /// Replaces the channels the bot listens and reports in.
    pub async fn set_channels(&self, channels: &[String]) -> ControlResult<()> {
        let channels = normalize_channels(channels)?;
        self.config.update(|c| c.chat.channels = channels);
        self.config.save().await
    }

    pub async fn set_admin_channel(&self, channel: &str) -> ControlResult<()> {
        let mut channel = normalize_channels(&[channel.to_string()])?;
        let Some(channel) = channel.pop() else {
            return Err(ValidationError::InvalidChannel(String::new()).into());
        };
        self.config.update(|c| c.chat.admin_channel = channel);
        self.config.save().await
    }

    /// Replaces the nicknames allowed to run admin commands.
    pub async fn set_admins(&self, admins: &[String]) -> ControlResult<()> {
        let mut cleaned: Vec<String> = Vec::new();
        for admin in admins.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
            if !cleaned.iter().any(|known| known.eq_ignore_ascii_case(admin)) {
                cleaned.push(admin.to_string());
            }
        }
        self.config.update(|c| c.chat.admins = cleaned);
        self.config.save().await
    }
}

#[async_trait]
impl ChatSink for ChatRelay {
    async fn send_message(&self, text: &str, admin_only: bool) {
        if !self.enabled() {
            debug!("💬 Chat disabled, dropping: {}", text);
            return;
        }
        self.sink.send_message(text, admin_only).await;
    }

    fn connected(&self) -> bool {
        self.enabled() && self.sink.connected()
    }

    async fn reconnect(&self) -> ControlResult<()> {
        if !self.enabled() {
            return Err(ValidationError::ChatDisabled.into());
        }
        self.sink.reconnect().await
    }
}

/// Trims, rejects blank or spaced names, and drops case-insensitive duplicates.
fn normalize_channels(channels: &[String]) -> Result<Vec<String>, ValidationError> {
    let mut out: Vec<String> = Vec::new();
    for channel in channels {
        let channel = channel.trim();
        if channel.is_empty() || channel.contains(char::is_whitespace) {
            return Err(ValidationError::InvalidChannel(channel.to_string()));
        }
        if !out.iter().any(|known| known.eq_ignore_ascii_case(channel)) {
            out.push(channel.to_string());
        }
    }
    Ok(out)
}

/// A line spoken in a channel the bot listens to.
#[derive(Debug, Clone)]
pub struct ChatLine<'a> {
    pub speaker: &'a str,
    pub channel: &'a str,
    pub message: &'a str,
}

/// Answers `<nickname> <command> [args]` lines.
pub struct ChatCommands<'a> {
    service: &'a StationService,
}

impl<'a> ChatCommands<'a> {
    pub fn new(service: &'a StationService) -> Self {
        Self { service }
    }

    /// The reply for `line`, or `None` when the line is not addressed to us.
    ///
    /// Lines are ignored while chat is disabled and outside the configured
    /// channels and the admin channel.
    pub async fn handle(&self, line: ChatLine<'_>) -> Option<String> {
        let config = self.service.config();
        let (enabled, nickname, listening) = config.read(|c| {
            let listening = c.chat.admin_channel.eq_ignore_ascii_case(line.channel)
                || c.chat
                    .channels
                    .iter()
                    .any(|channel| channel.eq_ignore_ascii_case(line.channel));
            (c.chat.enabled, c.chat.nickname.clone(), listening)
        });
        if !enabled || !listening {
            return None;
        }

        let mut words = line.message.split_whitespace();
        if !words.next()?.eq_ignore_ascii_case(&nickname) {
            return None;
        }
        let Some(command) = words.next().map(str::to_ascii_lowercase) else {
            return Some("Hi!".to_string());
        };
        let args: Vec<&str> = words.collect();

        info!(
            "💬 Chat command from {}: {} {}",
            line.speaker,
            command,
            args.join(" ")
        );

        let reply = match command.as_str() {
            "check" => match admin_check(config, &line) {
                Some(denied) => denied,
                None => self.check_summary(),
            },
            "status" => match admin_check(config, &line) {
                Some(denied) => denied,
                None => self.watchdog_summary(),
            },
            "runtime" | "byond" => {
                let staged = args.first().is_some_and(|a| a.eq_ignore_ascii_case("--staged"));
                self.runtime_version(staged).await
            }
            other => format!("Unknown command: {}", other),
        };
        Some(reply)
    }

    fn check_summary(&self) -> String {
        let status = self.service.status();
        format!(
            "Repository: {:?}, runtime: {:?}, compiler: {:?}, server: {:?}",
            status.repository, status.runtime, status.compiler, status.watchdog
        )
    }

    fn watchdog_summary(&self) -> String {
        let supervisor = self.service.supervisor();
        let active = supervisor.active_settings();
        match active {
            Some(settings) => format!(
                "Server is {:?} on port {} ({:?}, {:?})",
                supervisor.status(),
                settings.port,
                settings.security,
                settings.visibility
            ),
            None => format!("Server is {:?}", supervisor.status()),
        }
    }

    async fn runtime_version(&self, staged: bool) -> String {
        match self.service.runtime().version(staged).await {
            Ok(Some(version)) => version,
            Ok(None) if staged => "None".to_string(),
            Ok(None) => "Uninstalled".to_string(),
            Err(e) => {
                warn!("⚠️ Could not read runtime version for chat: {}", e);
                e.to_string()
            }
        }
    }
}

fn admin_check(config: &ConfigStore, line: &ChatLine<'_>) -> Option<String> {
    config.read(|c| {
        if !c
            .chat
            .admins
            .iter()
            .any(|admin| admin.eq_ignore_ascii_case(line.speaker))
        {
            return Some("You are not authorized to use that command!".to_string());
        }
        if !c.chat.admin_channel.eq_ignore_ascii_case(line.channel) {
            return Some("Use this command in the admin channel!".to_string());
        }
        None
    })
}
