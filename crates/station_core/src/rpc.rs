//! Local RPC between `stationctl` and the service.
//!
//! The wire format is one JSON document per line. A client writes a
//! [`Request`]; the server answers with a [`Response`], either
//! `{"ok": <value>}` or `{"err": {"kind": ..., "message": ...}}`.
//!
//! The server dispatches each request straight into the service, so a request
//! never holds a resource lock longer than the operation it names.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chat::{ChatLine, ChatSink};
use crate::config::{OptionFile, StringList};
use crate::error::{ControlError, ControlResult, ErrorKind};
use crate::resource::Resource;
use crate::service::StationService;
use crate::supervisor::{Security, Visibility};

/// One operation per variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Status,

    RepoSetup { remote: String, branch: Option<String> },
    RepoUpdate { hard: bool },
    RepoReset,
    RepoCheckout { reference: String },
    RepoMergePullRequest { number: u32 },
    RepoCommit { message: Option<String> },
    RepoPush,
    RepoMergedPullRequests,
    RepoStatus,
    RepoSetCommitterName { name: String },
    RepoSetCommitterEmail { email: String },
    RepoSetCredentials { username: String, password: String },

    RuntimeInstall { version: String },
    RuntimeVersion { staged: bool },

    CompilerInitialize,
    CompilerCompile,
    CompilerStatus,

    WatchdogStatus,
    WatchdogCanStart,
    WatchdogStart,
    WatchdogStop,
    WatchdogRestart,
    WatchdogSetSecurity { security: Security },
    WatchdogSetVisibility { visibility: Visibility },
    WatchdogSetPort { port: u16 },

    ConfigMoveServer { path: PathBuf },
    ConfigServerDirectory,
    ConfigSetSecurity { security: Security },
    ConfigReload,
    ConfigEntries { list: StringList },
    ConfigAddEntry { list: StringList, entry: String },
    ConfigRemoveEntry { list: StringList, entry: String },
    ConfigGet { file: OptionFile, key: String },
    ConfigSet { file: OptionFile, key: String, value: Option<String> },
    ConfigAdmins,
    ConfigSetAdmin { ckey: String, rank: String },
    ConfigRemoveAdmin { ckey: String },

    ChatStatus,
    ChatSend { message: String, admin_only: bool },
    ChatReconnect,
    ChatSetEnabled { enabled: bool },
    ChatSetChannels { channels: Vec<String> },
    ChatSetAdminChannel { channel: String },
    ChatSetAdmins { admins: Vec<String> },
    /// A line heard by a chat transport; answered with the command reply, if any.
    ChatRelayLine { speaker: String, channel: String, message: String },
}

/// Error half of a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ControlError> for RpcError {
    fn from(error: &ControlError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(Value),
    Err(RpcError),
}

impl Response {
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self {
            Response::Ok(value) => Ok(value),
            Response::Err(error) => Err(error),
        }
    }
}

impl From<ControlResult<Value>> for Response {
    fn from(result: ControlResult<Value>) -> Self {
        match result {
            Ok(value) => Response::Ok(value),
            Err(e) => Response::Err(RpcError::from(&e)),
        }
    }
}

fn to_value<T: Serialize>(value: T) -> ControlResult<Value> {
    serde_json::to_value(value).map_err(|e| ControlError::Internal(e.to_string()))
}

/// Runs one request against the service.
pub async fn dispatch(service: &StationService, request: Request) -> ControlResult<Value> {
    debug!("📨 RPC {:?}", request);
    match request {
        Request::Status => to_value(service.status()),

        Request::RepoSetup { remote, branch } => {
            to_value(service.repository().setup(&remote, branch.as_deref())?)
        }
        Request::RepoUpdate { hard } => to_value(service.repository().update(hard)?),
        Request::RepoReset => to_value(service.repository().reset().await?),
        Request::RepoCheckout { reference } => {
            to_value(service.repository().checkout(&reference).await?)
        }
        Request::RepoMergePullRequest { number } => {
            to_value(service.repository().merge_pull_request(number).await?)
        }
        Request::RepoCommit { message } => {
            to_value(service.repository().commit(message.as_deref()).await?)
        }
        Request::RepoPush => to_value(service.repository().push().await?),
        Request::RepoMergedPullRequests => {
            to_value(service.repository().merged_pull_requests().await?)
        }
        Request::RepoStatus => {
            let repository = service.repository();
            let (head, branch) = if repository.exists() && !repository.operation_in_progress() {
                (repository.head().await.ok(), repository.branch().await.ok())
            } else {
                (None, None)
            };
            Ok(json!({
                "status": service.status().repository,
                "progress": repository.progress(),
                "head": head,
                "branch": branch,
                "committer_name": repository.committer_name(),
                "committer_email": repository.committer_email(),
                "credential_username": repository.credential_username(),
                "last_job": service.jobs().last(Resource::Repository),
            }))
        }
        Request::RepoSetCommitterName { name } => {
            to_value(service.repository().set_committer_name(&name).await?)
        }
        Request::RepoSetCommitterEmail { email } => {
            to_value(service.repository().set_committer_email(&email).await?)
        }
        Request::RepoSetCredentials { username, password } => {
            to_value(service.repository().set_credentials(&username, &password).await?)
        }

        Request::RuntimeInstall { version } => to_value(service.runtime().install(&version)?),
        Request::RuntimeVersion { staged } => to_value(service.runtime().version(staged).await?),

        Request::CompilerInitialize => to_value(service.compiler().initialize().await?),
        Request::CompilerCompile => to_value(service.compiler().compile()?),
        Request::CompilerStatus => {
            let compiler = service.compiler();
            Ok(json!({
                "status": compiler.status(),
                "progress": compiler.progress(),
                "last_error": compiler.last_error(),
                "live": compiler.live().await?,
                "pending": compiler.pending().await?,
                "live_security": compiler.live_security().await?,
                "last_job": service.jobs().last(Resource::Compiler),
            }))
        }

        Request::WatchdogStatus => {
            let supervisor = service.supervisor();
            Ok(json!({
                "status": supervisor.status(),
                "pending": supervisor.pending_settings(),
                "active": supervisor.active_settings(),
                "last_job": service.jobs().last(Resource::Watchdog),
            }))
        }
        Request::WatchdogCanStart => {
            let reason = service.supervisor().can_start().await.err().map(|e| e.to_string());
            Ok(json!({ "can_start": reason.is_none(), "reason": reason }))
        }
        Request::WatchdogStart => to_value(service.supervisor().start().await?),
        Request::WatchdogStop => to_value(service.supervisor().stop().await?),
        Request::WatchdogRestart => to_value(service.supervisor().restart().await?),
        Request::WatchdogSetSecurity { security } => {
            to_value(service.supervisor().set_security(security).await?)
        }
        Request::WatchdogSetVisibility { visibility } => {
            to_value(service.supervisor().set_visibility(visibility).await?)
        }
        Request::WatchdogSetPort { port } => to_value(service.supervisor().set_port(port).await?),

        Request::ConfigMoveServer { path } => {
            to_value(service.move_server_directory(&path).await?)
        }
        Request::ConfigServerDirectory => to_value(service.server_directory()),
        Request::ConfigSetSecurity { security } => {
            to_value(service.set_compiler_security(security).await?)
        }
        Request::ConfigReload => to_value(service.reload_config().await?),
        Request::ConfigEntries { list } => to_value(service.text_config().entries(list).await?),
        Request::ConfigAddEntry { list, entry } => {
            to_value(service.text_config().add_entry(list, &entry).await?)
        }
        Request::ConfigRemoveEntry { list, entry } => {
            to_value(service.text_config().remove_entry(list, &entry).await?)
        }
        Request::ConfigGet { file, key } => to_value(service.text_config().get(file, &key).await?),
        Request::ConfigSet { file, key, value } => {
            to_value(service.text_config().set(file, &key, value.as_deref()).await?)
        }
        Request::ConfigAdmins => to_value(service.text_config().admins().await?),
        Request::ConfigSetAdmin { ckey, rank } => {
            to_value(service.text_config().set_admin(&ckey, &rank).await?)
        }
        Request::ConfigRemoveAdmin { ckey } => {
            to_value(service.text_config().remove_admin(&ckey).await?)
        }

        Request::ChatStatus => to_value(service.chat().state()),
        Request::ChatSend {
            message,
            admin_only,
        } => to_value(service.chat().send(&message, admin_only).await?),
        Request::ChatReconnect => to_value(service.chat().reconnect().await?),
        Request::ChatSetEnabled { enabled } => {
            to_value(service.chat().set_enabled(enabled).await?)
        }
        Request::ChatSetChannels { channels } => {
            to_value(service.chat().set_channels(&channels).await?)
        }
        Request::ChatSetAdminChannel { channel } => {
            to_value(service.chat().set_admin_channel(&channel).await?)
        }
        Request::ChatSetAdmins { admins } => to_value(service.chat().set_admins(&admins).await?),
        Request::ChatRelayLine {
            speaker,
            channel,
            message,
        } => {
            let line = ChatLine {
                speaker: &speaker,
                channel: &channel,
                message: &message,
            };
            to_value(service.handle_chat_line(line).await)
        }
    }
}

/// Line-delimited JSON listener bound to a loopback address.
pub struct RpcServer {
    service: Arc<StationService>,
    listener: TcpListener,
}

impl RpcServer {
    pub async fn bind(service: Arc<StationService>, address: &str) -> ControlResult<Self> {
        let address: SocketAddr = address
            .parse()
            .map_err(|_| ControlError::Config(format!("Invalid RPC address: {}", address)))?;
        if !address.ip().is_loopback() {
            return Err(ControlError::Config(format!(
                "RPC must listen on a loopback address, got {}",
                address
            )));
        }
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ControlError::io_untouched(format!("binding RPC listener on {}", address), e))?;
        Ok(Self { service, listener })
    }

    pub fn local_addr(&self) -> ControlResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| ControlError::io_untouched("reading the RPC listener address", e))
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) {
        if let Ok(address) = self.listener.local_addr() {
            info!("🔌 RPC listening on {}", address);
        }
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!("🔌 RPC client connected from {}", peer);
                    let service = self.service.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, service, shutdown).await {
                            warn!("⚠️ RPC connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("❌ Failed to accept RPC connection: {}", e);
                }
            }
        }
        info!("🔌 RPC listener stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    service: Arc<StationService>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => Response::from(dispatch(&service, request).await),
            Err(e) => Response::Err(RpcError {
                kind: ErrorKind::Validation,
                message: format!("Malformed request: {}", e),
            }),
        };

        let mut encoded = serde_json::to_vec(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
    }
    Ok(())
}

/// Failure talking to the service, as opposed to an error it returned.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Could not connect to the station service at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to the station service failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("The station service sent an invalid response: {0}")]
    Protocol(String),
}

/// One connection to the service.
pub struct RpcClient {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl RpcClient {
    pub async fn connect(address: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| ClientError::Connect {
                address: address.to_string(),
                source,
            })?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    /// Sends `request` and waits for its response.
    pub async fn call(&mut self, request: &Request) -> Result<Response, ClientError> {
        let mut encoded =
            serde_json::to_vec(request).map_err(|e| ClientError::Protocol(e.to_string()))?;
        encoded.push(b'\n');
        self.writer.write_all(&encoded).await?;

        let line = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| ClientError::Protocol("connection closed".to_string()))?;
        serde_json::from_str(&line).map_err(|e| ClientError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = Request::RepoMergePullRequest { number: 42 };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded, json!({ "op": "repo_merge_pull_request", "number": 42 }));

        let decoded: Request =
            serde_json::from_str(r#"{"op":"watchdog_set_security","security":"ultrasafe"}"#)
                .unwrap();
        assert_eq!(
            decoded,
            Request::WatchdogSetSecurity {
                security: Security::Ultrasafe
            }
        );
    }

    #[test]
    fn test_response_envelope() {
        let busy: ControlResult<Value> = Err(ControlError::Busy {
            resource: Resource::Compiler,
        });
        let encoded = serde_json::to_value(Response::from(busy)).unwrap();
        assert_eq!(encoded["err"]["kind"], "busy");

        let done: ControlResult<Value> = Ok(json!("done"));
        let ok = Response::from(done);
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({ "ok": "done" }));
        assert_eq!(ok.into_result().unwrap(), json!("done"));
    }
}
