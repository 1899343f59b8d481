//! Command-line client for the station service.
//!
//! Exit codes: 0 success, 1 the service could not be reached, 2 the command
//! or its arguments were rejected, 3 the service reported an error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use station_core::logging::setup_cli_logging;
use station_core::rpc::ClientError;
use station_core::{OptionFile, Request, RpcClient, RpcError, Security, StringList, Visibility};

#[derive(Debug, Parser)]
#[command(name = "stationctl", version, about = "Controls a running station service")]
struct Cli {
    /// RPC address of the service
    #[arg(short, long, default_value = "127.0.0.1:38607", global = true)]
    address: String,

    /// Log client diagnostics to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Git checkout of the game source
    #[command(subcommand)]
    Repo(RepoCommand),
    /// Game runtime installation
    #[command(subcommand)]
    Runtime(RuntimeCommand),
    /// Game compilation
    #[command(subcommand)]
    Compiler(CompilerCommand),
    /// Game server process
    #[command(subcommand)]
    Watchdog(WatchdogCommand),
    /// Service and game configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Chat relay settings and messages
    #[command(subcommand)]
    Chat(ChatCommand),
    /// Status of every resource
    Status,
}

#[derive(Debug, Subcommand)]
enum RepoCommand {
    /// Clone a remote, replacing the current checkout
    Setup {
        remote: String,
        #[arg(short, long)]
        branch: Option<String>,
    },
    /// Fetch and merge (or hard reset to) the tracked branch
    Update {
        #[arg(long)]
        hard: bool,
    },
    /// Discard local changes
    Reset,
    Checkout { reference: String },
    Commit {
        #[arg(short, long)]
        message: Option<String>,
    },
    Push,
    /// Merge a pull request into the working tree
    MergePr { number: u32 },
    /// Pull requests merged since the last reset
    ListPrs,
    Status,
    SetName { name: String },
    SetEmail { email: String },
    SetCredentials(Credentials),
}

#[derive(Debug, Args)]
struct Credentials {
    username: String,
    password: String,
}

#[derive(Debug, Subcommand)]
enum RuntimeCommand {
    /// Install a `major.minor` runtime version
    Install { version: String },
    Version {
        #[arg(long)]
        staged: bool,
    },
}

#[derive(Debug, Subcommand)]
enum CompilerCommand {
    Init,
    Compile,
    Status,
}

#[derive(Debug, Subcommand)]
enum WatchdogCommand {
    Status,
    /// Check whether a start would succeed
    CanStart,
    Start,
    Stop,
    Restart,
    SetSecurity { level: Security },
    SetVisibility { visibility: Visibility },
    SetPort { port: u16 },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Relocate the whole server directory
    MoveServer { path: PathBuf },
    ServerDir,
    /// Change the security level of the compiled game
    SetSecurity { level: Security },
    /// Re-read the service configuration file
    Reload,
    /// Entries of a string list (admin_nicknames, silicon_laws, silly_tips, whitelist)
    List { list: StringList },
    Add { list: StringList, entry: String },
    Remove { list: StringList, entry: String },
    /// Option from a game config file (general, database, game)
    Get { file: OptionFile, key: String },
    /// Set an option; omit the value to comment it out
    Set {
        file: OptionFile,
        key: String,
        value: Option<String>,
    },
    Admins,
    SetAdmin { ckey: String, rank: String },
    RemoveAdmin { ckey: String },
}

#[derive(Debug, Subcommand)]
enum ChatCommand {
    Status,
    /// Broadcast a message
    Send {
        message: String,
        /// Only to the admin channel
        #[arg(long)]
        admin: bool,
    },
    Reconnect,
    Enable,
    Disable,
    /// Replace the channels the bot listens in
    SetChannels {
        #[arg(required = true)]
        channels: Vec<String>,
    },
    SetAdminChannel { channel: String },
    /// Replace the nicknames allowed to run admin commands
    SetAdmins { admins: Vec<String> },
}

impl Command {
    fn into_request(self) -> Request {
        match self {
            Command::Status => Request::Status,
            Command::Repo(command) => match command {
                RepoCommand::Setup { remote, branch } => Request::RepoSetup { remote, branch },
                RepoCommand::Update { hard } => Request::RepoUpdate { hard },
                RepoCommand::Reset => Request::RepoReset,
                RepoCommand::Checkout { reference } => Request::RepoCheckout { reference },
                RepoCommand::Commit { message } => Request::RepoCommit { message },
                RepoCommand::Push => Request::RepoPush,
                RepoCommand::MergePr { number } => Request::RepoMergePullRequest { number },
                RepoCommand::ListPrs => Request::RepoMergedPullRequests,
                RepoCommand::Status => Request::RepoStatus,
                RepoCommand::SetName { name } => Request::RepoSetCommitterName { name },
                RepoCommand::SetEmail { email } => Request::RepoSetCommitterEmail { email },
                RepoCommand::SetCredentials(Credentials { username, password }) => {
                    Request::RepoSetCredentials { username, password }
                }
            },
            Command::Runtime(command) => match command {
                RuntimeCommand::Install { version } => Request::RuntimeInstall { version },
                RuntimeCommand::Version { staged } => Request::RuntimeVersion { staged },
            },
            Command::Compiler(command) => match command {
                CompilerCommand::Init => Request::CompilerInitialize,
                CompilerCommand::Compile => Request::CompilerCompile,
                CompilerCommand::Status => Request::CompilerStatus,
            },
            Command::Watchdog(command) => match command {
                WatchdogCommand::Status => Request::WatchdogStatus,
                WatchdogCommand::CanStart => Request::WatchdogCanStart,
                WatchdogCommand::Start => Request::WatchdogStart,
                WatchdogCommand::Stop => Request::WatchdogStop,
                WatchdogCommand::Restart => Request::WatchdogRestart,
                WatchdogCommand::SetSecurity { level } => {
                    Request::WatchdogSetSecurity { security: level }
                }
                WatchdogCommand::SetVisibility { visibility } => {
                    Request::WatchdogSetVisibility { visibility }
                }
                WatchdogCommand::SetPort { port } => Request::WatchdogSetPort { port },
            },
            Command::Config(command) => match command {
                ConfigCommand::MoveServer { path } => Request::ConfigMoveServer { path },
                ConfigCommand::ServerDir => Request::ConfigServerDirectory,
                ConfigCommand::SetSecurity { level } => {
                    Request::ConfigSetSecurity { security: level }
                }
                ConfigCommand::Reload => Request::ConfigReload,
                ConfigCommand::List { list } => Request::ConfigEntries { list },
                ConfigCommand::Add { list, entry } => Request::ConfigAddEntry { list, entry },
                ConfigCommand::Remove { list, entry } => Request::ConfigRemoveEntry { list, entry },
                ConfigCommand::Get { file, key } => Request::ConfigGet { file, key },
                ConfigCommand::Set { file, key, value } => Request::ConfigSet { file, key, value },
                ConfigCommand::Admins => Request::ConfigAdmins,
                ConfigCommand::SetAdmin { ckey, rank } => Request::ConfigSetAdmin { ckey, rank },
                ConfigCommand::RemoveAdmin { ckey } => Request::ConfigRemoveAdmin { ckey },
            },
            Command::Chat(command) => match command {
                ChatCommand::Status => Request::ChatStatus,
                ChatCommand::Send { message, admin } => Request::ChatSend {
                    message,
                    admin_only: admin,
                },
                ChatCommand::Reconnect => Request::ChatReconnect,
                ChatCommand::Enable => Request::ChatSetEnabled { enabled: true },
                ChatCommand::Disable => Request::ChatSetEnabled { enabled: false },
                ChatCommand::SetChannels { channels } => Request::ChatSetChannels { channels },
                ChatCommand::SetAdminChannel { channel } => Request::ChatSetAdminChannel { channel },
                ChatCommand::SetAdmins { admins } => Request::ChatSetAdmins { admins },
            },
        }
    }
}

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success = 0,
    ConnectionError = 1,
    BadCommand = 2,
    ServerError = 3,
}

impl Outcome {
    fn for_error(error: &RpcError) -> Self {
        if error.kind.is_caller_error() {
            Outcome::BadCommand
        } else {
            Outcome::ServerError
        }
    }
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        ExitCode::from(outcome as u8)
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => "Done.".to_string(),
        Value::String(text) => text.clone(),
        Value::Object(map) if map.contains_key("id") && map.contains_key("kind") => format!(
            "Started {} job #{} in the background",
            map.get("kind").and_then(Value::as_str).unwrap_or("unknown"),
            map.get("id").unwrap_or(&Value::Null)
        ),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Exit status for a successful response, for queries that answer "no".
fn outcome_for_value(request: &Request, value: &Value) -> Outcome {
    match request {
        Request::WatchdogCanStart if value["can_start"] == Value::Bool(false) => Outcome::ServerError,
        _ => Outcome::Success,
    }
}

async fn execute(address: &str, request: Request) -> Result<Result<Value, RpcError>, ClientError> {
    let mut client = RpcClient::connect(address).await?;
    Ok(client.call(&request).await?.into_result())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_cli_logging(cli.verbose);
    let request = cli.command.into_request();

    let outcome = match execute(&cli.address, request.clone()).await {
        Err(e) => {
            eprintln!("❌ {}", e);
            Outcome::ConnectionError
        }
        Ok(Err(e)) => {
            eprintln!("❌ {}", e.message);
            Outcome::for_error(&e)
        }
        Ok(Ok(value)) => {
            println!("{}", render(&value));
            outcome_for_value(&request, &value)
        }
    };
    outcome.into()
}
