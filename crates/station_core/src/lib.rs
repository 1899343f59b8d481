//! # Station core
//!
//! Control plane for a managed game server. Four resources make up a server
//! installation:
//!
//! | Resource | Owns |
//! |---|---|
//! | Repository | the git checkout of the game source |
//! | RuntimeInstall | the installed game runtime |
//! | Compiler | the compiled game slots |
//! | Watchdog | the running server process |
//!
//! Each resource has one lock and one status cell. Operations that touch
//! several resources take their locks through the [`Coordinator`] in the fixed
//! order above, and fail fast with [`ControlError::Busy`] instead of waiting.
//! Long operations run as background jobs on the [`JobRunner`]; callers get a
//! [`JobTicket`] back and poll the status board.
//!
//! [`StationService`] assembles everything and [`rpc`] exposes it to the
//! `stationctl` client.

pub mod chat;
pub mod compiler;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod files;
pub mod job;
pub mod logging;
pub mod repository;
pub mod resource;
pub mod rpc;
pub mod runtime;
pub mod service;
pub mod status;
pub mod supervisor;

pub use chat::{ChatCommands, ChatLine, ChatRelay, ChatSink, ChatState, LogChat};
pub use compiler::{CommandCompiler, Compiler, CompilerTool};
pub use config::{ConfigStore, Layout, OptionFile, ServiceConfig, StringList, TextConfig};
pub use coordinator::{ChainGuard, Coordinator, LockChain, LockObserver};
pub use error::{ControlError, ControlResult, ErrorKind, IoPhase, ValidationError};
pub use job::{Job, JobContext, JobKind, JobOutcome, JobRecord, JobRunner, JobTicket, Progress};
pub use repository::{GitCli, Identity, MergedPullRequest, Repository, VersionControl};
pub use resource::Resource;
pub use rpc::{Request, Response, RpcClient, RpcError, RpcServer};
pub use runtime::{CommandRuntimeSource, RuntimeInstaller, RuntimeSource};
pub use service::{Collaborators, MoveOutcome, StationService};
pub use status::{
    CompilerStatus, RepoOperation, RepositoryStatus, RuntimeStatus, StatusBoard, StatusSnapshot,
    WatchdogStatus,
};
pub use supervisor::{LaunchSettings, Security, Supervisor, Visibility};
