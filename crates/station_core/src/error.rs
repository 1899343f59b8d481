//! Error types for the station control plane.
//!
//! Every fallible operation in the core returns [`ControlError`]. The variants
//! follow the operator-facing taxonomy:
//!
//! * **Busy** - a resource (or a member of a lock chain) is in use; retry later
//! * **Validation** - the request itself is wrong and must be corrected
//! * **ExternalTool** - git, the compiler or the runtime installer failed
//! * **Io** - a filesystem step failed, tagged with how far the change got
//!
//! Nothing here is fatal to the service process: a failed job only degrades
//! the resource it ran on.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::Resource;

/// Convenience alias used throughout the crate.
pub type ControlResult<T> = Result<T, ControlError>;

/// How far a filesystem mutation progressed before it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoPhase {
    /// The failure happened before anything on disk was touched, or the
    /// partial work was rolled back.
    NothingChanged,
    /// Part of the change is on disk; manual recovery may be needed.
    PartiallyApplied,
}

impl fmt::Display for IoPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoPhase::NothingChanged => write!(f, "nothing was changed"),
            IoPhase::PartiallyApplied => write!(f, "partially applied, manual recovery needed"),
        }
    }
}

/// Request validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid pull request number: {0}")]
    InvalidPullRequest(String),

    #[error("Unknown config list: {0}")]
    UnknownConfigList(String),

    #[error("Unknown config key: {0}")]
    UnknownConfigKey(String),

    #[error("Cannot move the server directory to {0}: it is inside the current directory")]
    MoveIntoChild(PathBuf),

    #[error("Cannot move the server directory to {0}: the path already exists")]
    MoveTargetExists(PathBuf),

    #[error("The watchdog must be offline for this operation")]
    WatchdogRunning,

    #[error("The repository has not been set up")]
    RepositoryMissing,

    #[error("The compiler has not been initialized")]
    CompilerUninitialized,

    #[error("No compiled game is available, compile first")]
    NoCompiledArtifact,

    #[error("No runtime is installed")]
    RuntimeMissing,

    #[error("Invalid runtime version: {0}")]
    InvalidRuntimeVersion(String),

    #[error("Port must be non-zero")]
    InvalidPort,

    #[error("Chat is disabled")]
    ChatDisabled,

    #[error("Invalid chat channel: {0:?}")]
    InvalidChannel(String),

    #[error("{0}")]
    Other(String),
}

/// The error type returned by every core operation.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{resource} is busy, try again later")]
    Busy { resource: Resource },

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    #[error("I/O error while {context} ({phase}): {source}")]
    Io {
        context: String,
        phase: IoPhase,
        #[source]
        source: std::io::Error,
    },

    #[error("Lock order violation: cannot take {requested} while holding {held}")]
    LockOrder { held: Resource, requested: Resource },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("The service is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Builds an [`ControlError::Io`] for a step that did not touch anything yet.
    pub fn io_untouched(context: impl Into<String>, source: std::io::Error) -> Self {
        ControlError::Io {
            context: context.into(),
            phase: IoPhase::NothingChanged,
            source,
        }
    }

    /// Builds an [`ControlError::Io`] for a step that left a partial change behind.
    pub fn io_partial(context: impl Into<String>, source: std::io::Error) -> Self {
        ControlError::Io {
            context: context.into(),
            phase: IoPhase::PartiallyApplied,
            source,
        }
    }

    pub fn external(tool: impl Into<String>, message: impl Into<String>) -> Self {
        ControlError::ExternalTool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Wire classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Busy { .. } => ErrorKind::Busy,
            ControlError::Validation(_) => ErrorKind::Validation,
            ControlError::ExternalTool { .. } => ErrorKind::ExternalTool,
            ControlError::Io { .. } => ErrorKind::Io,
            ControlError::LockOrder { .. } => ErrorKind::Internal,
            ControlError::Config(_) => ErrorKind::Config,
            ControlError::ShuttingDown => ErrorKind::ShuttingDown,
            ControlError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, ControlError::Busy { .. })
    }
}

/// Coarse error classification carried over RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Busy,
    Validation,
    ExternalTool,
    Io,
    Config,
    ShuttingDown,
    Internal,
}

impl ErrorKind {
    /// Whether the caller should fix its input rather than retry.
    pub fn is_caller_error(self) -> bool {
        matches!(self, ErrorKind::Validation)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Busy => "busy",
            ErrorKind::Validation => "validation",
            ErrorKind::ExternalTool => "external tool",
            ErrorKind::Io => "io",
            ErrorKind::Config => "config",
            ErrorKind::ShuttingDown => "shutting down",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}
