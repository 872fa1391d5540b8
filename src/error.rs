//! Error types for warmspawn.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::spawn::BootstrapError;

/// Main error type for warmspawn.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message body of {size} bytes exceeds the {max} byte frame limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Message element {0:?} contains the NUL frame delimiter")]
    DelimiterInElement(String),

    #[error("Scalar of {size} bytes exceeds the maximum allowed size of {max} bytes")]
    ScalarTooLarge { size: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown message '{0}' received")]
    UnknownMessage(String),

    #[error("Server is already started")]
    ServerAlreadyStarted,

    #[error("Server is not started")]
    ServerNotStarted,

    #[error("Server has been stopped and cannot be started again")]
    ServerStopped,

    #[error("Registry has been cleaned up and no longer accepts changes")]
    RegistryClosed,

    #[error("Registry factory tried to re-enter the registry it is populating")]
    RegistryReentered,

    #[error("Invalid application root '{}': {reason}", path.display())]
    InvalidAppRoot { path: PathBuf, reason: String },

    #[error("Invalid spawn option '{name}': {reason}")]
    InvalidOption { name: String, reason: String },

    #[error("Could not spawn application '{}': {cause}", app_root.display())]
    SpawnFailed {
        app_root: PathBuf,
        cause: SpawnFailure,
    },

    #[error("Could not load framework '{runtime}': {source}")]
    FrameworkInit {
        runtime: String,
        #[source]
        source: BootstrapError,
    },

    #[error("The {server} exited unexpectedly: {detail}")]
    ServerExited { server: String, detail: String },

    #[error("{message}")]
    Remote {
        category: String,
        message: String,
        details: String,
    },
}

impl Error {
    /// Whether this error means the spawner answering the request is no
    /// longer usable and should be dropped from any cache holding it.
    pub fn is_server_error(&self) -> bool {
        match self {
            Self::ServerExited { .. } | Self::ServerStopped => true,
            Self::SpawnFailed { cause, .. } => matches!(cause, SpawnFailure::Transport(_)),
            _ => false,
        }
    }

    /// Whether this is a transport-level failure (broken channel, bad frame).
    pub(crate) fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Sys(_)
                | Self::Json(_)
                | Self::Protocol(_)
                | Self::MessageTooLarge { .. }
                | Self::ScalarTooLarge { .. }
        )
    }

    /// The loader-reported failure underneath this error, if any.
    pub fn bootstrap(&self) -> Option<&BootstrapError> {
        match self {
            Self::SpawnFailed {
                cause: SpawnFailure::Bootstrap(inner),
                ..
            } => Some(inner),
            Self::FrameworkInit { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Why a single spawn attempt failed. Serializable so a spawner child can
/// hand the cause to its parent unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum SpawnFailure {
    #[error("{0}")]
    Bootstrap(BootstrapError),

    #[error("worker exited during startup ({0})")]
    Exited(String),

    #[error("handshake violation: {0}")]
    Handshake(String),

    #[error("the application spawner exited unexpectedly: {0}")]
    Transport(String),
}

/// Result type alias for warmspawn operations.
pub type Result<T> = std::result::Result<T, Error>;
