//! Messages exchanged between spawner layers.
//!
//! Requests travel as array messages (`["spawn_application", name, value,
//! ...]`). Replies start with a status message; failures are followed by a
//! JSON scalar describing the error so the parent can rebuild it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::loader::BootstrapError;
use super::options::SpawnOptions;
use crate::channel::Channel;
use crate::error::{Error, Result, SpawnFailure};
use crate::server::Request;

/// Ceiling for error scalars read from a spawner child.
pub(crate) const MAX_ERROR_SIZE: usize = 1024 * 1024;

pub(crate) const SPAWN_APPLICATION: &str = "spawn_application";
pub(crate) const RELOAD: &str = "reload";
pub(crate) const STATUS: &str = "status";

/// Requests understood by application and framework spawner children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnerRequest {
    Spawn(SpawnOptions),
    /// Drop one cached application spawner, or all of them.
    Reload(Option<PathBuf>),
    /// List cached application roots.
    Status,
}

impl Request for SpawnerRequest {
    fn decode(name: &str, args: &[String]) -> Result<Self> {
        match name {
            SPAWN_APPLICATION => Ok(Self::Spawn(SpawnOptions::from_args(args)?)),
            RELOAD => Ok(Self::Reload(args.first().map(PathBuf::from))),
            STATUS => Ok(Self::Status),
            other => Err(Error::UnknownMessage(other.to_string())),
        }
    }

    fn encode(&self) -> Vec<String> {
        match self {
            Self::Spawn(options) => {
                let mut message = vec![SPAWN_APPLICATION.to_string()];
                message.extend(options.to_args());
                message
            }
            Self::Reload(root) => {
                let mut message = vec![RELOAD.to_string()];
                message.extend(root.iter().map(|r| r.display().to_string()));
                message
            }
            Self::Status => vec![STATUS.to_string()],
        }
    }
}

/// Requests understood by a spawn manager running as a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerRequest {
    Spawn(SpawnOptions),
    Reload(Option<PathBuf>),
}

impl Request for ManagerRequest {
    fn decode(name: &str, args: &[String]) -> Result<Self> {
        match name {
            SPAWN_APPLICATION => Ok(Self::Spawn(SpawnOptions::from_args(args)?)),
            RELOAD => Ok(Self::Reload(args.first().map(PathBuf::from))),
            other => Err(Error::UnknownMessage(other.to_string())),
        }
    }

    fn encode(&self) -> Vec<String> {
        match self {
            Self::Spawn(options) => SpawnerRequest::Spawn(options.clone()).encode(),
            Self::Reload(root) => SpawnerRequest::Reload(root.clone()).encode(),
        }
    }
}

/// An [`Error`] flattened for transport from a spawner child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WireError {
    SpawnFailed {
        app_root: PathBuf,
        cause: SpawnFailure,
    },
    FrameworkInit {
        runtime: String,
        error: BootstrapError,
    },
    InvalidAppRoot {
        path: PathBuf,
        reason: String,
    },
    ServerExited {
        server: String,
        detail: String,
    },
    Other {
        message: String,
    },
}

impl From<&Error> for WireError {
    fn from(error: &Error) -> Self {
        match error {
            Error::SpawnFailed { app_root, cause } => Self::SpawnFailed {
                app_root: app_root.clone(),
                cause: cause.clone(),
            },
            Error::FrameworkInit { runtime, source } => Self::FrameworkInit {
                runtime: runtime.clone(),
                error: source.clone(),
            },
            Error::InvalidAppRoot { path, reason } => Self::InvalidAppRoot {
                path: path.clone(),
                reason: reason.clone(),
            },
            Error::ServerExited { server, detail } => Self::ServerExited {
                server: server.clone(),
                detail: detail.clone(),
            },
            other => Self::Other {
                message: other.to_string(),
            },
        }
    }
}

impl From<WireError> for Error {
    fn from(error: WireError) -> Self {
        match error {
            WireError::SpawnFailed { app_root, cause } => Error::SpawnFailed { app_root, cause },
            WireError::FrameworkInit { runtime, error } => Error::FrameworkInit {
                runtime,
                source: error,
            },
            WireError::InvalidAppRoot { path, reason } => Error::InvalidAppRoot { path, reason },
            WireError::ServerExited { server, detail } => Error::ServerExited { server, detail },
            WireError::Other { message } => Error::Remote {
                category: "general".to_string(),
                message,
                details: String::new(),
            },
        }
    }
}

/// Outcome line a spawner child writes before any payload.
#[derive(Debug)]
pub(crate) enum Status {
    Success,
    Exception(WireError),
}

pub(crate) fn write_success(channel: &mut Channel) -> Result<()> {
    channel.write(&["success"])
}

pub(crate) fn write_exception(channel: &mut Channel, error: &WireError) -> Result<()> {
    channel.write(&["exception"])?;
    channel.write_scalar(&serde_json::to_vec(error)?)
}

/// Read a status line; `None` means the child closed the channel.
pub(crate) fn read_status(channel: &mut Channel) -> Result<Option<Status>> {
    let Some(message) = channel.read()? else {
        return Ok(None);
    };
    match message.first().map(String::as_str) {
        Some("success") if message.len() == 1 => Ok(Some(Status::Success)),
        Some("exception") if message.len() == 1 => {
            let data = channel.read_scalar(Some(MAX_ERROR_SIZE))?.ok_or_else(|| {
                Error::Protocol("end of stream while reading an error report".to_string())
            })?;
            Ok(Some(Status::Exception(serde_json::from_slice(&data)?)))
        }
        _ => Err(Error::Protocol(format!(
            "unexpected status message {:?}",
            message
        ))),
    }
}
