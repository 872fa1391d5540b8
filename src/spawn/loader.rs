//! The host-supplied half of spawning: loading a runtime and an
//! application into a process.
//!
//! warmspawn knows how to fork, cache and hand out workers but nothing about
//! any particular language runtime. A host implements [`Loader`] for its
//! runtime; the spawners call it at the matching points:
//!
//! | hook                    | runs in                                   |
//! |-------------------------|-------------------------------------------|
//! | `detect_runtime`        | spawn manager, to pick a cache key        |
//! | `preload_runtime`       | framework spawner child, once             |
//! | `preload_app`           | application spawner child, once           |
//! | `startup_file`          | each freshly forked worker, before load   |
//! | `load_app`              | each freshly forked worker                |
//! | `refresh_dependencies`  | spawn manager, after a missing dependency |
//! | `collect_garbage`       | any spawner, right before it forks        |

use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::application::ListenEndpoint;
use super::options::SpawnOptions;

/// Category of a loader failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapKind {
    General,
    /// The application could not reach its database.
    Database,
    /// A library or package the application needs is not installed.
    MissingDependency,
    /// The application exited on its own while being loaded.
    Exited,
    /// The runtime version the application asks for is not installed.
    VersionNotFound,
    /// The shared runtime/framework failed to load.
    Framework,
}

impl BootstrapKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Database => "database",
            Self::MissingDependency => "missing_dependency",
            Self::Exited => "exited",
            Self::VersionNotFound => "version_not_found",
            Self::Framework => "framework",
        }
    }
}

impl fmt::Display for BootstrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BootstrapKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(Self::General),
            "database" => Ok(Self::Database),
            "missing_dependency" => Ok(Self::MissingDependency),
            "exited" => Ok(Self::Exited),
            "version_not_found" => Ok(Self::VersionNotFound),
            "framework" => Ok(Self::Framework),
            other => Err(format!("unknown bootstrap error kind '{}'", other)),
        }
    }
}

/// A failure reported by a [`Loader`], carried unchanged across process
/// boundaries.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct BootstrapError {
    pub kind: BootstrapKind,
    /// One line summary.
    pub message: String,
    /// Free-form detail such as a formatted backtrace.
    #[serde(default)]
    pub details: String,
}

impl BootstrapError {
    pub fn new(kind: BootstrapKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: String::new(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new(BootstrapKind::General, message)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Loads runtimes and applications on behalf of the spawners.
///
/// Implementations must be usable from forked children, so they should not
/// rely on threads started before a fork.
pub trait Loader: Send + Sync + 'static {
    /// The runtime version `app_root` needs, if it uses a shared one.
    /// `None` means the application carries its own runtime and gets an
    /// application-level cache key.
    fn detect_runtime(&self, _app_root: &Path) -> Result<Option<String>, BootstrapError> {
        Ok(None)
    }

    /// Load the shared runtime identified by `runtime` into the current
    /// process.
    fn preload_runtime(&self, _runtime: &str) -> Result<(), BootstrapError> {
        Ok(())
    }

    /// Load whatever can be shared between workers of one application.
    fn preload_app(&self, _options: &SpawnOptions) -> Result<(), BootstrapError> {
        Ok(())
    }

    /// Finish loading the application inside a freshly forked worker and
    /// return the handle that serves it.
    fn load_app(&self, options: &SpawnOptions) -> Result<Box<dyn AppWorker>, BootstrapError>;

    /// The file whose owner a root worker switches to when
    /// `lower_privilege` is set.
    fn startup_file(&self, app_root: &Path) -> PathBuf {
        app_root.to_path_buf()
    }

    /// Re-read installed dependencies after one was reported missing.
    fn refresh_dependencies(&self) {}

    /// Called right before a spawner forks.
    fn collect_garbage(&self) {}
}

/// A loaded application inside a worker process.
pub trait AppWorker {
    /// Where the worker accepts connections. Must not be empty.
    fn sockets(&self) -> Vec<ListenEndpoint>;

    /// Serve until the worker decides to exit. `owner_pipe` reaches end of
    /// stream once every holder of the matching write end released it.
    fn serve(self: Box<Self>, owner_pipe: OwnerPipe) -> Result<(), BootstrapError>;
}

/// Read end of a worker's owner pipe.
#[derive(Debug)]
pub struct OwnerPipe {
    file: File,
}

impl OwnerPipe {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }

    /// Block until every owner has released the worker.
    pub fn wait_released(mut self) -> std::io::Result<()> {
        let mut buf = [0u8; 64];
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn into_fd(self) -> OwnedFd {
        OwnedFd::from(self.file)
    }
}
