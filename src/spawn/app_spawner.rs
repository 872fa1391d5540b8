//! Spawner for a single application with its code preloaded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::Pid;
use tracing::{debug, info, warn};

use super::application::Application;
use super::loader::Loader;
use super::options::SpawnOptions;
use super::protocol::{self, SPAWN_APPLICATION, SpawnerRequest, Status, WireError};
use super::worker;
use crate::channel::Channel;
use crate::config::SpawnerConfig;
use crate::error::{Error, Result, SpawnFailure};
use crate::registry::IdleResource;
use crate::server::{HandlerTable, Request, Server, ServerProcess};

/// Child side: preloads one application and forks a worker per request.
struct AppSpawnerServer {
    loader: Arc<dyn Loader>,
    options: SpawnOptions,
}

impl AppSpawnerServer {
    fn handle_spawn(&mut self, channel: &mut Channel, request: SpawnerRequest) -> Result<()> {
        let SpawnerRequest::Spawn(options) = request else {
            return Err(Error::Protocol("expected a spawn request".to_string()));
        };
        match worker::spawn_worker(self.loader.as_ref(), &options) {
            Ok(mut app) => {
                protocol::write_success(channel)?;
                app.write_to_channel(channel)?;
                app.close();
                Ok(())
            }
            Err(e) => {
                debug!(app_root = %options.app_root().display(), error = %e, "Worker spawn failed");
                protocol::write_exception(channel, &WireError::from(&e))
            }
        }
    }
}

impl Server for AppSpawnerServer {
    type Request = SpawnerRequest;

    fn handlers(&self) -> HandlerTable<Self, SpawnerRequest> {
        HandlerTable::new().register(SPAWN_APPLICATION, Self::handle_spawn)
    }

    fn before_fork(&mut self) {
        self.loader.collect_garbage();
    }

    fn initialize_server(&mut self, channel: &mut Channel) -> Result<()> {
        match self.loader.preload_app(&self.options) {
            Ok(()) => protocol::write_success(channel),
            Err(bootstrap) => {
                let error = Error::SpawnFailed {
                    app_root: self.options.app_root().to_path_buf(),
                    cause: SpawnFailure::Bootstrap(bootstrap),
                };
                protocol::write_exception(channel, &WireError::from(&error))?;
                Err(error)
            }
        }
    }
}

/// Keeps one application preloaded in a forked child so new workers only
/// pay for the fork.
///
/// Every failure of [`spawn_application`](Self::spawn_application) comes
/// back as [`Error::SpawnFailed`]. A broken control channel is reported with
/// a [`SpawnFailure::Transport`] cause, which callers treat as "this spawner
/// is gone".
pub struct ApplicationSpawner {
    app_root: PathBuf,
    process: ServerProcess<AppSpawnerServer>,
}

impl ApplicationSpawner {
    /// Prepare a spawner for `options.app_root()`. Nothing is forked until
    /// [`start`](Self::start).
    pub fn new(loader: Arc<dyn Loader>, options: SpawnOptions, config: &SpawnerConfig) -> Self {
        let idle = options
            .app_spawner_timeout
            .unwrap_or(config.app_spawner_idle);
        let app_root = options.app_root().to_path_buf();
        let server = AppSpawnerServer { loader, options };
        Self {
            app_root,
            process: ServerProcess::new(server)
                .with_stop_policy(config.stop_policy)
                .with_max_idle_time(Some(idle)),
        }
    }

    /// Fork the spawner and wait for it to finish preloading.
    pub fn start(&self) -> Result<()> {
        let pid = self.process.start()?;
        match self.process.with_channel(protocol::read_status) {
            Ok(Some(Status::Success)) => {
                info!(%pid, app_root = %self.app_root.display(), "Application spawner started");
                Ok(())
            }
            Ok(Some(Status::Exception(wire))) => {
                self.stop_after_failed_start();
                Err(wire.into())
            }
            Ok(None) => {
                self.stop_after_failed_start();
                Err(self.transport_failure("end of stream during preload"))
            }
            Err(e) => {
                self.stop_after_failed_start();
                Err(self.relabel(e))
            }
        }
    }

    fn stop_after_failed_start(&self) {
        if let Err(e) = self.process.stop() {
            warn!(app_root = %self.app_root.display(), error = %e, "Could not stop application spawner");
        }
    }

    /// Fork one worker of this application.
    pub fn spawn_application(&self, options: &SpawnOptions) -> Result<Application> {
        let request = SpawnerRequest::Spawn(options.clone()).encode();
        self.process
            .with_channel(|channel| {
                channel.write(&request)?;
                match protocol::read_status(channel)? {
                    Some(Status::Success) => Application::read_from_channel(channel),
                    Some(Status::Exception(wire)) => Err(wire.into()),
                    None => Err(Error::Protocol(
                        "control channel closed before a reply".to_string(),
                    )),
                }
            })
            .map_err(|e| self.relabel(e))
    }

    /// Fork a worker straight from the calling process, skipping the
    /// preloaded spawner.
    pub fn spawn_direct(loader: &dyn Loader, options: &SpawnOptions) -> Result<Application> {
        worker::spawn_direct(loader, options)
    }

    fn relabel(&self, e: Error) -> Error {
        if e.is_transport() {
            self.transport_failure(&e.to_string())
        } else {
            e
        }
    }

    fn transport_failure(&self, detail: &str) -> Error {
        Error::SpawnFailed {
            app_root: self.app_root.clone(),
            cause: SpawnFailure::Transport(detail.to_string()),
        }
    }

    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    pub fn pid(&self) -> Option<Pid> {
        self.process.pid()
    }

    pub fn is_started(&self) -> bool {
        self.process.is_started()
    }

    pub fn stop(&self) -> Result<()> {
        IdleResource::stop(&self.process)
    }
}

impl IdleResource for ApplicationSpawner {
    fn max_idle_time(&self) -> Option<std::time::Duration> {
        self.process.max_idle_time()
    }

    fn is_started(&self) -> bool {
        self.process.is_started()
    }

    fn stop(&self) -> Result<()> {
        IdleResource::stop(&self.process)
    }
}
