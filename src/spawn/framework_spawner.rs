//! Spawner that keeps a shared runtime loaded and caches one
//! [`ApplicationSpawner`] per application root beneath it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::Pid;
use tracing::{debug, info, warn};

use super::app_spawner::ApplicationSpawner;
use super::application::Application;
use super::loader::Loader;
use super::options::SpawnOptions;
use super::protocol::{
    self, RELOAD, SPAWN_APPLICATION, STATUS, SpawnerRequest, Status, WireError,
};
use crate::channel::Channel;
use crate::config::SpawnerConfig;
use crate::error::{Error, Result, SpawnFailure};
use crate::registry::{IdleRegistry, IdleResource};
use crate::server::{HandlerTable, Request, Server, ServerProcess};

const SERVER_NAME: &str = "framework spawner";

struct FrameworkServer {
    loader: Arc<dyn Loader>,
    runtime: String,
    config: SpawnerConfig,
    /// Created in the child by `initialize_server`.
    spawners: Option<IdleRegistry<PathBuf, ApplicationSpawner>>,
}

impl FrameworkServer {
    fn spawners(&self) -> Result<&IdleRegistry<PathBuf, ApplicationSpawner>> {
        self.spawners.as_ref().ok_or(Error::ServerNotStarted)
    }

    fn spawn(&self, options: &SpawnOptions) -> Result<Application> {
        let spawners = self.spawners()?;
        let app_root = options.app_root().to_path_buf();
        let spawner = spawners.lookup_or_add(app_root.clone(), || {
            let spawner =
                ApplicationSpawner::new(Arc::clone(&self.loader), options.clone(), &self.config);
            spawner.start()?;
            Ok(spawner)
        })?;

        match spawner.spawn_application(options) {
            Err(e) if e.is_server_error() => {
                warn!(app_root = %app_root.display(), error = %e, "Dropping dead application spawner");
                if let Err(delete) = spawners.delete_if_same(&app_root, &spawner) {
                    warn!(error = %delete, "Could not drop application spawner");
                }
                // The dead one was ours; our parent still has a working
                // framework spawner.
                Err(Error::SpawnFailed {
                    app_root,
                    cause: SpawnFailure::Exited(e.to_string()),
                })
            }
            result => result,
        }
    }

    fn handle_spawn(&mut self, channel: &mut Channel, request: SpawnerRequest) -> Result<()> {
        let SpawnerRequest::Spawn(options) = request else {
            return Err(Error::Protocol("expected a spawn request".to_string()));
        };
        match self.spawn(&options) {
            Ok(mut app) => {
                protocol::write_success(channel)?;
                app.write_to_channel(channel)?;
                app.close();
                Ok(())
            }
            Err(e) => protocol::write_exception(channel, &WireError::from(&e)),
        }
    }

    fn handle_reload(&mut self, channel: &mut Channel, request: SpawnerRequest) -> Result<()> {
        let SpawnerRequest::Reload(app_root) = request else {
            return Err(Error::Protocol("expected a reload request".to_string()));
        };
        let spawners = self.spawners()?;
        match app_root {
            Some(root) => {
                let removed = spawners.delete(root.as_path())?;
                debug!(app_root = %root.display(), removed, "Reloaded application");
            }
            None => {
                spawners.clear()?;
                debug!(runtime = %self.runtime, "Reloaded all applications");
            }
        }
        channel.write(&["ok"])
    }

    fn handle_status(&mut self, channel: &mut Channel, _: SpawnerRequest) -> Result<()> {
        let mut message = vec!["status".to_string()];
        let mut roots = self.spawners()?.keys();
        roots.sort();
        message.extend(roots.iter().map(|root| root.display().to_string()));
        channel.write(&message)
    }
}

impl Server for FrameworkServer {
    type Request = SpawnerRequest;

    fn handlers(&self) -> HandlerTable<Self, SpawnerRequest> {
        HandlerTable::new()
            .register(SPAWN_APPLICATION, Self::handle_spawn)
            .register(RELOAD, Self::handle_reload)
            .register(STATUS, Self::handle_status)
    }

    fn before_fork(&mut self) {
        self.loader.collect_garbage();
    }

    fn initialize_server(&mut self, channel: &mut Channel) -> Result<()> {
        if let Err(bootstrap) = self.loader.preload_runtime(&self.runtime) {
            let error = Error::FrameworkInit {
                runtime: self.runtime.clone(),
                source: bootstrap,
            };
            protocol::write_exception(channel, &WireError::from(&error))?;
            return Err(error);
        }
        match IdleRegistry::new(self.config.registry) {
            Ok(registry) => {
                self.spawners = Some(registry);
                protocol::write_success(channel)
            }
            Err(error) => {
                protocol::write_exception(channel, &WireError::from(&error))?;
                Err(error)
            }
        }
    }

    fn finalize_server(&mut self) {
        if let Some(spawners) = self.spawners.take()
            && let Err(e) = spawners.cleanup()
        {
            warn!(error = %e, "Failed to stop cached application spawners");
        }
    }
}

/// One preloaded runtime, shared by every application that needs it.
///
/// Application spawners live in the forked child and are idle-evicted
/// there; the parent only sees the control channel.
pub struct FrameworkSpawner {
    runtime: String,
    process: ServerProcess<FrameworkServer>,
}

impl FrameworkSpawner {
    /// `options` supplies the idle timeout (falling back to `config`).
    pub fn new(
        loader: Arc<dyn Loader>,
        runtime: impl Into<String>,
        options: &SpawnOptions,
        config: &SpawnerConfig,
    ) -> Self {
        let runtime = runtime.into();
        let idle = options
            .framework_spawner_timeout
            .unwrap_or(config.framework_spawner_idle);
        let server = FrameworkServer {
            loader,
            runtime: runtime.clone(),
            config: config.clone(),
            spawners: None,
        };
        Self {
            runtime,
            process: ServerProcess::new(server)
                .with_stop_policy(config.stop_policy)
                .with_max_idle_time(Some(idle)),
        }
    }

    /// Fork the spawner and wait until the runtime is loaded.
    ///
    /// A loader failure comes back as [`Error::FrameworkInit`].
    pub fn start(&self) -> Result<()> {
        let pid = self.process.start()?;
        let failure = match self.process.with_channel(protocol::read_status) {
            Ok(Some(Status::Success)) => {
                info!(%pid, runtime = %self.runtime, "Framework spawner started");
                return Ok(());
            }
            Ok(Some(Status::Exception(wire))) => wire.into(),
            Ok(None) => server_exited("end of stream during preload"),
            Err(e) => relabel(e),
        };
        if let Err(e) = self.process.stop() {
            warn!(runtime = %self.runtime, error = %e, "Could not stop framework spawner");
        }
        Err(failure)
    }

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
            .map_err(relabel)
    }

    /// Stop the cached spawner for `app_root`, or every cached spawner.
    pub fn reload(&self, app_root: Option<&Path>) -> Result<()> {
        let request = SpawnerRequest::Reload(app_root.map(Path::to_path_buf)).encode();
        self.process
            .with_channel(|channel| {
                channel.write(&request)?;
                match channel.read()? {
                    Some(reply) if reply == ["ok"] => Ok(()),
                    other => Err(Error::Protocol(format!(
                        "unexpected reload reply {:?}",
                        other
                    ))),
                }
            })
            .map_err(relabel)
    }

    /// Application roots that currently have a cached spawner.
    pub fn cached_app_roots(&self) -> Result<Vec<PathBuf>> {
        let request = SpawnerRequest::Status.encode();
        self.process
            .with_channel(|channel| {
                channel.write(&request)?;
                match channel.read()? {
                    Some(reply) if reply.first().is_some_and(|tag| tag == "status") => {
                        Ok(reply[1..].iter().map(PathBuf::from).collect())
                    }
                    other => Err(Error::Protocol(format!(
                        "unexpected status reply {:?}",
                        other
                    ))),
                }
            })
            .map_err(relabel)
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
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

impl IdleResource for FrameworkSpawner {
    fn max_idle_time(&self) -> Option<Duration> {
        self.process.max_idle_time()
    }

    fn is_started(&self) -> bool {
        self.process.is_started()
    }

    fn stop(&self) -> Result<()> {
        IdleResource::stop(&self.process)
    }
}

fn server_exited(detail: &str) -> Error {
    Error::ServerExited {
        server: SERVER_NAME.to_string(),
        detail: detail.to_string(),
    }
}

fn relabel(e: Error) -> Error {
    if e.is_transport() {
        server_exited(&e.to_string())
    } else {
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StopPolicy;
    use crate::spawn::testing::{StubLoader, app_dir};

    fn config() -> SpawnerConfig {
        SpawnerConfig::new().with_stop_policy(StopPolicy::new(
            Duration::from_secs(2),
            Duration::from_millis(200),
        ))
    }

    fn started(runtime: &str) -> FrameworkSpawner {
        let dir = app_dir(&[]);
        let spawner = FrameworkSpawner::new(
            Arc::new(StubLoader::default()),
            runtime,
            &SpawnOptions::new(dir.path()),
            &config(),
        );
        spawner.start().unwrap();
        spawner
    }

    #[test]
    fn test_caches_one_app_spawner_per_root() {
        let spawner = started("2.3.2");
        let first = app_dir(&[]);
        let second = app_dir(&[]);
        let first_options = SpawnOptions::new(first.path()).canonicalize().unwrap();
        let second_options = SpawnOptions::new(second.path()).canonicalize().unwrap();

        let app = spawner.spawn_application(&first_options).unwrap();
        assert_eq!(app.app_root(), first_options.app_root());
        spawner.spawn_application(&first_options).unwrap();
        spawner.spawn_application(&second_options).unwrap();

        let mut roots = spawner.cached_app_roots().unwrap();
        roots.sort();
        let mut expected = vec![
            first_options.app_root().to_path_buf(),
            second_options.app_root().to_path_buf(),
        ];
        expected.sort();
        assert_eq!(roots, expected);

        spawner.reload(Some(first_options.app_root())).unwrap();
        assert_eq!(
            spawner.cached_app_roots().unwrap(),
            vec![second_options.app_root().to_path_buf()]
        );

        spawner.reload(None).unwrap();
        assert!(spawner.cached_app_roots().unwrap().is_empty());
        spawner.stop().unwrap();
    }

    #[test]
    fn test_runtime_preload_failure_is_framework_init() {
        let dir = app_dir(&[]);
        let spawner = FrameworkSpawner::new(
            Arc::new(StubLoader::default()),
            "broken",
            &SpawnOptions::new(dir.path()),
            &config(),
        );
        let err = spawner.start().unwrap_err();
        assert!(matches!(err, Error::FrameworkInit { ref runtime, .. } if runtime == "broken"));
        assert!(!spawner.is_started());
    }

    #[test]
    fn test_failed_app_preload_is_not_cached() {
        let spawner = started("2.3.2");
        let dir = app_dir(&[("fail_preload", "missing constant")]);
        let options = SpawnOptions::new(dir.path()).canonicalize().unwrap();

        let err = spawner.spawn_application(&options).unwrap_err();
        assert!(!err.is_server_error());
        assert_eq!(
            err.bootstrap().map(|b| b.message.as_str()),
            Some("missing constant")
        );
        assert!(spawner.cached_app_roots().unwrap().is_empty());
    }

    #[test]
    fn test_dead_framework_spawner_is_a_server_error() {
        let spawner = started("2.3.2");
        let dir = app_dir(&[]);
        let options = SpawnOptions::new(dir.path()).canonicalize().unwrap();

        nix::sys::signal::kill(spawner.pid().unwrap(), nix::sys::signal::Signal::SIGKILL)
            .unwrap();
        let err = spawner.spawn_application(&options).unwrap_err();
        assert!(matches!(err, Error::ServerExited { .. }), "{err}");
        assert!(err.is_server_error());
    }
}
