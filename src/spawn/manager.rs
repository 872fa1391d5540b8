//! Top of the spawner hierarchy.
//!
//! [`SpawnManager`] turns "spawn this app" into "reuse or create a warm
//! spawner and ask it for a worker". Apps that share a runtime version go
//! through one cached [`FrameworkSpawner`]; apps that bring their own runtime
//! (or ask for `smart-lv2`) get a cached [`ApplicationSpawner`] each;
//! `conservative` spawns fork straight from the manager.
//!
//! [`SpawnManagerServer`] exposes a manager over a [`Channel`] so an
//! embedding web server can drive it from another process, using
//! [`SpawnManagerClient`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{SigHandler, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::app_spawner::ApplicationSpawner;
use super::application::Application;
use super::framework_spawner::FrameworkSpawner;
use super::loader::{BootstrapKind, Loader};
use super::options::{SpawnMethod, SpawnOptions};
use super::protocol::{MAX_ERROR_SIZE, ManagerRequest, RELOAD, SPAWN_APPLICATION};
use crate::channel::Channel;
use crate::config::SpawnerConfig;
use crate::error::{Error, Result, SpawnFailure};
use crate::registry::{IdleRegistry, IdleResource};
use crate::server::{HandlerTable, Request, Server};

/// Normalized category of a failed spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpawnErrorKind {
    InvalidAppRoot,
    VersionNotFound,
    Database,
    MissingDependency,
    AppExited,
    AppInit,
    FrameworkInit,
    Server,
}

impl SpawnErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidAppRoot => "invalid_app_root",
            Self::VersionNotFound => "version_not_found",
            Self::Database => "database",
            Self::MissingDependency => "missing_dependency",
            Self::AppExited => "app_exited",
            Self::AppInit => "app_init",
            Self::FrameworkInit => "framework_init",
            Self::Server => "server",
        }
    }

    fn from_bootstrap(kind: BootstrapKind, fallback: Self) -> Self {
        match kind {
            BootstrapKind::Database => Self::Database,
            BootstrapKind::MissingDependency => Self::MissingDependency,
            BootstrapKind::VersionNotFound => Self::VersionNotFound,
            BootstrapKind::Exited => Self::AppExited,
            BootstrapKind::Framework => Self::FrameworkInit,
            BootstrapKind::General => fallback,
        }
    }
}

impl fmt::Display for SpawnErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A spawn failure as reported to the caller of [`SpawnManager::spawn`].
///
/// The category is normalized; the underlying [`Error`] is kept as the
/// source and any loader-provided details (a formatted exception) are
/// available through [`details`](Self::details).
#[derive(Debug, Error)]
#[error("{source}")]
pub struct SpawnError {
    kind: SpawnErrorKind,
    #[source]
    source: Error,
}

impl SpawnError {
    /// Sort an error from any spawner layer into a category.
    pub fn classify(source: Error) -> Self {
        let kind = match &source {
            Error::InvalidAppRoot { .. } => SpawnErrorKind::InvalidAppRoot,
            Error::FrameworkInit { source, .. } => {
                SpawnErrorKind::from_bootstrap(source.kind, SpawnErrorKind::FrameworkInit)
            }
            Error::SpawnFailed { cause, .. } => match cause {
                SpawnFailure::Bootstrap(b) => {
                    SpawnErrorKind::from_bootstrap(b.kind, SpawnErrorKind::AppInit)
                }
                SpawnFailure::Exited(_) => SpawnErrorKind::AppExited,
                SpawnFailure::Handshake(_) => SpawnErrorKind::AppInit,
                SpawnFailure::Transport(_) => SpawnErrorKind::Server,
            },
            _ => SpawnErrorKind::Server,
        };
        Self { kind, source }
    }

    pub fn kind(&self) -> SpawnErrorKind {
        self.kind
    }

    pub fn category(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Nested cause text, e.g. the application's backtrace. Empty if the
    /// failure carried none.
    pub fn details(&self) -> &str {
        match &self.source {
            Error::Remote { details, .. } => details,
            other => other.bootstrap().map_or("", |b| b.details.as_str()),
        }
    }

    pub fn into_inner(self) -> Error {
        self.source
    }
}

/// Which kind of spawner serves an application.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Runtime(String),
    App(PathBuf),
}

impl Target {
    fn key(&self) -> String {
        match self {
            Self::Runtime(runtime) => format!("version:{}", runtime),
            Self::App(root) => app_key(root),
        }
    }
}

fn app_key(app_root: &Path) -> String {
    format!("app:{}", app_root.display())
}

/// A spawner cached by the manager.
enum CachedSpawner {
    Framework(FrameworkSpawner),
    App(ApplicationSpawner),
}

impl CachedSpawner {
    fn spawn_application(&self, options: &SpawnOptions) -> Result<Application> {
        match self {
            Self::Framework(spawner) => spawner.spawn_application(options),
            Self::App(spawner) => spawner.spawn_application(options),
        }
    }

    fn pid(&self) -> Option<Pid> {
        match self {
            Self::Framework(spawner) => spawner.pid(),
            Self::App(spawner) => spawner.pid(),
        }
    }
}

impl IdleResource for CachedSpawner {
    fn max_idle_time(&self) -> Option<Duration> {
        match self {
            Self::Framework(spawner) => spawner.max_idle_time(),
            Self::App(spawner) => spawner.max_idle_time(),
        }
    }

    fn is_started(&self) -> bool {
        match self {
            Self::Framework(spawner) => spawner.is_started(),
            Self::App(spawner) => spawner.is_started(),
        }
    }

    fn stop(&self) -> Result<()> {
        match self {
            Self::Framework(spawner) => spawner.stop(),
            Self::App(spawner) => spawner.stop(),
        }
    }
}

/// Entry point for spawning application workers.
///
/// Safe to share between threads. Concurrent spawns of apps behind the
/// same cached spawner serialize on that spawner's control channel.
pub struct SpawnManager {
    loader: Arc<dyn Loader>,
    config: SpawnerConfig,
    spawners: IdleRegistry<String, CachedSpawner>,
    refresh_dependencies: AtomicBool,
}

impl SpawnManager {
    pub fn new(loader: Arc<dyn Loader>, config: SpawnerConfig) -> Result<Self> {
        let spawners = IdleRegistry::new(config.registry)?;
        Ok(Self {
            loader,
            config,
            spawners,
            refresh_dependencies: AtomicBool::new(false),
        })
    }

    /// Spawn one worker for `options.app_root()`.
    pub fn spawn(&self, options: SpawnOptions) -> std::result::Result<Application, SpawnError> {
        if self.refresh_dependencies.swap(false, Ordering::SeqCst) {
            debug!("Refreshing dependencies before spawn");
            self.loader.refresh_dependencies();
        }

        self.try_spawn(options).map_err(|e| {
            let error = SpawnError::classify(e);
            if error.kind() == SpawnErrorKind::MissingDependency {
                self.refresh_dependencies.store(true, Ordering::SeqCst);
            }
            warn!(category = error.category(), error = %error, "Spawn failed");
            error
        })
    }

    fn try_spawn(&self, options: SpawnOptions) -> Result<Application> {
        let options = options.canonicalize()?;
        let target = match options.spawn_method {
            SpawnMethod::Conservative => {
                return ApplicationSpawner::spawn_direct(self.loader.as_ref(), &options);
            }
            SpawnMethod::SmartLv2 => Target::App(options.app_root().to_path_buf()),
            SpawnMethod::Smart => self.detect(&options)?,
        };

        let key = target.key();
        let spawner = self
            .spawners
            .lookup_or_add(key.clone(), || self.create(&target, &options))?;

        match spawner.spawn_application(&options) {
            Err(e) if e.is_server_error() => {
                warn!(%key, error = %e, "Dropping dead spawner");
                if let Err(delete) = self.spawners.delete_if_same(&key, &spawner) {
                    warn!(%key, error = %delete, "Could not drop spawner");
                }
                Err(e)
            }
            result => result,
        }
    }

    fn detect(&self, options: &SpawnOptions) -> Result<Target> {
        let app_root = options.app_root();
        match self.loader.detect_runtime(app_root) {
            Ok(Some(runtime)) => Ok(Target::Runtime(runtime)),
            Ok(None) => Ok(Target::App(app_root.to_path_buf())),
            Err(bootstrap) => Err(Error::SpawnFailed {
                app_root: app_root.to_path_buf(),
                cause: SpawnFailure::Bootstrap(bootstrap),
            }),
        }
    }

    fn create(&self, target: &Target, options: &SpawnOptions) -> Result<CachedSpawner> {
        match target {
            Target::Runtime(runtime) => {
                let spawner = FrameworkSpawner::new(
                    Arc::clone(&self.loader),
                    runtime.clone(),
                    options,
                    &self.config,
                );
                spawner.start()?;
                Ok(CachedSpawner::Framework(spawner))
            }
            Target::App(_) => {
                let spawner =
                    ApplicationSpawner::new(Arc::clone(&self.loader), options.clone(), &self.config);
                spawner.start()?;
                Ok(CachedSpawner::App(spawner))
            }
        }
    }

    /// Drop preloaded code so the next spawn picks up changes.
    ///
    /// With `Some(root)` the app spawner cached for that root is stopped and
    /// every framework spawner drops its own spawner for it. With `None`
    /// every app spawner is stopped and every framework spawner is told to
    /// drop all of its spawners; the framework spawners themselves keep
    /// running.
    pub fn reload(&self, app_root: Option<&Path>) -> Result<()> {
        let app_root =
            app_root.map(|root| root.canonicalize().unwrap_or_else(|_| root.to_path_buf()));
        if let Some(root) = &app_root {
            self.spawners.delete(&app_key(root))?;
        }

        for (key, spawner) in self.spawners.entries() {
            match spawner.as_ref() {
                CachedSpawner::Framework(framework) => {
                    if let Err(e) = framework.reload(app_root.as_deref()) {
                        warn!(%key, error = %e, "Framework spawner failed to reload");
                        if e.is_server_error() {
                            self.spawners.delete_if_same(&key, &spawner)?;
                        }
                    }
                }
                CachedSpawner::App(_) if app_root.is_none() => {
                    self.spawners.delete(&key)?;
                }
                CachedSpawner::App(_) => {}
            }
        }
        info!(app_root = ?app_root, "Reloaded");
        Ok(())
    }

    /// Cache keys of the running spawners (`version:...` / `app:...`),
    /// sorted.
    pub fn cached_keys(&self) -> Vec<String> {
        let mut keys = self.spawners.keys();
        keys.sort();
        keys
    }

    /// Pid of the spawner cached under `key`, if it is running.
    pub fn spawner_pid(&self, key: &str) -> Option<Pid> {
        self.spawners.get(key).and_then(|spawner| spawner.pid())
    }

    /// Stop every cached spawner. The manager is unusable afterwards.
    pub fn cleanup(&self) -> Result<()> {
        self.spawners.cleanup()
    }
}

static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_reload(_: libc::c_int) {
    RELOAD_REQUESTED.store(true, Ordering::SeqCst);
}

/// A [`SpawnManager`] served over a control channel.
///
/// Replies to `spawn_application` with `["ok"]`, the application message and
/// the owner pipe, or with `["error", category, message]` followed by a
/// scalar holding the details. `reload` is answered with `["ok"]`. SIGHUP
/// reloads everything.
pub struct SpawnManagerServer {
    loader: Arc<dyn Loader>,
    config: SpawnerConfig,
    manager: Option<SpawnManager>,
}

impl SpawnManagerServer {
    pub fn new(loader: Arc<dyn Loader>, config: SpawnerConfig) -> Self {
        Self {
            loader,
            config,
            manager: None,
        }
    }

    fn manager(&self) -> Result<&SpawnManager> {
        self.manager.as_ref().ok_or(Error::ServerNotStarted)
    }

    fn handle_spawn(&mut self, channel: &mut Channel, request: ManagerRequest) -> Result<()> {
        let ManagerRequest::Spawn(options) = request else {
            return Err(Error::Protocol("expected a spawn request".to_string()));
        };
        let reply = match self.manager()?.spawn(options) {
            Ok(mut app) => {
                let reply = channel
                    .write(&["ok"])
                    .and_then(|()| app.write_to_channel(channel));
                app.close();
                reply
            }
            Err(e) => write_error(channel, e.category(), &e.to_string(), e.details()),
        };
        ignore_disconnect(reply)
    }

    fn handle_reload(&mut self, channel: &mut Channel, request: ManagerRequest) -> Result<()> {
        let ManagerRequest::Reload(app_root) = request else {
            return Err(Error::Protocol("expected a reload request".to_string()));
        };
        let reply = match self.manager()?.reload(app_root.as_deref()) {
            Ok(()) => channel.write(&["ok"]),
            Err(e) => write_error(channel, SpawnErrorKind::Server.as_str(), &e.to_string(), ""),
        };
        ignore_disconnect(reply)
    }
}

fn write_error(channel: &mut Channel, category: &str, message: &str, details: &str) -> Result<()> {
    let message = message.replace('\0', " ");
    channel.write(&["error", category, message.as_str()])?;
    channel.write_scalar(details.as_bytes())
}

/// A client hanging up mid-reply is its own business.
fn ignore_disconnect(reply: Result<()>) -> Result<()> {
    match reply {
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!("Client disconnected before the reply was written");
            Ok(())
        }
        other => other,
    }
}

impl Server for SpawnManagerServer {
    type Request = ManagerRequest;

    fn handlers(&self) -> HandlerTable<Self, ManagerRequest> {
        HandlerTable::new()
            .register(SPAWN_APPLICATION, Self::handle_spawn)
            .register(RELOAD, Self::handle_reload)
    }

    fn signal_handlers(&self) -> Vec<(Signal, SigHandler)> {
        vec![(Signal::SIGHUP, SigHandler::Handler(request_reload))]
    }

    fn initialize_server(&mut self, _channel: &mut Channel) -> Result<()> {
        RELOAD_REQUESTED.store(false, Ordering::SeqCst);
        self.manager = Some(SpawnManager::new(
            Arc::clone(&self.loader),
            self.config.clone(),
        )?);
        Ok(())
    }

    fn on_signal_wakeup(&mut self) -> Result<()> {
        if RELOAD_REQUESTED.swap(false, Ordering::SeqCst) {
            info!("SIGHUP received, reloading all applications");
            if let Err(e) = self.manager()?.reload(None) {
                warn!(error = %e, "Reload failed");
            }
        }
        Ok(())
    }

    fn finalize_server(&mut self) {
        if let Some(manager) = self.manager.take()
            && let Err(e) = manager.cleanup()
        {
            warn!(error = %e, "Failed to stop cached spawners");
        }
    }
}

/// Talks to a [`SpawnManagerServer`] over a borrowed channel.
///
/// Failures reported by the server come back as [`Error::Remote`] carrying
/// the category, message and details.
pub struct SpawnManagerClient<'a> {
    channel: &'a mut Channel,
}

impl<'a> SpawnManagerClient<'a> {
    pub fn new(channel: &'a mut Channel) -> Self {
        Self { channel }
    }

    pub fn spawn(&mut self, options: &SpawnOptions) -> Result<Application> {
        self.channel
            .write(&ManagerRequest::Spawn(options.clone()).encode())?;
        match self.read_reply()? {
            None => Application::read_from_channel(self.channel),
            Some(error) => Err(error),
        }
    }

    pub fn reload(&mut self, app_root: Option<&Path>) -> Result<()> {
        self.channel
            .write(&ManagerRequest::Reload(app_root.map(Path::to_path_buf)).encode())?;
        match self.read_reply()? {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// `None` for `["ok"]`, the remote error otherwise.
    fn read_reply(&mut self) -> Result<Option<Error>> {
        let reply = self.channel.read()?.ok_or_else(|| {
            Error::Protocol("spawn manager closed the connection".to_string())
        })?;
        match reply.as_slice() {
            [ok] if ok == "ok" => Ok(None),
            [tag, category, message] if tag == "error" => {
                let details = self
                    .channel
                    .read_scalar(Some(MAX_ERROR_SIZE))?
                    .map(|data| String::from_utf8_lossy(&data).into_owned())
                    .unwrap_or_default();
                Ok(Some(Error::Remote {
                    category: category.clone(),
                    message: message.clone(),
                    details,
                }))
            }
            _ => Err(Error::Protocol(format!(
                "unexpected spawn manager reply {:?}",
                reply
            ))),
        }
    }
}
