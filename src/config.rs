//! Tunables for spawner caches and process shutdown.
//!
//! Everything has a compiled-in default; a few knobs can be overridden from
//! the environment with [`SpawnerConfig::with_env_overrides`].
//!
//! - `WARMSPAWN_APP_SPAWNER_IDLE` - idle seconds before an application spawner is stopped
//! - `WARMSPAWN_FRAMEWORK_SPAWNER_IDLE` - idle seconds before a framework spawner is stopped
//! - `WARMSPAWN_STOP_GRACE_MS` - wait after closing a control channel before SIGTERM
//! - `WARMSPAWN_KILL_GRACE_MS` - wait after SIGTERM before SIGKILL

use std::time::Duration;

use tracing::warn;

/// Idle time after which a cached application spawner is stopped.
pub const DEFAULT_APP_SPAWNER_IDLE: Duration = Duration::from_secs(600);

/// Idle time after which a cached framework spawner is stopped.
pub const DEFAULT_FRAMEWORK_SPAWNER_IDLE: Duration = Duration::from_secs(1800);

/// Staged shutdown of a child process: close its channel and wait
/// `exit_grace`, then SIGTERM and wait `term_grace`, then SIGKILL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub exit_grace: Duration,
    pub term_grace: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            exit_grace: Duration::from_secs(4),
            term_grace: Duration::from_secs(1),
        }
    }
}

impl StopPolicy {
    pub fn new(exit_grace: Duration, term_grace: Duration) -> Self {
        Self {
            exit_grace,
            term_grace,
        }
    }
}

/// Evictor polling bounds for an [`IdleRegistry`](crate::registry::IdleRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Lower clamp on the polling interval.
    pub min_interval: Duration,
    /// Upper clamp on the polling interval.
    pub max_interval: Duration,
    /// Added to every interval to absorb timer inaccuracy.
    pub slack: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(3600),
            slack: Duration::from_millis(200),
        }
    }
}

impl RegistryConfig {
    /// Clamp a shortest idle budget into the polling interval.
    pub fn interval_for(&self, shortest_idle: Duration) -> Duration {
        shortest_idle.max(self.min_interval).min(self.max_interval) + self.slack
    }
}

/// Configuration shared by every layer of the spawner hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnerConfig {
    pub app_spawner_idle: Duration,
    pub framework_spawner_idle: Duration,
    pub stop_policy: StopPolicy,
    pub registry: RegistryConfig,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            app_spawner_idle: DEFAULT_APP_SPAWNER_IDLE,
            framework_spawner_idle: DEFAULT_FRAMEWORK_SPAWNER_IDLE,
            stop_policy: StopPolicy::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl SpawnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app_spawner_idle(mut self, idle: Duration) -> Self {
        self.app_spawner_idle = idle;
        self
    }

    pub fn with_framework_spawner_idle(mut self, idle: Duration) -> Self {
        self.framework_spawner_idle = idle;
        self
    }

    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Apply `WARMSPAWN_*` environment overrides. Unparsable values are
    /// logged and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(secs) = env_u64("WARMSPAWN_APP_SPAWNER_IDLE") {
            self.app_spawner_idle = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("WARMSPAWN_FRAMEWORK_SPAWNER_IDLE") {
            self.framework_spawner_idle = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("WARMSPAWN_STOP_GRACE_MS") {
            self.stop_policy.exit_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("WARMSPAWN_KILL_GRACE_MS") {
            self.stop_policy.term_grace = Duration::from_millis(ms);
        }
        self
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring non-numeric environment override");
            None
        }
    }
}
