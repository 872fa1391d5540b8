//! Per-spawn configuration threaded through every spawner layer.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// How the spawn manager turns a request into a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SpawnMethod {
    /// Share a preloaded runtime between applications that use the same
    /// runtime version, with a preloaded application spawner per app below it.
    #[default]
    Smart,
    /// Preload each application on its own, without a shared runtime layer.
    SmartLv2,
    /// Fork every worker straight from the caller, nothing preloaded.
    Conservative,
}

impl FromStr for SpawnMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "smart" => Ok(Self::Smart),
            "smart-lv2" => Ok(Self::SmartLv2),
            "conservative" => Ok(Self::Conservative),
            other => Err(Error::InvalidOption {
                name: "spawn_method".to_string(),
                reason: format!("unknown spawn method '{}'", other),
            }),
        }
    }
}

impl fmt::Display for SpawnMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Smart => write!(f, "smart"),
            Self::SmartLv2 => write!(f, "smart-lv2"),
            Self::Conservative => write!(f, "conservative"),
        }
    }
}

/// Options for one spawn request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    app_root: PathBuf,
    pub app_group_name: String,
    pub app_type: String,
    pub environment: String,
    pub spawn_method: SpawnMethod,
    /// Idle budget for the application spawner; `None` uses the configured
    /// default and zero means never evicted.
    pub app_spawner_timeout: Option<Duration>,
    /// Idle budget for the framework spawner, same convention.
    pub framework_spawner_timeout: Option<Duration>,
    pub print_exceptions: bool,
    /// Double-fork workers so they are reparented away from the spawner.
    pub detach: bool,
    /// A worker forked as root switches to the owner of the loader's
    /// startup file, or to `lowest_user` when that owner is root or unknown.
    pub lower_privilege: bool,
    pub lowest_user: String,
    /// Exported into the worker's environment before the application loads.
    pub environment_variables: BTreeMap<String, String>,
    /// Anything else, handed through to the loader untouched.
    pub extra: BTreeMap<String, String>,
}

const KNOWN_KEYS: &[&str] = &[
    "app_root",
    "app_group_name",
    "app_type",
    "environment",
    "spawn_method",
    "app_spawner_timeout",
    "framework_spawner_timeout",
    "print_exceptions",
    "detach",
    "lower_privilege",
    "lowest_user",
    "environment_variables",
];

impl SpawnOptions {
    pub fn new(app_root: impl Into<PathBuf>) -> Self {
        let app_root = app_root.into();
        Self {
            app_group_name: app_root.display().to_string(),
            app_root,
            app_type: "rack".to_string(),
            environment: "production".to_string(),
            spawn_method: SpawnMethod::default(),
            app_spawner_timeout: None,
            framework_spawner_timeout: None,
            print_exceptions: true,
            detach: true,
            lower_privilege: false,
            lowest_user: "nobody".to_string(),
            environment_variables: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    pub fn with_spawn_method(mut self, method: SpawnMethod) -> Self {
        self.spawn_method = method;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_app_type(mut self, app_type: impl Into<String>) -> Self {
        self.app_type = app_type.into();
        self
    }

    pub fn with_app_spawner_timeout(mut self, timeout: Duration) -> Self {
        self.app_spawner_timeout = Some(timeout);
        self
    }

    pub fn with_framework_spawner_timeout(mut self, timeout: Duration) -> Self {
        self.framework_spawner_timeout = Some(timeout);
        self
    }

    pub fn with_detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    pub fn with_lower_privilege(mut self, lower_privilege: bool) -> Self {
        self.lower_privilege = lower_privilege;
        self
    }

    pub fn with_lowest_user(mut self, user: impl Into<String>) -> Self {
        self.lowest_user = user.into();
        self
    }

    pub fn with_environment_variable(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.environment_variables.insert(name.into(), value.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Resolve the app root to an absolute, symlink-free directory path.
    ///
    /// A group name that was left at its default follows the resolved root.
    pub fn canonicalize(mut self) -> Result<Self> {
        let resolved = std::fs::canonicalize(&self.app_root).map_err(|e| Error::InvalidAppRoot {
            path: self.app_root.clone(),
            reason: e.to_string(),
        })?;
        if !resolved.is_dir() {
            return Err(Error::InvalidAppRoot {
                path: self.app_root.clone(),
                reason: "not a directory".to_string(),
            });
        }
        if self.app_group_name == self.app_root.display().to_string() {
            self.app_group_name = resolved.display().to_string();
        }
        self.app_root = resolved;
        Ok(self)
    }

    /// Flatten into `(name, value)` pairs; `extra` entries follow the
    /// well-known fields.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("app_root".to_string(), self.app_root.display().to_string()),
            ("app_group_name".to_string(), self.app_group_name.clone()),
            ("app_type".to_string(), self.app_type.clone()),
            ("environment".to_string(), self.environment.clone()),
            ("spawn_method".to_string(), self.spawn_method.to_string()),
            (
                "app_spawner_timeout".to_string(),
                format_timeout(self.app_spawner_timeout),
            ),
            (
                "framework_spawner_timeout".to_string(),
                format_timeout(self.framework_spawner_timeout),
            ),
            (
                "print_exceptions".to_string(),
                self.print_exceptions.to_string(),
            ),
            ("detach".to_string(), self.detach.to_string()),
            (
                "lower_privilege".to_string(),
                self.lower_privilege.to_string(),
            ),
            ("lowest_user".to_string(), self.lowest_user.clone()),
        ];
        if !self.environment_variables.is_empty() {
            // JSON escapes newlines and NULs, so the map fits on one
            // handshake line and in one array-message element.
            pairs.push((
                "environment_variables".to_string(),
                serde_json::json!(self.environment_variables).to_string(),
            ));
        }
        pairs.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        pairs
    }

    /// Rebuild from pairs. Unknown names land in `extra`; a missing
    /// `app_root` is an error.
    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut known = BTreeMap::new();
        let mut extra = BTreeMap::new();
        for (name, value) in pairs {
            if KNOWN_KEYS.contains(&name.as_str()) {
                known.insert(name, value);
            } else {
                extra.insert(name, value);
            }
        }

        let app_root = known.remove("app_root").ok_or_else(|| Error::InvalidOption {
            name: "app_root".to_string(),
            reason: "missing".to_string(),
        })?;
        let mut options = Self::new(app_root);
        if let Some(group) = known.remove("app_group_name") {
            options.app_group_name = group;
        }
        if let Some(app_type) = known.remove("app_type") {
            options.app_type = app_type;
        }
        if let Some(environment) = known.remove("environment") {
            options.environment = environment;
        }
        if let Some(method) = known.remove("spawn_method") {
            options.spawn_method = method.parse()?;
        }
        if let Some(value) = known.remove("app_spawner_timeout") {
            options.app_spawner_timeout = parse_timeout("app_spawner_timeout", &value)?;
        }
        if let Some(value) = known.remove("framework_spawner_timeout") {
            options.framework_spawner_timeout =
                parse_timeout("framework_spawner_timeout", &value)?;
        }
        if let Some(value) = known.remove("print_exceptions") {
            options.print_exceptions = to_boolean(&value);
        }
        if let Some(value) = known.remove("detach") {
            options.detach = to_boolean(&value);
        }
        if let Some(value) = known.remove("lower_privilege") {
            options.lower_privilege = to_boolean(&value);
        }
        if let Some(user) = known.remove("lowest_user") {
            options.lowest_user = user;
        }
        if let Some(value) = known.remove("environment_variables") {
            options.environment_variables =
                serde_json::from_str(&value).map_err(|e| Error::InvalidOption {
                    name: "environment_variables".to_string(),
                    reason: e.to_string(),
                })?;
        }
        options.extra = extra;
        Ok(options)
    }

    /// Flattened `[name, value, name, value, ...]` for array messages.
    pub fn to_args(&self) -> Vec<String> {
        self.to_pairs()
            .into_iter()
            .flat_map(|(name, value)| [name, value])
            .collect()
    }

    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() % 2 != 0 {
            return Err(Error::Protocol(format!(
                "spawn options need name/value pairs, got {} elements",
                args.len()
            )));
        }
        Self::from_pairs(
            args.chunks_exact(2)
                .map(|pair| (pair[0].clone(), pair[1].clone())),
        )
    }
}

/// Whole seconds, with a decimal fraction only when needed; `-1` for unset.
fn format_timeout(timeout: Option<Duration>) -> String {
    match timeout {
        None => "-1".to_string(),
        Some(t) if t.subsec_nanos() == 0 => t.as_secs().to_string(),
        Some(t) => {
            let fraction = format!("{:09}", t.subsec_nanos());
            format!("{}.{}", t.as_secs(), fraction.trim_end_matches('0'))
        }
    }
}

fn parse_timeout(name: &str, value: &str) -> Result<Option<Duration>> {
    let value = value.trim();
    let invalid = || Error::InvalidOption {
        name: name.to_string(),
        reason: format!("'{}' is not a number of seconds", value),
    };
    if value.starts_with('-') {
        return value.parse::<f64>().map(|_| None).map_err(|_| invalid());
    }

    let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));
    let secs: u64 = whole.parse().map_err(|_| invalid())?;
    if fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let nanos: u32 = if fraction.is_empty() {
        0
    } else {
        format!("{:0<9}", fraction).parse().map_err(|_| invalid())?
    };
    Ok(Some(Duration::new(secs, nanos)))
}

/// Empty and `"false"` are false, anything else is true.
fn to_boolean(value: &str) -> bool {
    !(value.is_empty() || value == "false")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SpawnOptions::new("/srv/app");
        assert_eq!(options.app_group_name, "/srv/app");
        assert_eq!(options.app_type, "rack");
        assert_eq!(options.environment, "production");
        assert_eq!(options.spawn_method, SpawnMethod::Smart);
        assert_eq!(options.app_spawner_timeout, None);
        assert!(options.print_exceptions);
        assert!(options.detach);
        assert!(!options.lower_privilege);
        assert_eq!(options.lowest_user, "nobody");
        assert!(options.environment_variables.is_empty());
    }

    #[test]
    fn test_identity_options_roundtrip() {
        let options = SpawnOptions::new("/srv/app")
            .with_lower_privilege(true)
            .with_lowest_user("www-data")
            .with_environment_variable("GREETING", "line one\nline two")
            .with_environment_variable("EMPTY", "");
        let pairs = options.to_pairs();
        let (_, encoded) = pairs
            .iter()
            .find(|(name, _)| name == "environment_variables")
            .unwrap();
        assert!(!encoded.contains('\n'));

        let back = SpawnOptions::from_args(&options.to_args()).unwrap();
        assert_eq!(back, options);
        assert!(back.extra.is_empty());

        let bad = SpawnOptions::from_pairs([
            ("app_root".to_string(), "/srv/app".to_string()),
            ("environment_variables".to_string(), "not json".to_string()),
        ]);
        assert!(matches!(bad, Err(Error::InvalidOption { name, .. }) if name == "environment_variables"));
    }

    #[test]
    fn test_args_roundtrip_keeps_extra() {
        let options = SpawnOptions::new("/srv/app")
            .with_spawn_method(SpawnMethod::SmartLv2)
            .with_environment("staging")
            .with_app_spawner_timeout(Duration::ZERO)
            .with_detach(false)
            .with_extra("worker_threads", "4");
        let back = SpawnOptions::from_args(&options.to_args()).unwrap();
        assert_eq!(back, options);
        assert_eq!(back.app_spawner_timeout, Some(Duration::ZERO));
        assert_eq!(back.extra.get("worker_threads").map(String::as_str), Some("4"));
    }

    #[test]
    fn test_negative_timeout_means_default() {
        let options = SpawnOptions::from_pairs([
            ("app_root".to_string(), "/srv/app".to_string()),
            ("framework_spawner_timeout".to_string(), "-1".to_string()),
            ("app_spawner_timeout".to_string(), "90".to_string()),
        ])
        .unwrap();
        assert_eq!(options.framework_spawner_timeout, None);
        assert_eq!(options.app_spawner_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_sub_second_timeouts_survive_the_wire() {
        let options = SpawnOptions::new("/srv/app")
            .with_app_spawner_timeout(Duration::from_millis(500))
            .with_framework_spawner_timeout(Duration::from_millis(1250));
        let pairs = options.to_pairs();
        let value = |name: &str| {
            pairs
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(value("app_spawner_timeout"), "0.5");
        assert_eq!(value("framework_spawner_timeout"), "1.25");

        let back = SpawnOptions::from_args(&options.to_args()).unwrap();
        assert_eq!(back.app_spawner_timeout, Some(Duration::from_millis(500)));
        assert_eq!(
            back.framework_spawner_timeout,
            Some(Duration::from_millis(1250))
        );
        assert_eq!(format_timeout(Some(Duration::from_secs(90))), "90");
        assert_eq!(parse_timeout("t", "1.").unwrap(), Some(Duration::from_secs(1)));
        assert!(parse_timeout("t", "0.1234567891").is_err());
        assert!(parse_timeout("t", "-x").is_err());
    }

    #[test]
    fn test_boolean_parsing() {
        assert!(!to_boolean("false"));
        assert!(!to_boolean(""));
        assert!(to_boolean("true"));
        assert!(to_boolean("yes"));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            SpawnOptions::from_pairs(Vec::new()),
            Err(Error::InvalidOption { name, .. }) if name == "app_root"
        ));
        assert!(matches!(
            SpawnOptions::from_args(&["app_root".to_string()]),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            "fast".parse::<SpawnMethod>(),
            Err(Error::InvalidOption { .. })
        ));
        assert!(parse_timeout("t", "soon").is_err());
    }

    #[test]
    fn test_canonicalize_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let options = SpawnOptions::new(&link).canonicalize().unwrap();
        assert_eq!(options.app_root(), real.canonicalize().unwrap());
        assert_eq!(
            options.app_group_name,
            real.canonicalize().unwrap().display().to_string()
        );

        let missing = SpawnOptions::new(dir.path().join("nope")).canonicalize();
        assert!(matches!(missing, Err(Error::InvalidAppRoot { .. })));

        let file = dir.path().join("file");
        std::fs::write(&file, b"").unwrap();
        assert!(matches!(
            SpawnOptions::new(&file).canonicalize(),
            Err(Error::InvalidAppRoot { .. })
        ));
    }

    #[test]
    fn test_spawn_method_display_parses_back() {
        for method in [
            SpawnMethod::Smart,
            SpawnMethod::SmartLv2,
            SpawnMethod::Conservative,
        ] {
            assert_eq!(method.to_string().parse::<SpawnMethod>().unwrap(), method);
        }
    }
}
