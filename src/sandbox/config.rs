//! Session configuration.
//!
//! A [`SessionConfig`] is resolved once by the controlling process and handed
//! to every component. Separately spawned proxy processes rebuild the same
//! configuration from the variables produced by [`SessionConfig::export`].

use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use super::SandboxMode;
use crate::error::ConfigError;
use crate::session::{EnvironmentSnapshot, SessionPaths};

/// Session ID, used to derive the shared container bus name.
pub const SESSION_ID_VAR: &str = "WINECELL_SESSION_ID";
/// Identifier of the app the session was started for.
pub const TARGET_ID_VAR: &str = "WINECELL_TARGET_ID";
/// Sandbox mode selector.
pub const RUNTIME_VAR: &str = "WINECELL_RUNTIME";
/// Set inside the Steam Runtime container.
pub const INSIDE_RUNTIME_VAR: &str = "WINECELL_INSIDE_RUNTIME";
/// Set once the session environment has been resolved.
pub const FIRST_START_VAR: &str = "WINECELL_FIRST_START";
/// Log verbosity for proxy processes.
pub const LOG_LEVEL_VAR: &str = "WINECELL_LOG_LEVEL";
/// Root under which the session directory lives.
pub const TEMP_PATH_VAR: &str = "WINECELL_TEMP_PATH";
/// Set to `1` when the keepalive helper runs for this session.
pub const BACKGROUND_HELPER_VAR: &str = "WINECELL_BACKGROUND_HELPER";
/// Set to `1` to reuse one container for every launch of the session.
pub const SHARED_CONTAINER_VAR: &str = "WINECELL_SHARED_CONTAINER";

pub const PROTON_PATH_VAR: &str = "PROTON_PATH";
pub const PROTON_DIST_PATH_VAR: &str = "PROTON_DIST_PATH";
pub const PROTON_LIBRARY_PATH_VAR: &str = "PROTON_LD_LIBRARY_PATH";
pub const STEAM_RUNTIME_PATH_VAR: &str = "STEAM_RUNTIME_PATH";
pub const LEGACY_RUNTIME_PATH_VAR: &str = "LEGACY_STEAM_RUNTIME_PATH";
pub const STEAM_APP_PATH_VAR: &str = "STEAM_APP_PATH";

/// Default log level, silent on success.
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Directory names a Proton installation keeps its Wine build in.
const DIST_DIR_NAMES: &[&str] = &["files", "dist"];

/// Configuration shared by every component of a session.
///
/// # Example
///
/// ```
/// use winecell::sandbox::{SandboxMode, SessionConfig};
///
/// let config = SessionConfig::new()
///     .with_session_id("4b1c")
///     .with_mode(SandboxMode::Legacy)
///     .with_prefix("/games/pfx")
///     .with_background_helper(true);
///
/// assert_eq!(config.mode, SandboxMode::Legacy);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionConfig {
    /// Unique session identifier.
    pub session_id: String,

    /// App identifier, part of the container bus name.
    pub target_id: String,

    /// Requested sandbox mode.
    pub mode: SandboxMode,

    /// Attach every launch to one container started for the session.
    pub shared_container: bool,

    /// Whether this process already runs inside the container.
    pub inside_runtime: bool,

    /// False once a parent process has resolved the session environment.
    pub first_start: bool,

    /// Keep a wineserver alive for the duration of the session.
    pub background_helper: bool,

    /// Wine prefix.
    pub prefix: Option<PathBuf>,

    /// Proton installation directory.
    pub proton_path: Option<PathBuf>,

    /// Proton's Wine build (`<proton>/files` or `<proton>/dist`).
    pub dist_path: Option<PathBuf>,

    /// Steam Linux Runtime installation used in `bwrap` mode.
    pub runtime_path: Option<PathBuf>,

    /// Legacy Steam Runtime (`ubuntu12_32/steam-runtime`).
    pub legacy_runtime_path: Option<PathBuf>,

    /// Installation directory of the app.
    pub app_path: Option<PathBuf>,

    /// `LD_LIBRARY_PATH` entries for Proton's binaries.
    pub library_path: Option<String>,

    /// Root of the session directory.
    pub temp_root: PathBuf,

    /// Root of the proxy binary cache.
    pub cache_root: PathBuf,

    /// Log level exported to child processes.
    pub log_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            target_id: String::from("0"),
            mode: SandboxMode::Isolated,
            shared_container: false,
            inside_runtime: false,
            first_start: true,
            background_helper: false,
            prefix: None,
            proton_path: None,
            dist_path: None,
            runtime_path: None,
            legacy_runtime_path: None,
            app_path: None,
            library_path: None,
            temp_root: std::env::temp_dir(),
            cache_root: PathBuf::from(".cache"),
            log_level: String::from(DEFAULT_LOG_LEVEL),
        }
    }
}

impl SessionConfig {
    /// Creates a configuration with a fresh session ID and default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the configuration from an environment snapshot.
    ///
    /// A missing session ID is generated; every other missing value keeps its
    /// default.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownMode` for an unrecognized `WINECELL_RUNTIME`
    /// and `ConfigError::InvalidSessionId` for IDs that cannot appear in a bus name.
    pub fn from_env(env: &EnvironmentSnapshot) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(id) = env.get_non_empty(SESSION_ID_VAR) {
            config.session_id = validate_id(id)?;
        }
        if let Some(id) = env.get_non_empty(TARGET_ID_VAR) {
            config.target_id = validate_id(id)?;
        }
        if let Some(mode) = env.get_non_empty(RUNTIME_VAR) {
            config.mode = mode.parse()?;
        }

        config.shared_container = env.get(SHARED_CONTAINER_VAR) == Some("1");
        config.background_helper = env.get(BACKGROUND_HELPER_VAR) == Some("1");
        config.inside_runtime = env.get_non_empty(INSIDE_RUNTIME_VAR).is_some();
        config.first_start = !env.contains(FIRST_START_VAR);

        config.prefix = env.get_non_empty(crate::system::PREFIX_VARIABLE).map(PathBuf::from);
        config.proton_path = env.get_non_empty(PROTON_PATH_VAR).map(PathBuf::from);
        config.dist_path = env.get_non_empty(PROTON_DIST_PATH_VAR).map(PathBuf::from);
        config.runtime_path = env.get_non_empty(STEAM_RUNTIME_PATH_VAR).map(PathBuf::from);
        config.legacy_runtime_path = env.get_non_empty(LEGACY_RUNTIME_PATH_VAR).map(PathBuf::from);
        config.app_path = env.get_non_empty(STEAM_APP_PATH_VAR).map(PathBuf::from);
        config.library_path = env.get_non_empty(PROTON_LIBRARY_PATH_VAR).map(str::to_string);

        if let Some(root) = env
            .get_non_empty(TEMP_PATH_VAR)
            .or_else(|| env.get_non_empty("TMPDIR"))
        {
            config.temp_root = PathBuf::from(root);
        }

        config.cache_root = match (env.get_non_empty("XDG_CACHE_HOME"), env.get_non_empty("HOME")) {
            (Some(cache), _) => PathBuf::from(cache),
            (None, Some(home)) => Path::new(home).join(".cache"),
            (None, None) => config.cache_root,
        };

        if let Some(level) = env.get_non_empty(LOG_LEVEL_VAR) {
            config.log_level = level.to_string();
        }

        Ok(config)
    }

    /// Variables handed to child processes so they rebuild this configuration.
    ///
    /// Includes the first-start marker, so children skip environment resolution.
    #[must_use]
    pub fn export(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (SESSION_ID_VAR, self.session_id.clone()),
            (TARGET_ID_VAR, self.target_id.clone()),
            (RUNTIME_VAR, self.mode.to_string()),
            (FIRST_START_VAR, String::from("1")),
            (LOG_LEVEL_VAR, self.log_level.clone()),
            (TEMP_PATH_VAR, self.temp_root.display().to_string()),
        ];

        if self.background_helper {
            vars.push((BACKGROUND_HELPER_VAR, String::from("1")));
        }
        if self.shared_container {
            vars.push((SHARED_CONTAINER_VAR, String::from("1")));
        }

        let paths = [
            (crate::system::PREFIX_VARIABLE, &self.prefix),
            (PROTON_PATH_VAR, &self.proton_path),
            (PROTON_DIST_PATH_VAR, &self.dist_path),
            (STEAM_RUNTIME_PATH_VAR, &self.runtime_path),
            (LEGACY_RUNTIME_PATH_VAR, &self.legacy_runtime_path),
            (STEAM_APP_PATH_VAR, &self.app_path),
        ];
        for (name, value) in paths {
            if let Some(path) = value {
                vars.push((name, path.display().to_string()));
            }
        }
        if let Some(library_path) = &self.library_path {
            vars.push((PROTON_LIBRARY_PATH_VAR, library_path.clone()));
        }

        vars
    }

    /// Paths of the session directory and its marker files.
    #[must_use]
    pub fn session_paths(&self) -> SessionPaths {
        SessionPaths::new(&self.temp_root, &self.session_id)
    }

    /// Directory holding the proxy binaries for the configured Proton build.
    #[must_use]
    pub fn proxy_dir(&self) -> Option<PathBuf> {
        let name = self.proton_path.as_ref()?.file_name()?;
        Some(
            self.cache_root
                .join("winecell")
                .join("proton")
                .join(name)
                .join("bin"),
        )
    }

    /// Returns the Wine build directory, looking inside the Proton installation
    /// when it was not given explicitly.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingVariable` if neither path is known and
    /// `ConfigError::DistMissing` if the installation has no Wine build.
    pub fn resolve_dist_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dist) = &self.dist_path {
            return Ok(dist.clone());
        }
        let proton = self
            .proton_path
            .as_ref()
            .ok_or(ConfigError::MissingVariable {
                name: PROTON_PATH_VAR,
            })?;

        DIST_DIR_NAMES
            .iter()
            .map(|name| proton.join(name))
            .find(|dist| dist.join("bin").join("wine").exists())
            .ok_or_else(|| ConfigError::DistMissing {
                path: proton.clone(),
            })
    }

    /// Sets the session identifier.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Sets the app identifier.
    #[must_use]
    pub fn with_target_id(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = target_id.into();
        self
    }

    /// Sets the sandbox mode.
    #[must_use]
    pub fn with_mode(mut self, mode: SandboxMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enables or disables the shared per-session container.
    #[must_use]
    pub fn with_shared_container(mut self, enabled: bool) -> Self {
        self.shared_container = enabled;
        self
    }

    /// Enables or disables the keepalive helper.
    #[must_use]
    pub fn with_background_helper(mut self, enabled: bool) -> Self {
        self.background_helper = enabled;
        self
    }

    /// Sets the Wine prefix.
    #[must_use]
    pub fn with_prefix(mut self, path: impl Into<PathBuf>) -> Self {
        self.prefix = Some(path.into());
        self
    }

    /// Sets the Proton installation directory.
    #[must_use]
    pub fn with_proton_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.proton_path = Some(path.into());
        self
    }

    /// Sets the Wine build directory.
    #[must_use]
    pub fn with_dist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dist_path = Some(path.into());
        self
    }

    /// Sets the Steam Linux Runtime installation.
    #[must_use]
    pub fn with_runtime_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime_path = Some(path.into());
        self
    }

    /// Sets the legacy Steam Runtime.
    #[must_use]
    pub fn with_legacy_runtime_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.legacy_runtime_path = Some(path.into());
        self
    }

    /// Sets the app installation directory.
    #[must_use]
    pub fn with_app_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.app_path = Some(path.into());
        self
    }

    /// Sets the root of the session directory.
    #[must_use]
    pub fn with_temp_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_root = path.into();
        self
    }

    /// Sets the root of the proxy binary cache.
    #[must_use]
    pub fn with_cache_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_root = path.into();
        self
    }

    /// Sets the log level exported to children.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }
}

fn validate_id(id: &str) -> Result<String, ConfigError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(id.to_string())
    } else {
        Err(ConfigError::InvalidSessionId { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert!(Uuid::parse_str(&config.session_id).is_ok());
        assert_eq!(config.mode, SandboxMode::Isolated);
        assert!(config.first_start);
        assert!(!config.inside_runtime);
        assert!(!config.shared_container);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_from_env_reads_markers() {
        let env = EnvironmentSnapshot::from_pairs([
            (SESSION_ID_VAR, "abc-123"),
            (RUNTIME_VAR, "legacy"),
            (INSIDE_RUNTIME_VAR, "1"),
            (FIRST_START_VAR, "1"),
            (SHARED_CONTAINER_VAR, "1"),
            ("WINEPREFIX", "/pfx"),
            ("XDG_CACHE_HOME", "/cache"),
        ]);
        let config = SessionConfig::from_env(&env).expect("config should parse");

        assert_eq!(config.session_id, "abc-123");
        assert_eq!(config.mode, SandboxMode::Legacy);
        assert!(config.inside_runtime);
        assert!(!config.first_start);
        assert!(config.shared_container);
        assert_eq!(config.prefix, Some(PathBuf::from("/pfx")));
        assert_eq!(config.cache_root, PathBuf::from("/cache"));
    }

    #[test]
    fn test_from_env_rejects_unknown_mode() {
        let env = EnvironmentSnapshot::from_pairs([(RUNTIME_VAR, "chroot")]);
        assert!(matches!(
            SessionConfig::from_env(&env),
            Err(ConfigError::UnknownMode { .. })
        ));
    }

    #[test]
    fn test_from_env_rejects_bad_session_id() {
        let env = EnvironmentSnapshot::from_pairs([(SESSION_ID_VAR, "a.b/c")]);
        assert!(matches!(
            SessionConfig::from_env(&env),
            Err(ConfigError::InvalidSessionId { .. })
        ));
    }

    #[test]
    fn test_export_round_trips_through_from_env() {
        let config = SessionConfig::new()
            .with_session_id("s1")
            .with_target_id("620")
            .with_mode(SandboxMode::Disabled)
            .with_prefix("/pfx")
            .with_background_helper(true)
            .with_temp_root("/var/tmp");

        let env = EnvironmentSnapshot::from_pairs(config.export());
        let child = SessionConfig::from_env(&env).expect("config should parse");

        assert_eq!(child.session_id, "s1");
        assert_eq!(child.target_id, "620");
        assert_eq!(child.mode, SandboxMode::Disabled);
        assert_eq!(child.prefix, config.prefix);
        assert!(child.background_helper);
        assert!(!child.first_start);
        assert_eq!(child.temp_root, PathBuf::from("/var/tmp"));
    }

    #[test]
    fn test_proxy_dir_uses_proton_name() {
        let config = SessionConfig::new()
            .with_proton_path("/steam/common/Proton 9.0")
            .with_cache_root("/home/u/.cache");
        assert_eq!(
            config.proxy_dir(),
            Some(PathBuf::from("/home/u/.cache/winecell/proton/Proton 9.0/bin"))
        );
        assert_eq!(SessionConfig::new().proxy_dir(), None);
    }

    #[test]
    fn test_resolve_dist_path() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let proton = dir.path().join("Proton");
        std::fs::create_dir_all(proton.join("files/bin")).expect("failed to create dist");
        std::fs::write(proton.join("files/bin/wine"), b"").expect("failed to create wine");

        let config = SessionConfig::new().with_proton_path(&proton);
        assert_eq!(
            config.resolve_dist_path().expect("dist should resolve"),
            proton.join("files")
        );

        let empty = SessionConfig::new().with_proton_path(dir.path());
        assert!(matches!(
            empty.resolve_dist_path(),
            Err(ConfigError::DistMissing { .. })
        ));
        assert!(matches!(
            SessionConfig::new().resolve_dist_path(),
            Err(ConfigError::MissingVariable { .. })
        ));
    }
}
