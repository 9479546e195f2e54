//! Session lifecycle.
//!
//! The [`SessionOrchestrator`] handles every launch request. A top-level
//! `winecell run` resolves the session environment once, creates the session
//! directory, starts the keepalive helper and the shared container when
//! configured, and runs the user's command. Proxy invocations (`wine`,
//! `wineserver`, ...) started by that command inherit the exported session
//! configuration and only plan and execute their own launch.
//!
//! # Teardown
//!
//! A [`Session`] tears itself down when dropped: the keepalive helper is
//! stopped, the shared container terminated and the session directory
//! removed. Teardown signals are forwarded to the running command, so the
//! drop also runs when the session ends through SIGINT, SIGTERM etc.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, trace, warn};

use super::keepalive::{KeepaliveConfig, KeepaliveManager};
use super::storage::{SessionPaths, touch_marker};
use super::{EnvironmentPropagator, EnvironmentSnapshot};
use crate::error::{ConfigError, LaunchError, Result};
use crate::sandbox::{
    DEFAULT_GRACE_PERIOD, LaunchRequest, MountPoint, MountSetResolver, PROTON_DIST_PATH_VAR,
    PROTON_PATH_VAR, ProxyBinDir, REMOVABLE_MEDIA_ROOT, SandboxLauncher, SandboxMode,
    SessionConfig, compose_library_path, exit_code_of, supervise_child,
};
use crate::system::{
    HelperProcessHandle, HelperProcessLocator, HostRequirements, PREFIX_VARIABLE,
    PeerEnvironmentReader, ProcfsReader, ShutdownSignals, is_blocking_wait,
};

/// A running session.
///
/// Created by [`SessionOrchestrator::start_session`].
pub struct Session {
    config: SessionConfig,
    environment: EnvironmentSnapshot,
    paths: SessionPaths,
    keepalive: Option<KeepaliveManager>,
    container: Option<Child>,
    torn_down: bool,
}

impl Session {
    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.session_id
    }

    /// Resolved configuration, with the effective sandbox mode.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Environment for commands run in this session.
    #[must_use]
    pub fn environment(&self) -> &EnvironmentSnapshot {
        &self.environment
    }

    /// Session directory paths.
    #[must_use]
    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// The keepalive helper, if enabled.
    #[must_use]
    pub fn keepalive(&self) -> Option<&KeepaliveManager> {
        self.keepalive.as_ref()
    }

    /// Returns true if a shared container was started for this session.
    #[must_use]
    pub fn has_container(&self) -> bool {
        self.container.is_some()
    }

    /// Stops the helper and the container and removes the session directory.
    ///
    /// Idempotent; also run on drop.
    #[instrument(skip(self), fields(session_id = %self.config.session_id))]
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(mut keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        if let Some(mut container) = self.container.take() {
            debug!(pid = container.id(), "Stopping shared container");
            let _ = container.kill();
            let _ = container.wait();
        }
        self.paths.cleanup();
        debug!("Session torn down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.config.session_id)
            .field("root", &self.paths.root)
            .field("keepalive", &self.keepalive)
            .field("has_container", &self.container.is_some())
            .finish()
    }
}

/// Composes the components for each launch request.
///
/// # Example
///
/// ```no_run
/// use winecell::session::{EnvironmentSnapshot, SessionOrchestrator};
/// use winecell::sandbox::SessionConfig;
///
/// let env = EnvironmentSnapshot::capture();
/// let config = SessionConfig::from_env(&env).unwrap();
/// let orchestrator = SessionOrchestrator::new(config);
///
/// let code = orchestrator.run(&env, "winetricks".as_ref(), &["corefonts".into()], None).unwrap();
/// std::process::exit(code);
/// ```
pub struct SessionOrchestrator {
    config: SessionConfig,
    reader: Arc<dyn PeerEnvironmentReader>,
    host: HostRequirements,
    resolver: MountSetResolver,
    executable: Option<PathBuf>,
    grace_period: Duration,
}

impl SessionOrchestrator {
    /// Creates an orchestrator reading peers from `/proc`.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            reader: Arc::new(ProcfsReader::new()),
            host: HostRequirements {
                flatpak_version: None,
                bwrap_supported: true,
            },
            resolver: MountSetResolver::new(),
            executable: None,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Uses `reader` to inspect peer processes.
    #[must_use]
    pub fn with_reader(mut self, reader: Arc<dyn PeerEnvironmentReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Uses the results of the host checks.
    #[must_use]
    pub fn with_host_requirements(mut self, host: HostRequirements) -> Self {
        self.host = host;
        self
    }

    /// Uses `resolver` to compute container mounts.
    #[must_use]
    pub fn with_mount_resolver(mut self, resolver: MountSetResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Copies `path` into the proxy directory instead of the running executable.
    #[must_use]
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Sets how long a command gets to exit after a forwarded signal.
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// The configuration as given.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Mode actually used after host checks.
    #[must_use]
    pub fn effective_mode(&self) -> SandboxMode {
        self.host.effective_mode(self.config.mode)
    }

    /// Finds a wineserver of another session running for the prefix.
    #[must_use]
    pub fn locate_helper(&self) -> Option<HelperProcessHandle> {
        let prefix = self.config.prefix.as_deref()?;
        HelperProcessLocator::new(self.reader.as_ref()).locate(prefix)
    }

    /// Paths the container must see besides the root entries.
    #[must_use]
    pub fn required_mounts(&self) -> Vec<PathBuf> {
        let mut required: Vec<PathBuf> = [
            self.config.proton_path.clone(),
            self.config.prefix.clone(),
            self.config.app_path.clone(),
            self.config.proxy_dir(),
        ]
        .into_iter()
        .flatten()
        .collect();
        required.push(self.config.session_paths().root);
        required.push(PathBuf::from(REMOVABLE_MEDIA_ROOT));
        required
    }

    /// Resolves the container mount set.
    ///
    /// # Errors
    ///
    /// Returns `MountError` if the root cannot be enumerated.
    pub fn resolve_mounts(&self) -> Result<Vec<MountPoint>> {
        Ok(self.resolver.resolve(&self.required_mounts())?)
    }

    /// Computes the environment for commands of a new session.
    ///
    /// Returns `user` unchanged when a parent process already did this.
    /// Otherwise propagates synchronization settings, points Wine at the
    /// Proton build and the proxy binaries, and exports the session
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the prefix is unset or missing, or the Proton
    /// build cannot be found.
    #[instrument(skip(self, user), fields(session_id = %self.config.session_id))]
    pub fn prepare_environment(&self, user: &EnvironmentSnapshot) -> Result<EnvironmentSnapshot> {
        if !self.config.first_start {
            trace!("Environment already prepared by parent process");
            return Ok(user.clone());
        }
        Ok(self.compose_environment(user, &self.resolved_config()?)?)
    }

    /// Starts a session: environment, session directory, keepalive helper and
    /// shared container.
    ///
    /// Everything started before a failure is torn down again.
    ///
    /// # Errors
    ///
    /// Returns the configuration, proxy directory, keepalive or container
    /// errors.
    #[instrument(skip(self, user), fields(session_id = %self.config.session_id))]
    pub fn start_session(&self, user: &EnvironmentSnapshot) -> Result<Session> {
        let config = self.resolved_config()?;
        let proxy = self.prepare_proxy_dir(&config)?;
        let environment = self.compose_environment(user, &config)?;
        let paths = config.session_paths();
        paths.create_directories()?;

        let mut session = Session {
            config,
            environment,
            paths,
            keepalive: None,
            container: None,
            torn_down: false,
        };
        let launcher = SandboxLauncher::new(&session.config, session.config.mode);

        if session.config.shared_container
            && session.config.mode == SandboxMode::Isolated
            && !session.config.inside_runtime
        {
            let launcher = launcher.clone().with_mounts(self.resolve_mounts()?);
            let container = launcher.start_shared_container(&session.environment)?;
            session.container = Some(container);
        }

        if session.config.background_helper {
            match &proxy {
                Some(proxy) => {
                    let mut keepalive = KeepaliveConfig::for_proxy_dir(proxy)
                        .with_environment(session.environment.clone());
                    if let Some(prefix) = &session.config.prefix {
                        keepalive = keepalive.with_prefix(prefix);
                    }
                    let manager = KeepaliveManager::start(
                        session.paths.clone(),
                        keepalive,
                        Arc::clone(&self.reader),
                    )?;
                    session.keepalive = Some(manager);
                }
                None => warn!("No Proton build configured, background wineserver disabled"),
            }
        }

        info!(mode = %session.config.mode, bus_name = launcher.bus_name(), "Session started");
        Ok(session)
    }

    /// Runs `program` inside a new session and returns its exit code.
    ///
    /// The session is torn down before returning.
    ///
    /// # Errors
    ///
    /// Returns session setup errors and `LaunchError` if the program cannot
    /// be started.
    #[instrument(skip(self, user, args, signals), fields(program = %program.display()))]
    pub fn run(
        &self,
        user: &EnvironmentSnapshot,
        program: &Path,
        args: &[OsString],
        signals: Option<&ShutdownSignals>,
    ) -> Result<i32> {
        let mut session = self.start_session(user)?;

        let child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(session.environment().as_os_pairs())
            .spawn()
            .map_err(|source| LaunchError::SpawnFailed {
                program: program.to_path_buf(),
                source,
            })?;

        let status = supervise_child(child, signals, self.grace_period).map_err(|source| {
            LaunchError::WaitFailed {
                program: program.to_path_buf(),
                source,
            }
        })?;

        session.teardown();
        let code = exit_code_of(status);
        debug!(code, "Command finished");
        Ok(code)
    }

    /// Handles a proxy invocation of a Proton binary.
    ///
    /// A `wineserver -w` outside the container first asks the session's
    /// keepalive helper to step aside.
    ///
    /// # Errors
    ///
    /// Returns `LaunchError` if the launch cannot be planned or started.
    #[instrument(skip(self, args, environment, signals), fields(binary = %binary))]
    pub fn proxy(
        &self,
        binary: &str,
        args: &[OsString],
        environment: &EnvironmentSnapshot,
        signals: Option<&ShutdownSignals>,
    ) -> Result<i32> {
        if self.config.background_helper
            && !self.config.inside_runtime
            && is_blocking_wait(binary, args)
        {
            let paths = self.config.session_paths();
            if paths.keepalive_exists() {
                debug!("Blocking wineserver wait, pausing keepalive");
                touch_marker(&paths.restart)?;
            }
        }

        let mut launcher = SandboxLauncher::new(&self.config, self.effective_mode())
            .with_grace_period(self.grace_period);
        if launcher.needs_mounts() {
            launcher = launcher.with_mounts(self.resolve_mounts()?);
        }

        let mut request = LaunchRequest::new(binary)
            .with_args(args.iter().cloned())
            .with_environment(environment.clone());
        if let Ok(dir) = std::env::current_dir() {
            request = request.with_working_dir(dir);
        }

        let plan = launcher.plan(&request)?;
        Ok(launcher.execute(&plan, signals)?)
    }

    /// Configuration with the effective mode, the Proton build and its
    /// library path resolved.
    fn resolved_config(&self) -> Result<SessionConfig> {
        let mut config = self.config.clone();
        config.mode = self.effective_mode();

        let prefix = config.prefix.as_ref().ok_or(ConfigError::MissingVariable {
            name: PREFIX_VARIABLE,
        })?;
        if !prefix.is_dir() {
            return Err(ConfigError::PrefixMissing {
                path: prefix.clone(),
            }
            .into());
        }

        if config.proton_path.is_some() || config.dist_path.is_some() {
            let dist = config.resolve_dist_path()?;
            if config.library_path.is_none() {
                config.library_path =
                    compose_library_path(config.mode, &dist, config.legacy_runtime_path.as_deref())?;
            }
            config.dist_path = Some(dist);
        }
        Ok(config)
    }

    fn prepare_proxy_dir(&self, config: &SessionConfig) -> Result<Option<ProxyBinDir>> {
        let (Some(dir), Some(dist)) = (config.proxy_dir(), config.dist_path.as_ref()) else {
            return Ok(None);
        };
        let executable = match &self.executable {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        let proxy = ProxyBinDir::new(dir);
        proxy.prepare(dist, &executable)?;
        Ok(Some(proxy))
    }

    fn compose_environment(
        &self,
        user: &EnvironmentSnapshot,
        config: &SessionConfig,
    ) -> std::result::Result<EnvironmentSnapshot, ConfigError> {
        let peer = self.locate_helper();
        let mut env = EnvironmentPropagator::new()
            .apply(user, peer.as_ref())
            .without_var("WINEARCH");

        if let Some(dist) = &config.dist_path {
            let bin = dist.join("bin");
            let proxy = config.proxy_dir();
            let entry = |name: &str| match &proxy {
                Some(dir) => dir.join(name),
                None => bin.join(name),
            };

            if !user.contains("WINE") {
                env = env.with_var("WINE", entry("wine").display().to_string());
            }
            if !user.contains("WINESERVER") {
                env = env.with_var("WINESERVER", entry("wineserver").display().to_string());
            }
            let loader = env.get("WINE").map(str::to_string);
            if let Some(loader) = loader {
                env = env.with_var("WINELOADER", loader);
            }

            env = env.with_var(
                "WINEDLLPATH",
                format!(
                    "{}:{}",
                    dist.join("lib64/wine").display(),
                    dist.join("lib/wine").display()
                ),
            );

            let mut path = Vec::new();
            if let Some(dir) = &proxy {
                path.push(dir.display().to_string());
            }
            path.push(bin.display().to_string());
            if let Some(existing) = user.get_non_empty("PATH") {
                path.push(existing.to_string());
            }
            env = env.with_var("PATH", path.join(":"));
            env = env.with_var(PROTON_DIST_PATH_VAR, dist.display().to_string());
        }
        if let Some(proton) = &config.proton_path {
            env = env.with_var(PROTON_PATH_VAR, proton.display().to_string());
        }

        Ok(env.with_vars(config.export()))
    }
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("config", &self.config)
            .field("host", &self.host)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeReader {
        environments: HashMap<u32, EnvironmentSnapshot>,
    }

    impl PeerEnvironmentReader for FakeReader {
        fn pids_named(&self, _name: &str) -> Vec<u32> {
            let mut pids: Vec<u32> = self.environments.keys().copied().collect();
            pids.sort_unstable();
            pids
        }

        fn environment(&self, pid: u32) -> Option<EnvironmentSnapshot> {
            self.environments.get(&pid).cloned()
        }

        fn command_line(&self, _pid: u32) -> Option<Vec<String>> {
            Some(vec!["wineserver".to_string()])
        }
    }

    fn prefix(temp: &TempDir) -> PathBuf {
        let prefix = temp.path().join("pfx");
        fs::create_dir_all(&prefix).expect("failed to create prefix");
        prefix
    }

    #[test]
    fn test_missing_prefix_is_config_error() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let config = SessionConfig::new().with_prefix(temp.path().join("absent"));
        let result =
            SessionOrchestrator::new(config).prepare_environment(&EnvironmentSnapshot::default());
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::PrefixMissing { .. }))
        ));
    }

    #[test]
    fn test_defaults_applied_without_peer() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let config = SessionConfig::new().with_prefix(prefix(&temp));
        let orchestrator =
            SessionOrchestrator::new(config).with_reader(Arc::new(FakeReader::default()));

        let env = orchestrator
            .prepare_environment(&EnvironmentSnapshot::from_pairs([("WINEARCH", "win32")]))
            .expect("prepare failed");
        assert_eq!(env.get("WINEFSYNC"), Some("1"));
        assert_eq!(env.get("WINEESYNC"), Some("1"));
        assert_eq!(env.get("WINEARCH"), None);
        assert_eq!(env.get("WINECELL_FIRST_START"), Some("1"));
    }

    #[test]
    fn test_peer_settings_inherited() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let prefix = prefix(&temp);
        let mut reader = FakeReader::default();
        reader.environments.insert(
            77,
            EnvironmentSnapshot::from_pairs([
                ("WINEPREFIX", prefix.display().to_string()),
                ("WINEFSYNC", "0".to_string()),
            ]),
        );

        let orchestrator = SessionOrchestrator::new(SessionConfig::new().with_prefix(&prefix))
            .with_reader(Arc::new(reader));
        let env = orchestrator
            .prepare_environment(&EnvironmentSnapshot::default())
            .expect("prepare failed");
        assert_eq!(env.get("WINEFSYNC"), Some("0"));
        assert_eq!(env.get("WINEESYNC"), None);
    }

    #[test]
    fn test_wine_variables_point_at_proxies() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let proton = temp.path().join("Proton 9.0");
        fs::create_dir_all(proton.join("files/bin")).expect("failed to create dist");
        fs::write(proton.join("files/bin/wine"), b"").expect("failed to create wine");

        let config = SessionConfig::new()
            .with_prefix(prefix(&temp))
            .with_proton_path(&proton)
            .with_mode(SandboxMode::Disabled)
            .with_cache_root(temp.path().join("cache"));
        let orchestrator =
            SessionOrchestrator::new(config).with_reader(Arc::new(FakeReader::default()));

        let user = EnvironmentSnapshot::from_pairs([("PATH", "/usr/bin"), ("WINESERVER", "/my/ws")]);
        let env = orchestrator.prepare_environment(&user).expect("prepare failed");

        let proxy_dir = temp.path().join("cache/winecell/proton/Proton 9.0/bin");
        let wine = proxy_dir.join("wine").display().to_string();
        assert_eq!(env.get("WINE"), Some(wine.as_str()));
        assert_eq!(env.get("WINELOADER"), Some(wine.as_str()));
        assert_eq!(env.get("WINESERVER"), Some("/my/ws"));
        let path = env.get("PATH").expect("PATH missing");
        assert!(path.starts_with(&proxy_dir.display().to_string()));
        assert!(path.ends_with("/usr/bin"));
    }

    #[test]
    fn test_nested_process_keeps_environment() {
        let mut config = SessionConfig::new();
        config.first_start = false;
        let user = EnvironmentSnapshot::from_pairs([("WINEFSYNC", "0")]);
        let env = SessionOrchestrator::new(config)
            .prepare_environment(&user)
            .expect("prepare failed");
        assert_eq!(env, user);
    }

    #[test]
    fn test_old_flatpak_downgrades_mode() {
        let orchestrator = SessionOrchestrator::new(SessionConfig::new()).with_host_requirements(
            HostRequirements {
                flatpak_version: Some((1, 10, 0)),
                bwrap_supported: false,
            },
        );
        assert_eq!(orchestrator.effective_mode(), SandboxMode::Legacy);
    }
}
