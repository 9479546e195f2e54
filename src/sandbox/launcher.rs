//! Launching Wine binaries through the Steam Runtime container.
//!
//! A launch is planned first and executed second, so the decision can be
//! inspected without starting anything.
//!
//! # Plans
//!
//! - [`LaunchPlan::Direct`]: run the Wine binary from the Proton build with
//!   `LD_LIBRARY_PATH` adjusted for the mode. Used in `legacy` and `off` mode,
//!   and in `bwrap` mode once running inside the container.
//! - [`LaunchPlan::Bootstrap`]: start a fresh container through the runtime
//!   entry point with one `--filesystem` declaration per mount and re-run the
//!   proxy binary inside it.
//! - [`LaunchPlan::Attach`]: run the proxy binary inside the container
//!   started for the session, addressed by its bus name.
//!
//! Reusing a container is never inferred: `Attach` is only planned when the
//! session was configured with a shared container.
//!
//! # Child supervision
//!
//! Children are waited on with a short poll so teardown signals received by
//! this process can be forwarded. A child that ignores the forwarded signal is
//! killed after a grace period.

use std::ffi::OsString;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self as nix_signal, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, info, instrument, trace, warn};

use super::SessionConfig;
use super::config::INSIDE_RUNTIME_VAR;
use super::mounts::{MountPoint, filesystem_args};
use crate::error::{ConfigError, LaunchError};
use crate::session::EnvironmentSnapshot;
use crate::system::ShutdownSignals;

/// Entry points of the Steam Linux Runtime, in lookup order.
pub const ENTRY_POINT_NAMES: &[&str] = &["run", "_v2-entry-point"];

/// Clients able to run a command in an existing container, in lookup order.
pub const LAUNCH_CLIENT_NAMES: &[&str] = &[
    "pressure-vessel/bin/steam-runtime-launch-client",
    "pressure-vessel/bin/pressure-vessel-launch",
];

/// Prefix of the bus name a shared container listens on.
pub const BUS_NAME_PREFIX: &str = "com.github.winecell";

/// How long a child may take to exit after a forwarded signal.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Interval between readiness checks of a shared container.
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interval between child status checks.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Sandbox mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SandboxMode {
    /// Run every Wine binary inside the Steam Linux Runtime container (`bwrap`).
    #[serde(rename = "bwrap")]
    Isolated,
    /// Run on the host with the legacy Steam Runtime libraries (`legacy`).
    #[serde(rename = "legacy")]
    Legacy,
    /// Run on the host without any runtime (`off`).
    #[serde(rename = "off")]
    Disabled,
}

impl FromStr for SandboxMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bwrap" | "isolated" | "isolated-per-launch" => Ok(Self::Isolated),
            "legacy" | "legacy-no-isolation" => Ok(Self::Legacy),
            "off" | "disabled" => Ok(Self::Disabled),
            _ => Err(ConfigError::UnknownMode {
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Isolated => "bwrap",
            Self::Legacy => "legacy",
            Self::Disabled => "off",
        })
    }
}

/// Bus name of the shared container for a session.
///
/// Bus name elements may only contain `[A-Za-z0-9_]`, so dashes in the
/// session ID are replaced.
#[must_use]
pub fn bus_name(target_id: &str, session_id: &str) -> String {
    format!(
        "{BUS_NAME_PREFIX}.App{target_id}_{}",
        session_id.replace('-', "_")
    )
}

/// A Wine binary invocation requested through a proxy.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Name of the binary in the Proton build, e.g. `wine` or `wineserver`.
    pub binary: String,
    /// Arguments passed through unchanged.
    pub args: Vec<OsString>,
    /// Environment of the child.
    pub environment: EnvironmentSnapshot,
    /// Working directory of the child.
    pub working_dir: Option<PathBuf>,
}

impl LaunchRequest {
    /// Creates a request for `binary` with no arguments.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the child environment.
    #[must_use]
    pub fn with_environment(mut self, environment: EnvironmentSnapshot) -> Self {
        self.environment = environment;
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(path.into());
        self
    }
}

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommand {
    /// Executable to spawn.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<OsString>,
    /// Complete child environment.
    pub environment: EnvironmentSnapshot,
    /// Working directory, inherited if unset.
    pub working_dir: Option<PathBuf>,
}

impl PlannedCommand {
    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env_clear()
            .envs(self.environment.as_os_pairs());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// How a launch request will be carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchPlan {
    /// Run the binary in the current environment.
    Direct(PlannedCommand),
    /// Start a new container and run the proxy inside it.
    Bootstrap(PlannedCommand),
    /// Run the proxy inside the session's shared container.
    Attach(PlannedCommand),
}

impl LaunchPlan {
    /// The command this plan spawns.
    #[must_use]
    pub fn command(&self) -> &PlannedCommand {
        match self {
            Self::Direct(cmd) | Self::Bootstrap(cmd) | Self::Attach(cmd) => cmd,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Bootstrap(_) => "bootstrap",
            Self::Attach(_) => "attach",
        }
    }
}

/// Plans and runs Wine binaries according to the session's sandbox mode.
#[derive(Debug, Clone)]
pub struct SandboxLauncher {
    mode: SandboxMode,
    inside_runtime: bool,
    shared_container: bool,
    runtime_path: Option<PathBuf>,
    dist_path: Option<PathBuf>,
    proxy_dir: Option<PathBuf>,
    library_path: Option<String>,
    bus_name: String,
    mounts: Vec<MountPoint>,
    grace_period: Duration,
    readiness_timeout: Duration,
}

impl SandboxLauncher {
    /// Creates a launcher for the given session.
    ///
    /// `mode` is the effective mode after host checks, which may differ from
    /// the one in `config`.
    #[must_use]
    pub fn new(config: &SessionConfig, mode: SandboxMode) -> Self {
        Self {
            mode,
            inside_runtime: config.inside_runtime,
            shared_container: config.shared_container,
            runtime_path: config.runtime_path.clone(),
            dist_path: config.dist_path.clone(),
            proxy_dir: config.proxy_dir(),
            library_path: config.library_path.clone(),
            bus_name: bus_name(&config.target_id, &config.session_id),
            mounts: Vec::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            readiness_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the mounts declared when bootstrapping a container.
    #[must_use]
    pub fn with_mounts(mut self, mounts: Vec<MountPoint>) -> Self {
        self.mounts = mounts;
        self
    }

    /// Overrides the directory of the Proton build.
    #[must_use]
    pub fn with_dist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dist_path = Some(path.into());
        self
    }

    /// Overrides the proxy binary directory.
    #[must_use]
    pub fn with_proxy_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.proxy_dir = Some(path.into());
        self
    }

    /// Sets how long children get to exit after a forwarded signal.
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Sets how long to wait for a shared container to answer.
    #[must_use]
    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    /// The effective sandbox mode.
    #[must_use]
    pub fn mode(&self) -> SandboxMode {
        self.mode
    }

    /// Bus name of the session's shared container.
    #[must_use]
    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    /// Returns true if planning a launch will bootstrap a new container,
    /// i.e. a mount set is needed.
    #[must_use]
    pub fn needs_mounts(&self) -> bool {
        self.mode == SandboxMode::Isolated && !self.inside_runtime && !self.shared_container
    }

    /// Decides how `request` is carried out.
    ///
    /// # Errors
    ///
    /// Returns `LaunchError::EntryPointNotFound` if a container is required
    /// but no runtime entry point exists, and `LaunchError::RuntimePathUnset`
    /// if no runtime is configured at all. Never falls back to running
    /// outside the container.
    #[instrument(skip(self, request), fields(binary = %request.binary, mode = %self.mode))]
    pub fn plan(&self, request: &LaunchRequest) -> Result<LaunchPlan, LaunchError> {
        let plan = match self.mode {
            SandboxMode::Disabled => LaunchPlan::Direct(self.direct_command(request, None)),
            // The legacy runtime's library list replaces the inherited value
            SandboxMode::Legacy => {
                LaunchPlan::Direct(self.direct_command(request, self.library_path.clone()))
            }
            SandboxMode::Isolated if self.inside_runtime => {
                let value = prepend_library_path(
                    self.library_path.as_deref(),
                    request.environment.get("LD_LIBRARY_PATH"),
                );
                LaunchPlan::Direct(self.direct_command(request, value))
            }
            SandboxMode::Isolated if self.shared_container => {
                let client = self.launch_client()?;
                let mut args = vec![
                    OsString::from(format!("--bus-name={}", self.bus_name)),
                    OsString::from("--pass-env-matching=*"),
                    OsString::from(format!("--env={INSIDE_RUNTIME_VAR}=1")),
                ];
                if let Some(dir) = &request.working_dir {
                    let mut arg = OsString::from("--directory=");
                    arg.push(dir);
                    args.push(arg);
                }
                args.push(OsString::from("--"));
                args.push(self.proxy_binary(&request.binary).into_os_string());
                args.extend(request.args.iter().cloned());

                LaunchPlan::Attach(PlannedCommand {
                    program: client,
                    args,
                    environment: request.environment.clone(),
                    working_dir: request.working_dir.clone(),
                })
            }
            SandboxMode::Isolated => {
                let entry_point = self.entry_point()?;
                let mut args = filesystem_args(&self.mounts);
                args.push(OsString::from("--"));
                args.push(self.proxy_binary(&request.binary).into_os_string());
                args.extend(request.args.iter().cloned());

                LaunchPlan::Bootstrap(PlannedCommand {
                    program: entry_point,
                    args,
                    environment: request.environment.with_var(INSIDE_RUNTIME_VAR, "1"),
                    working_dir: request.working_dir.clone(),
                })
            }
        };

        debug!(plan = plan.kind(), program = %plan.command().program.display(), "Planned launch");
        Ok(plan)
    }

    /// Runs a plan and returns the exit code to propagate.
    ///
    /// # Errors
    ///
    /// Returns `LaunchError::SpawnFailed`/`WaitFailed` if the child cannot be
    /// started or waited for.
    #[instrument(skip_all, fields(plan = plan.kind()))]
    pub fn execute(
        &self,
        plan: &LaunchPlan,
        signals: Option<&ShutdownSignals>,
    ) -> Result<i32, LaunchError> {
        let command = plan.command();
        trace!(args = ?command.args, "Spawning child");
        let child = command
            .to_command()
            .spawn()
            .map_err(|source| LaunchError::SpawnFailed {
                program: command.program.clone(),
                source,
            })?;

        let status = supervise_child(child, signals, self.grace_period).map_err(|source| {
            LaunchError::WaitFailed {
                program: command.program.clone(),
                source,
            }
        })?;

        let code = exit_code_of(status);
        debug!(code, "Child exited");
        Ok(code)
    }

    /// Starts the session's shared container and waits until it accepts
    /// commands.
    ///
    /// The returned child is the container launcher; killing it stops the
    /// container.
    ///
    /// # Errors
    ///
    /// Returns `LaunchError::ContainerNotReady` if it does not answer within
    /// the readiness timeout, or the lookup/spawn errors of [`Self::plan`].
    #[instrument(skip(self, environment), fields(bus_name = %self.bus_name))]
    pub fn start_shared_container(
        &self,
        environment: &EnvironmentSnapshot,
    ) -> Result<Child, LaunchError> {
        let entry_point = self.entry_point()?;
        let client = self.launch_client()?;

        let mut args = vec![OsString::from("--share-pid"), OsString::from("--launcher")];
        args.extend(filesystem_args(&self.mounts));
        args.push(OsString::from("--"));
        args.push(OsString::from(format!("--bus-name={}", self.bus_name)));

        let launcher = PlannedCommand {
            program: entry_point,
            args,
            environment: environment.with_var(INSIDE_RUNTIME_VAR, "1"),
            working_dir: None,
        };

        info!("Starting shared Steam Runtime container");
        let mut child = launcher
            .to_command()
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| LaunchError::SpawnFailed {
                program: launcher.program.clone(),
                source,
            })?;

        match self.wait_until_ready(&client, environment, &mut child) {
            Ok(()) => Ok(child),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    fn wait_until_ready(
        &self,
        client: &Path,
        environment: &EnvironmentSnapshot,
        launcher: &mut Child,
    ) -> Result<(), LaunchError> {
        let ready_check = PlannedCommand {
            program: client.to_path_buf(),
            args: vec![
                OsString::from(format!("--bus-name={}", self.bus_name)),
                OsString::from("--"),
                OsString::from("true"),
            ],
            environment: environment.clone(),
            working_dir: None,
        };

        let deadline = Instant::now() + self.readiness_timeout;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = launcher.try_wait() {
                warn!(code = exit_code_of(status), "Container launcher exited during startup");
                break;
            }

            let ready = ready_check
                .to_command()
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .is_ok_and(|s| s.success());
            if ready {
                debug!("Shared container is ready");
                return Ok(());
            }
            thread::sleep(READINESS_POLL_INTERVAL);
        }

        Err(LaunchError::ContainerNotReady {
            bus_name: self.bus_name.clone(),
        })
    }

    fn direct_command(
        &self,
        request: &LaunchRequest,
        library_path: Option<String>,
    ) -> PlannedCommand {
        let program = match &self.dist_path {
            Some(dist) => dist.join("bin").join(&request.binary),
            None => PathBuf::from(&request.binary),
        };
        let environment = match library_path {
            Some(value) => request.environment.with_var("LD_LIBRARY_PATH", value),
            None => request.environment.clone(),
        };
        PlannedCommand {
            program,
            args: request.args.clone(),
            environment,
            working_dir: request.working_dir.clone(),
        }
    }

    fn proxy_binary(&self, binary: &str) -> PathBuf {
        match &self.proxy_dir {
            Some(dir) => dir.join(binary),
            None => PathBuf::from(binary),
        }
    }

    fn entry_point(&self) -> Result<PathBuf, LaunchError> {
        let runtime = self.runtime_path.as_ref().ok_or(LaunchError::RuntimePathUnset)?;
        find_first(runtime, ENTRY_POINT_NAMES)
    }

    fn launch_client(&self) -> Result<PathBuf, LaunchError> {
        let runtime = self.runtime_path.as_ref().ok_or(LaunchError::RuntimePathUnset)?;
        find_first(runtime, LAUNCH_CLIENT_NAMES)
    }
}

fn find_first(root: &Path, names: &[&str]) -> Result<PathBuf, LaunchError> {
    let candidates: Vec<PathBuf> = names.iter().map(|name| root.join(name)).collect();
    candidates
        .iter()
        .find(|path| path.is_file())
        .cloned()
        .ok_or(LaunchError::EntryPointNotFound {
            searched: candidates,
        })
}

/// `LD_LIBRARY_PATH` with `first` in front of `existing`.
fn prepend_library_path(first: Option<&str>, existing: Option<&str>) -> Option<String> {
    match (first, existing) {
        (Some(first), Some(existing)) if !existing.is_empty() => {
            Some(format!("{}:{existing}", first.trim_end_matches(':')))
        }
        (Some(first), _) => Some(first.trim_end_matches(':').to_string()),
        (None, _) => None,
    }
}

/// Computes `PROTON_LD_LIBRARY_PATH` for a mode.
///
/// `bwrap` mode only needs Proton's own libraries since the container provides
/// the rest. `legacy` mode also needs the legacy runtime's library directories,
/// printed by its `run.sh`.
///
/// # Errors
///
/// Returns `LaunchError::SpawnFailed` if the legacy runtime cannot be queried.
pub fn compose_library_path(
    mode: SandboxMode,
    dist_path: &Path,
    legacy_runtime_path: Option<&Path>,
) -> Result<Option<String>, LaunchError> {
    let proton_libs = format!(
        "{}:{}",
        dist_path.join("lib").display(),
        dist_path.join("lib64").display()
    );

    match mode {
        SandboxMode::Disabled => Ok(None),
        SandboxMode::Isolated => Ok(Some(proton_libs)),
        SandboxMode::Legacy => {
            let Some(runtime) = legacy_runtime_path else {
                warn!("Legacy Steam Runtime path is unknown, using Proton libraries only");
                return Ok(Some(proton_libs));
            };
            let script = runtime.join("run.sh");
            let output = Command::new(&script)
                .arg("--print-steam-runtime-library-paths")
                .stdin(Stdio::null())
                .stderr(Stdio::null())
                .output()
                .map_err(|source| LaunchError::SpawnFailed {
                    program: script.clone(),
                    source,
                })?;
            let runtime_libs = String::from_utf8_lossy(&output.stdout);
            Ok(Some(format!("{proton_libs}:{}", runtime_libs.trim())))
        }
    }
}

/// Waits for `child`, forwarding teardown signals received by this process.
///
/// After forwarding, the child gets `grace_period` to exit before it is
/// killed.
///
/// # Errors
///
/// Returns the error of `try_wait`/`wait`.
pub fn supervise_child(
    mut child: Child,
    signals: Option<&ShutdownSignals>,
    grace_period: Duration,
) -> std::io::Result<ExitStatus> {
    let pid = Pid::from_raw(child.id() as i32);
    let mut forwarded_at: Option<Instant> = None;

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }

        match forwarded_at {
            None => {
                if let Some(signal) = signals.and_then(ShutdownSignals::received) {
                    debug!(signal = %signal, pid = pid.as_raw(), "Forwarding signal to child");
                    let _ = nix_signal::kill(pid, signal);
                    forwarded_at = Some(Instant::now());
                }
            }
            Some(at) if at.elapsed() >= grace_period => {
                warn!(pid = pid.as_raw(), "Child did not exit after signal, killing it");
                let _ = nix_signal::kill(pid, Signal::SIGKILL);
                return child.wait();
            }
            Some(_) => {}
        }

        thread::sleep(CHILD_POLL_INTERVAL);
    }
}

/// Exit code to propagate for a child status: the code itself, or
/// `128 + signal` for children killed by a signal.
#[must_use]
pub fn exit_code_of(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => crate::error::INFRASTRUCTURE_EXIT_CODE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn runtime_with(names: &[&str]) -> TempDir {
        let dir = TempDir::new().expect("failed to create temp dir");
        for name in names {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().expect("path has parent")).expect("failed to create dir");
            fs::write(&path, b"#!/bin/sh\n").expect("failed to write entry point");
        }
        dir
    }

    fn config(runtime: &Path) -> SessionConfig {
        SessionConfig::new()
            .with_session_id("1234-abcd")
            .with_target_id("620")
            .with_runtime_path(runtime)
            .with_dist_path("/proton/files")
            .with_proton_path("/proton")
            .with_cache_root("/cache")
    }

    #[test]
    fn test_mode_parsing_and_display() {
        assert_eq!("bwrap".parse::<SandboxMode>().ok(), Some(SandboxMode::Isolated));
        assert_eq!(
            "isolated-per-launch".parse::<SandboxMode>().ok(),
            Some(SandboxMode::Isolated)
        );
        assert_eq!(
            "legacy-no-isolation".parse::<SandboxMode>().ok(),
            Some(SandboxMode::Legacy)
        );
        assert_eq!("OFF".parse::<SandboxMode>().ok(), Some(SandboxMode::Disabled));
        assert!("docker".parse::<SandboxMode>().is_err());

        for mode in [SandboxMode::Isolated, SandboxMode::Legacy, SandboxMode::Disabled] {
            assert_eq!(mode.to_string().parse::<SandboxMode>().ok(), Some(mode));
        }
    }

    #[test]
    fn test_bus_name_replaces_dashes() {
        assert_eq!(
            bus_name("620", "1234-abcd"),
            "com.github.winecell.App620_1234_abcd"
        );
    }

    #[test]
    fn test_bootstrap_declares_mounts_and_marker() {
        let runtime = runtime_with(&["_v2-entry-point"]);
        let launcher = SandboxLauncher::new(&config(runtime.path()), SandboxMode::Isolated)
            .with_mounts(vec![MountPoint {
                path: PathBuf::from("/home"),
                kind: crate::sandbox::MountKind::Root,
            }]);
        assert!(launcher.needs_mounts());

        let request = LaunchRequest::new("wine").with_args(["winecfg"]);
        let plan = launcher.plan(&request).expect("plan failed");

        let LaunchPlan::Bootstrap(cmd) = &plan else {
            panic!("expected bootstrap plan, got {plan:?}");
        };
        assert_eq!(cmd.program, runtime.path().join("_v2-entry-point"));
        assert_eq!(
            cmd.args,
            vec![
                OsString::from("--filesystem"),
                OsString::from("/home"),
                OsString::from("--"),
                OsString::from("/cache/winecell/proton/proton/bin/wine"),
                OsString::from("winecfg"),
            ]
        );
        assert_eq!(cmd.environment.get(INSIDE_RUNTIME_VAR), Some("1"));
    }

    #[test]
    fn test_missing_entry_point_is_fatal() {
        let runtime = runtime_with(&[]);
        let launcher = SandboxLauncher::new(&config(runtime.path()), SandboxMode::Isolated);

        let err = launcher
            .plan(&LaunchRequest::new("wine"))
            .expect_err("plan should fail");
        let LaunchError::EntryPointNotFound { searched } = &err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(searched.len(), ENTRY_POINT_NAMES.len());
    }

    #[test]
    fn test_attach_uses_bus_name() {
        let runtime = runtime_with(&["run", LAUNCH_CLIENT_NAMES[1]]);
        let launcher = SandboxLauncher::new(
            &config(runtime.path()).with_shared_container(true),
            SandboxMode::Isolated,
        );
        assert!(!launcher.needs_mounts());

        let plan = launcher
            .plan(&LaunchRequest::new("wineserver").with_args(["-w"]))
            .expect("plan failed");
        let LaunchPlan::Attach(cmd) = &plan else {
            panic!("expected attach plan, got {plan:?}");
        };
        assert_eq!(cmd.program, runtime.path().join(LAUNCH_CLIENT_NAMES[1]));
        assert_eq!(
            cmd.args.first(),
            Some(&OsString::from("--bus-name=com.github.winecell.App620_1234_abcd"))
        );
        assert_eq!(cmd.args.last(), Some(&OsString::from("-w")));
    }

    #[test]
    fn test_inside_runtime_prepends_library_path() {
        let mut config = config(Path::new("/nonexistent"));
        config.inside_runtime = true;
        config.library_path = Some("/proton/files/lib:/proton/files/lib64".to_string());

        let request = LaunchRequest::new("wine").with_environment(
            EnvironmentSnapshot::from_pairs([("LD_LIBRARY_PATH", "/runtime/lib")]),
        );
        let plan = SandboxLauncher::new(&config, SandboxMode::Isolated)
            .plan(&request)
            .expect("plan failed");

        let LaunchPlan::Direct(cmd) = &plan else {
            panic!("expected direct plan, got {plan:?}");
        };
        assert_eq!(cmd.program, PathBuf::from("/proton/files/bin/wine"));
        assert_eq!(
            cmd.environment.get("LD_LIBRARY_PATH"),
            Some("/proton/files/lib:/proton/files/lib64:/runtime/lib")
        );
    }

    #[test]
    fn test_disabled_mode_leaves_environment_alone() {
        let request = LaunchRequest::new("wine").with_environment(
            EnvironmentSnapshot::from_pairs([("LD_LIBRARY_PATH", "/host/lib")]),
        );
        let plan = SandboxLauncher::new(&config(Path::new("/nonexistent")), SandboxMode::Disabled)
            .plan(&request)
            .expect("plan failed");
        assert_eq!(plan.kind(), "direct");
        assert_eq!(plan.command().environment, request.environment);
    }

    #[test]
    fn test_compose_library_path() {
        let dist = Path::new("/proton/files");
        assert_eq!(
            compose_library_path(SandboxMode::Isolated, dist, None).expect("compose failed"),
            Some("/proton/files/lib:/proton/files/lib64".to_string())
        );
        assert_eq!(
            compose_library_path(SandboxMode::Disabled, dist, None).expect("compose failed"),
            None
        );
    }

    #[test]
    fn test_execute_propagates_exit_code() {
        let launcher = SandboxLauncher::new(&SessionConfig::new(), SandboxMode::Disabled);
        let plan = LaunchPlan::Direct(PlannedCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec![OsString::from("-c"), OsString::from("exit 7")],
            environment: EnvironmentSnapshot::default(),
            working_dir: None,
        });
        assert_eq!(launcher.execute(&plan, None).expect("execute failed"), 7);
    }

    #[test]
    fn test_signal_exit_code() {
        let status = ExitStatus::from_raw(Signal::SIGTERM as i32);
        assert_eq!(exit_code_of(status), 128 + Signal::SIGTERM as i32);
    }
}
