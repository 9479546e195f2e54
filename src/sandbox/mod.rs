//! Running Wine binaries inside the Steam Runtime container.
//!
//! This module resolves which host directories the container sees, decides
//! whether a launch bootstraps a container, attaches to the session's shared
//! one or runs directly, and maintains the proxy binaries that route Wine
//! calls through it.
//!
//! # Example
//!
//! ```no_run
//! use winecell::sandbox::{LaunchRequest, SandboxLauncher, SandboxMode, SessionConfig};
//!
//! let config = SessionConfig::new()
//!     .with_runtime_path("/steam/common/SteamLinuxRuntime_sniper")
//!     .with_dist_path("/steam/common/Proton 9.0/files");
//!
//! let launcher = SandboxLauncher::new(&config, SandboxMode::Isolated);
//! let plan = launcher.plan(&LaunchRequest::new("wine").with_args(["winecfg"])).unwrap();
//! let code = launcher.execute(&plan, None).unwrap();
//! println!("exit code: {code}");
//! ```

mod config;
mod launcher;
mod mounts;
mod proxy;

pub use config::{
    BACKGROUND_HELPER_VAR, DEFAULT_LOG_LEVEL, FIRST_START_VAR, INSIDE_RUNTIME_VAR,
    LEGACY_RUNTIME_PATH_VAR, LOG_LEVEL_VAR, PROTON_DIST_PATH_VAR, PROTON_LIBRARY_PATH_VAR,
    PROTON_PATH_VAR, RUNTIME_VAR, SESSION_ID_VAR, SHARED_CONTAINER_VAR, STEAM_APP_PATH_VAR,
    STEAM_RUNTIME_PATH_VAR, SessionConfig, TARGET_ID_VAR, TEMP_PATH_VAR,
};
pub use launcher::{
    BUS_NAME_PREFIX, DEFAULT_GRACE_PERIOD, ENTRY_POINT_NAMES, LAUNCH_CLIENT_NAMES, LaunchPlan,
    LaunchRequest, PlannedCommand, SandboxLauncher, SandboxMode, bus_name, compose_library_path,
    exit_code_of, supervise_child,
};
pub use mounts::{
    BLOCKLISTED_ROOT_DIRS, MountKind, MountPoint, MountSetResolver, REMOVABLE_MEDIA_ROOT,
    filesystem_args,
};
pub use proxy::{
    KEEPALIVE_BATCH_SCRIPT, KEEPALIVE_SCRIPT_NAME, PROXY_EXECUTABLE_NAME, ProxyBinDir,
    windows_path,
};
