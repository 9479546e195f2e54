//! Error types for winecell.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//! Every error that aborts a launch maps to [`INFRASTRUCTURE_EXIT_CODE`], which is
//! never shared with the exit codes of the wrapped Wine binaries.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Exit code reserved for failures of winecell itself (bad configuration,
/// missing runtime entry point, spawn failures).
pub const INFRASTRUCTURE_EXIT_CODE: i32 = 125;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Invalid or incomplete session configuration
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    /// The sandbox could not be entered or the binary could not be started
    #[error(transparent)]
    #[diagnostic(transparent)]
    Launch(#[from] LaunchError),

    /// The mount set could not be computed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Mount(#[from] MountError),

    /// The background helper could not be set up
    #[error(transparent)]
    #[diagnostic(transparent)]
    Keepalive(#[from] KeepaliveError),

    /// Host probing or signal setup failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    System(#[from] SystemError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(winecell::io))]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Exit code to report when this error aborts a launch request.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        INFRASTRUCTURE_EXIT_CODE
    }
}

/// Errors in the session configuration, surfaced before anything is launched.
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// Unknown value for the runtime mode selector
    #[error("Unknown sandbox mode '{value}'")]
    #[diagnostic(
        code(winecell::config::mode),
        help("Use one of: bwrap (isolated-per-launch), legacy (legacy-no-isolation), off (disabled)")
    )]
    UnknownMode { value: String },

    /// A required variable is not set
    #[error("Required environment variable {name} is not set")]
    #[diagnostic(code(winecell::config::missing_variable))]
    MissingVariable { name: &'static str },

    /// The Wine prefix does not exist
    #[error("Wine prefix does not exist: {}", path.display())]
    #[diagnostic(
        code(winecell::config::prefix_missing),
        help("Launch the app once through Steam so the prefix gets created")
    )]
    PrefixMissing { path: PathBuf },

    /// No Proton distribution directory could be found
    #[error("No Proton distribution directory found under {}", path.display())]
    #[diagnostic(
        code(winecell::config::dist_missing),
        help("Expected a 'dist' or 'files' directory containing bin/wine")
    )]
    DistMissing { path: PathBuf },

    /// The session ID contains characters that cannot appear in a bus name
    #[error("Invalid session ID '{id}'")]
    #[diagnostic(
        code(winecell::config::session_id),
        help("Session IDs may only contain ASCII letters, digits, '-' and '_'")
    )]
    InvalidSessionId { id: String },
}

/// Errors raised while resolving the container mount set.
#[derive(Error, Debug, Diagnostic)]
pub enum MountError {
    /// The root directory could not be enumerated
    #[error("Failed to enumerate {}", root.display())]
    #[diagnostic(code(winecell::mount::root_unreadable))]
    RootUnreadable {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while entering the sandbox or starting the target binary.
#[derive(Error, Debug, Diagnostic)]
pub enum LaunchError {
    /// The platform sandbox entry point does not exist under any known name
    #[error("Steam Runtime entry point not found (searched: {})", display_paths(searched))]
    #[diagnostic(
        code(winecell::launch::entry_point),
        help("Reinstall the Steam Linux Runtime, or rerun with --mode legacy or --mode off")
    )]
    EntryPointNotFound { searched: Vec<PathBuf> },

    /// Isolated mode was selected but no runtime path is known
    #[error("STEAM_RUNTIME_PATH is not set but sandbox mode 'bwrap' was selected")]
    #[diagnostic(code(winecell::launch::runtime_path))]
    RuntimePathUnset,

    /// Spawning a process failed
    #[error("Failed to spawn {}", program.display())]
    #[diagnostic(code(winecell::launch::spawn))]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for a spawned process failed
    #[error("Failed to wait for {}", program.display())]
    #[diagnostic(code(winecell::launch::wait))]
    WaitFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The shared container never started answering on its bus name
    #[error("Shared container did not become ready on bus name {bus_name}")]
    #[diagnostic(
        code(winecell::launch::container_not_ready),
        help("Rerun without --shared-container to start one container per launch")
    )]
    ContainerNotReady { bus_name: String },

    /// Creating the proxy binary directory failed
    #[error("Failed to prepare proxy directory {}", path.display())]
    #[diagnostic(code(winecell::launch::proxy_dir))]
    ProxyDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while setting up the keepalive helper.
#[derive(Error, Debug, Diagnostic)]
pub enum KeepaliveError {
    /// Session temp directory creation failed
    #[error("Failed to create session directory {}", path.display())]
    #[diagnostic(code(winecell::keepalive::temp_dir))]
    TempDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A marker file could not be written
    #[error("Failed to write marker file {}", path.display())]
    #[diagnostic(code(winecell::keepalive::marker))]
    Marker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The outer loop thread could not be started
    #[error("Failed to start keepalive loop")]
    #[diagnostic(code(winecell::keepalive::thread))]
    Thread(#[source] std::io::Error),
}

/// Errors raised while probing the host.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemError {
    /// Installing a signal handler failed
    #[error("Failed to install handler for {signal}: {reason}")]
    #[diagnostic(code(winecell::system::signal))]
    SignalInstall { signal: String, reason: String },

    /// The Flatpak instance file exists but could not be parsed
    #[error("Malformed Flatpak instance info: {reason}")]
    #[diagnostic(code(winecell::system::flatpak_info))]
    FlatpakInfo { reason: String },

    /// Failed to read system information
    #[error("Failed to read system information: {context}")]
    #[diagnostic(code(winecell::system::read_failed))]
    ReadFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
