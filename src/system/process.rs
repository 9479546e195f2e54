//! Discovery of peer wineserver processes.
//!
//! Another session (usually the game itself, started by Steam) may already run
//! a wineserver for the same prefix. We find it by scanning processes by name
//! and matching the `WINEPREFIX` recovered from each candidate's environment.
//!
//! Every read is best-effort: processes can exit between listing and reading,
//! and processes owned by other users cannot be inspected. Both cases simply
//! drop the candidate.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace};

use crate::session::EnvironmentSnapshot;

/// Name of the helper binary peers are matched against.
pub const HELPER_BINARY_NAME: &str = "wineserver";

/// Variable identifying the prefix a process belongs to.
pub const PREFIX_VARIABLE: &str = "WINEPREFIX";

/// Argument that makes wineserver block until every client has exited.
pub const BLOCKING_WAIT_ARG: &str = "-w";

/// Read access to other processes' identity and environment.
///
/// Implementations return `None`/empty results for processes that vanished or
/// cannot be read; those are never errors.
pub trait PeerEnvironmentReader: Send + Sync {
    /// PIDs of processes whose name is exactly `name`.
    fn pids_named(&self, name: &str) -> Vec<u32>;

    /// Environment block of the given process.
    fn environment(&self, pid: u32) -> Option<EnvironmentSnapshot>;

    /// Argument vector of the given process.
    fn command_line(&self, pid: u32) -> Option<Vec<String>>;
}

/// [`PeerEnvironmentReader`] backed by a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcfsReader {
    root: PathBuf,
}

impl Default for ProcfsReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsReader {
    /// Reader for the host's `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Reader for a procfs-like tree rooted elsewhere.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn process_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }
}

impl PeerEnvironmentReader for ProcfsReader {
    fn pids_named(&self, name: &str) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut pids: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| {
                fs::read_to_string(self.process_dir(*pid).join("comm"))
                    .map(|comm| comm.trim_end() == name)
                    .unwrap_or(false)
            })
            .collect();
        pids.sort_unstable();
        pids
    }

    fn environment(&self, pid: u32) -> Option<EnvironmentSnapshot> {
        fs::read(self.process_dir(pid).join("environ"))
            .ok()
            .map(|block| EnvironmentSnapshot::from_environ_block(&block))
    }

    fn command_line(&self, pid: u32) -> Option<Vec<String>> {
        let raw = fs::read(self.process_dir(pid).join("cmdline")).ok()?;
        if raw.is_empty() {
            // Kernel threads and zombies have no command line
            return None;
        }
        Some(
            raw.split(|b| *b == 0)
                .filter(|arg| !arg.is_empty())
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect(),
        )
    }
}

/// A peer helper process bound to a prefix.
///
/// The environment is captured once at discovery time, so every value taken
/// from it describes the same process even if it exits afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperProcessHandle {
    /// Process ID at discovery time.
    pub pid: u32,
    /// Prefix recovered from the process environment.
    pub prefix: PathBuf,
    /// Environment captured at discovery time.
    pub environment: EnvironmentSnapshot,
}

/// Returns true if `program args...` is a wait-for-quiescence call.
///
/// This keys off the binary name and the first argument only, so a wineserver
/// reached through a differently named alias is not recognized. Best-effort.
#[must_use]
pub fn is_blocking_wait<S: AsRef<OsStr>>(program: impl AsRef<Path>, args: &[S]) -> bool {
    let name_matches = program
        .as_ref()
        .file_name()
        .is_some_and(|name| name == HELPER_BINARY_NAME);

    name_matches
        && args
            .first()
            .is_some_and(|arg| arg.as_ref() == OsStr::new(BLOCKING_WAIT_ARG))
}

/// Finds peer helper processes for a prefix.
pub struct HelperProcessLocator<'a> {
    reader: &'a dyn PeerEnvironmentReader,
    helper_name: String,
    self_pid: u32,
}

impl<'a> HelperProcessLocator<'a> {
    /// Creates a locator for [`HELPER_BINARY_NAME`] that ignores the calling process.
    #[must_use]
    pub fn new(reader: &'a dyn PeerEnvironmentReader) -> Self {
        Self {
            reader,
            helper_name: HELPER_BINARY_NAME.to_string(),
            self_pid: std::process::id(),
        }
    }

    /// Overrides the process name to match.
    #[must_use]
    pub fn with_helper_name(mut self, name: impl Into<String>) -> Self {
        self.helper_name = name.into();
        self
    }

    /// Overrides the PID treated as "self".
    #[must_use]
    pub fn with_self_pid(mut self, pid: u32) -> Self {
        self.self_pid = pid;
        self
    }

    /// Finds a helper process whose prefix equals `prefix`.
    ///
    /// When several match, the one with the lowest PID is returned.
    #[instrument(skip(self), fields(prefix = %prefix.display(), name = %self.helper_name))]
    pub fn locate(&self, prefix: &Path) -> Option<HelperProcessHandle> {
        let found = self
            .reader
            .pids_named(&self.helper_name)
            .into_iter()
            .filter(|pid| *pid != self.self_pid)
            .find_map(|pid| {
                let environment = self.reader.environment(pid)?;
                let peer_prefix = PathBuf::from(environment.get(PREFIX_VARIABLE)?);
                if peer_prefix != prefix {
                    trace!(pid, peer_prefix = %peer_prefix.display(), "Skipping helper for other prefix");
                    return None;
                }
                Some(HelperProcessHandle {
                    pid,
                    prefix: peer_prefix,
                    environment,
                })
            });

        match &found {
            Some(handle) => debug!(pid = handle.pid, "Found running helper process"),
            None => debug!("No running helper process found"),
        }
        found
    }

    /// PIDs of helper processes for `prefix` currently blocked in a
    /// wait-for-quiescence call, excluding the calling process.
    #[must_use]
    pub fn blocked_waiters(&self, prefix: &Path) -> Vec<u32> {
        self.reader
            .pids_named(&self.helper_name)
            .into_iter()
            .filter(|pid| *pid != self.self_pid)
            .filter(|pid| {
                self.reader
                    .command_line(*pid)
                    .is_some_and(|argv| match argv.split_first() {
                        Some((program, args)) => is_blocking_wait(program, args),
                        None => false,
                    })
            })
            .filter(|pid| {
                self.reader
                    .environment(*pid)
                    .and_then(|env| env.get(PREFIX_VARIABLE).map(PathBuf::from))
                    .is_some_and(|p| p == prefix)
            })
            .collect()
    }
}
