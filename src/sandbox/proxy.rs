//! Proxy binary directory.
//!
//! Tools such as winetricks call `wine`, `wineserver` etc. from `PATH`. To run
//! those through the Steam Runtime, a directory is created per Proton build
//! containing a private copy of the winecell executable and one symlink to it
//! per binary of the build. Invoked through a symlink, winecell dispatches on
//! `argv[0]` and launches the matching Proton binary.
//!
//! The copy lives in the user's cache directory because the host's `/usr` is
//! not visible inside the container.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, trace};
use walkdir::WalkDir;

use crate::error::LaunchError;

/// Name of the winecell copy inside the directory.
pub const PROXY_EXECUTABLE_NAME: &str = "winecell";

/// Name of the keepalive batch script inside the directory.
pub const KEEPALIVE_SCRIPT_NAME: &str = "winecell-keepalive.bat";

/// Idle loop run by `wine cmd.exe /c`.
///
/// The working directory is the session directory. The loop ends when
/// `keepalive` disappears, or when `restart` appears, which it deletes first.
/// `ping` is the only portable sleep available in Wine's `cmd.exe`.
pub const KEEPALIVE_BATCH_SCRIPT: &str = "@echo off\r
:loop\r
if exist restart goto restart\r
if not exist keepalive goto end\r
ping -n 2 127.0.0.1 > nul\r
goto loop\r
:restart\r
del restart\r
:end\r
";

/// Converts a Unix path to the path Wine maps it to on drive `Z:`.
#[must_use]
pub fn windows_path(path: &Path) -> String {
    format!("Z:{}", path.display()).replace('/', "\\")
}

/// A directory of proxy binaries for one Proton build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyBinDir {
    path: PathBuf,
}

impl ProxyBinDir {
    /// Uses `path` as the proxy directory.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The directory itself, prepended to `PATH`.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the proxy for `binary`.
    #[must_use]
    pub fn binary(&self, binary: &str) -> PathBuf {
        self.path.join(binary)
    }

    /// Path of the keepalive batch script.
    #[must_use]
    pub fn keepalive_script(&self) -> PathBuf {
        self.path.join(KEEPALIVE_SCRIPT_NAME)
    }

    /// Rebuilds the directory for the binaries in `<dist>/bin`.
    ///
    /// The directory is emptied first, so binaries removed from the Proton
    /// build lose their proxy. Returns the proxied binary names.
    ///
    /// # Errors
    ///
    /// Returns `LaunchError::ProxyDir` if any file operation fails.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn prepare(&self, dist_path: &Path, executable: &Path) -> Result<Vec<String>, LaunchError> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => trace!("Removed previous proxy directory"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(self.error(&self.path, e)),
        }
        fs::create_dir_all(&self.path).map_err(|e| self.error(&self.path, e))?;

        let copy = self.path.join(PROXY_EXECUTABLE_NAME);
        fs::copy(executable, &copy).map_err(|e| self.error(&copy, e))?;

        let bin_dir = dist_path.join("bin");
        let mut names: Vec<String> = WalkDir::new(&bin_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| name != PROXY_EXECUTABLE_NAME && name != KEEPALIVE_SCRIPT_NAME)
            .collect();
        names.sort();

        for name in &names {
            let link = self.path.join(name);
            symlink(PROXY_EXECUTABLE_NAME, &link).map_err(|e| self.error(&link, e))?;
        }

        let script = self.keepalive_script();
        fs::write(&script, KEEPALIVE_BATCH_SCRIPT).map_err(|e| self.error(&script, e))?;

        info!(count = names.len(), "Created proxy binary directory");
        debug!(binaries = ?names, "Proxied binaries");
        Ok(names)
    }

    fn error(&self, path: &Path, source: std::io::Error) -> LaunchError {
        LaunchError::ProxyDir {
            path: path.to_path_buf(),
            source,
        }
    }
}
