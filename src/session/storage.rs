//! Filesystem layout of a session.
//!
//! The session directory holds the marker files shared with the keepalive
//! batch script. Their presence is the only state both sides agree on, so all
//! operations here are idempotent: touching an existing marker or removing a
//! missing one succeeds.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::error::KeepaliveError;

/// Directory permissions: owner read/write/execute only (0700).
const DIR_PERMISSIONS: u32 = 0o700;

/// Prefix of session directory names.
pub const SESSION_DIR_PREFIX: &str = "winecell-keepalive-";

/// Marker keeping the idle loop alive.
pub const KEEPALIVE_MARKER: &str = "keepalive";

/// Marker ending the current idle loop iteration.
pub const RESTART_MARKER: &str = "restart";

/// Paths of a session's directory.
///
/// ```text
/// {temp_root}/winecell-keepalive-{session-id}/
/// ├── keepalive   # present while the helper should stay alive
/// └── restart     # present until the idle loop acknowledges it
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    /// Session directory, also the working directory of the idle loop.
    pub root: PathBuf,
    /// `keepalive` marker.
    pub keepalive: PathBuf,
    /// `restart` marker.
    pub restart: PathBuf,
}

impl SessionPaths {
    /// Computes the paths for a session. Nothing is created.
    #[must_use]
    pub fn new(temp_root: &Path, session_id: &str) -> Self {
        let root = temp_root.join(format!("{SESSION_DIR_PREFIX}{session_id}"));
        Self {
            keepalive: root.join(KEEPALIVE_MARKER),
            restart: root.join(RESTART_MARKER),
            root,
        }
    }

    /// Creates the session directory with owner-only permissions.
    ///
    /// # Errors
    ///
    /// Returns `KeepaliveError::TempDir` if creation fails.
    pub fn create_directories(&self) -> Result<(), KeepaliveError> {
        fs::create_dir_all(&self.root).map_err(|e| KeepaliveError::TempDir {
            path: self.root.clone(),
            source: e,
        })?;

        let permissions = fs::Permissions::from_mode(DIR_PERMISSIONS);
        fs::set_permissions(&self.root, permissions).map_err(|e| KeepaliveError::TempDir {
            path: self.root.clone(),
            source: e,
        })?;

        trace!(root = %self.root.display(), "Created session directory");
        Ok(())
    }

    /// Returns true if the session directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Returns true if the `keepalive` marker exists.
    #[must_use]
    pub fn keepalive_exists(&self) -> bool {
        self.keepalive.exists()
    }

    /// Returns true if the `restart` marker exists.
    #[must_use]
    pub fn restart_exists(&self) -> bool {
        self.restart.exists()
    }

    /// Removes the session directory and everything in it.
    ///
    /// Failures are logged, never returned. Returns true if the directory is
    /// gone afterwards.
    pub fn cleanup(&self) -> bool {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                debug!(root = %self.root.display(), "Removed session directory");
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Failed to remove session directory");
                false
            }
        }
    }
}

/// Creates an empty marker file, leaving an existing one untouched.
///
/// # Errors
///
/// Returns `KeepaliveError::Marker` if the file cannot be created.
pub fn touch_marker(path: &Path) -> Result<(), KeepaliveError> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| KeepaliveError::Marker {
            path: path.to_path_buf(),
            source: e,
        })?;
    trace!(path = %path.display(), "Touched marker");
    Ok(())
}

/// Removes a marker file.
///
/// A missing marker is not an error. Other failures are logged. Returns true
/// if the marker existed and was removed by this call.
pub fn remove_marker(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            trace!(path = %path.display(), "Removed marker");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove marker");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_paths_layout() {
        let paths = SessionPaths::new(Path::new("/tmp"), "abc");
        assert_eq!(paths.root, PathBuf::from("/tmp/winecell-keepalive-abc"));
        assert_eq!(paths.keepalive, PathBuf::from("/tmp/winecell-keepalive-abc/keepalive"));
        assert_eq!(paths.restart, PathBuf::from("/tmp/winecell-keepalive-abc/restart"));
    }

    #[test]
    fn test_create_directories_is_private() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let paths = SessionPaths::new(temp.path(), "s1");
        paths.create_directories().expect("failed to create session dir");

        let mode = fs::metadata(&paths.root)
            .expect("failed to stat session dir")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, DIR_PERMISSIONS);

        // Creating again is fine
        paths.create_directories().expect("second create failed");
    }

    #[test]
    fn test_markers_are_idempotent() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let paths = SessionPaths::new(temp.path(), "s2");
        paths.create_directories().expect("failed to create session dir");

        touch_marker(&paths.keepalive).expect("touch failed");
        touch_marker(&paths.keepalive).expect("second touch failed");
        assert!(paths.keepalive_exists());

        assert!(remove_marker(&paths.keepalive));
        assert!(!remove_marker(&paths.keepalive));
        assert!(!paths.keepalive_exists());
    }

    #[test]
    fn test_cleanup_missing_directory_succeeds() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let paths = SessionPaths::new(temp.path(), "s3");
        assert!(paths.cleanup());

        paths.create_directories().expect("failed to create session dir");
        touch_marker(&paths.restart).expect("touch failed");
        assert!(paths.cleanup());
        assert!(!paths.exists());
    }
}
