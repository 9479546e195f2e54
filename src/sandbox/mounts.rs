//! Mount-set resolution for the Steam Runtime container.
//!
//! The container gets its own `/usr`, `/lib` etc. from the runtime, so only
//! host directories that do not clash with it are exposed. Every other
//! top-level directory is passed through, followed by the few paths Wine
//! needs that may live below a block-listed directory (e.g. `/run/media`).
//!
//! The result is rendered into an ordered `--filesystem` argument list, so it
//! must be deterministic and must never declare a path twice or declare a path
//! that is already covered by another entry.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, instrument, trace};

use crate::error::MountError;

/// Top-level directories that are never mounted wholesale.
///
/// These are provided by the runtime itself or are virtual filesystems
/// managed by the container.
pub const BLOCKLISTED_ROOT_DIRS: &[&str] = &[
    "bin", "dev", "lib", "lib32", "lib64", "proc", "run", "sbin", "sys", "usr", "var",
];

/// Default root for removable media mounted by udisks.
pub const REMOVABLE_MEDIA_ROOT: &str = "/run/media";

/// How a mount ended up in the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    /// A top-level directory of the host root.
    Root,
    /// An explicitly required path.
    Additional,
}

/// A host directory exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountPoint {
    /// Host path, mounted at the same location inside the container.
    pub path: PathBuf,
    /// Whether this is a root-level or an additional mount.
    pub kind: MountKind,
}

impl MountPoint {
    /// Returns true if this mount already exposes `path`.
    #[must_use]
    pub fn covers(&self, path: &Path) -> bool {
        path.starts_with(&self.path)
    }
}

/// Computes the minimal ordered set of mounts for the container.
#[derive(Debug, Clone)]
pub struct MountSetResolver {
    root: PathBuf,
    blocklist: Vec<String>,
}

impl Default for MountSetResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl MountSetResolver {
    /// Resolver for the host root with [`BLOCKLISTED_ROOT_DIRS`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/"),
            blocklist: BLOCKLISTED_ROOT_DIRS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Enumerates top-level entries under `root` instead of `/`.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Replaces the block-list of top-level entry names.
    #[must_use]
    pub fn with_blocklist<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocklist = names.into_iter().map(Into::into).collect();
        self
    }

    /// Resolves the mount set for the given required paths.
    ///
    /// Root entries come first in name order, then the required paths in the
    /// order given. Required paths that are empty, missing, or already covered
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns `MountError::RootUnreadable` if the root cannot be enumerated.
    #[instrument(skip_all, fields(root = %self.root.display(), required = required.len()))]
    pub fn resolve<P: AsRef<Path>>(&self, required: &[P]) -> Result<Vec<MountPoint>, MountError> {
        let mut mounts = self.root_mounts()?;

        for path in required {
            let path = path.as_ref();
            if path.as_os_str().is_empty() {
                trace!("Ignoring empty required path");
                continue;
            }
            if !path.exists() {
                debug!(path = %path.display(), "Required path does not exist, skipping");
                continue;
            }
            if let Some(existing) = mounts.iter().find(|m| m.covers(path)) {
                trace!(path = %path.display(), covered_by = %existing.path.display(), "Already mounted");
                continue;
            }

            // The root itself would expose block-listed entries
            if self.root.starts_with(path) {
                debug!(path = %path.display(), "Required path contains the resolver root, skipping");
                continue;
            }

            // A broader path given later replaces every entry it contains
            mounts.retain(|m| !m.path.starts_with(path));
            mounts.push(MountPoint {
                path: path.to_path_buf(),
                kind: MountKind::Additional,
            });
        }

        debug!(count = mounts.len(), "Resolved mount set");
        Ok(mounts)
    }

    fn root_mounts(&self) -> Result<Vec<MountPoint>, MountError> {
        let entries = fs::read_dir(&self.root).map_err(|source| MountError::RootUnreadable {
            root: self.root.clone(),
            source,
        })?;

        let mut names: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name())
            .collect();
        names.sort();

        let mounts = names
            .into_iter()
            .filter(|name| {
                let blocked = name
                    .to_str()
                    .is_some_and(|n| self.blocklist.iter().any(|b| b == n));
                !blocked
            })
            .map(|name| self.root.join(name))
            .filter(|path| path.is_dir())
            .map(|path| MountPoint {
                path,
                kind: MountKind::Root,
            })
            .collect();
        Ok(mounts)
    }
}

/// Renders mounts as `--filesystem <path>` argument pairs.
#[must_use]
pub fn filesystem_args(mounts: &[MountPoint]) -> Vec<std::ffi::OsString> {
    mounts
        .iter()
        .flat_map(|m| ["--filesystem".into(), m.path.clone().into_os_string()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_root() -> TempDir {
        let dir = TempDir::new().expect("failed to create temp dir");
        for name in ["home", "mnt", "opt", "run/media/usb", "usr/share", "proc"] {
            fs::create_dir_all(dir.path().join(name)).expect("failed to create dir");
        }
        fs::write(dir.path().join("swapfile"), b"").expect("failed to create file");
        dir
    }

    #[test]
    fn test_root_entries_exclude_blocklist_and_files() {
        let root = fake_root();
        let mounts = MountSetResolver::new()
            .with_root(root.path())
            .resolve::<&Path>(&[])
            .expect("resolve failed");

        let paths: Vec<_> = mounts.iter().map(|m| m.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                root.path().join("home"),
                root.path().join("mnt"),
                root.path().join("opt"),
            ]
        );
        assert!(mounts.iter().all(|m| m.kind == MountKind::Root));
    }

    #[test]
    fn test_required_path_under_blocked_root_is_mounted() {
        let root = fake_root();
        let media = root.path().join("run/media");
        let mounts = MountSetResolver::new()
            .with_root(root.path())
            .resolve(&[&media])
            .expect("resolve failed");

        let last = mounts.last().expect("mount set is empty");
        assert_eq!(last.path, media);
        assert_eq!(last.kind, MountKind::Additional);
    }

    #[test]
    fn test_required_path_covered_by_root_is_skipped() {
        let root = fake_root();
        let prefix = root.path().join("home/user/prefix");
        fs::create_dir_all(&prefix).expect("failed to create prefix");

        let mounts = MountSetResolver::new()
            .with_root(root.path())
            .resolve(&[&prefix])
            .expect("resolve failed");
        assert!(!mounts.iter().any(|m| m.path == prefix));
        assert!(mounts.iter().any(|m| m.path == root.path().join("home")));
    }

    #[test]
    fn test_empty_and_missing_paths_are_ignored() {
        let root = fake_root();
        let mounts = MountSetResolver::new()
            .with_root(root.path())
            .resolve(&[PathBuf::new(), root.path().join("run/missing")])
            .expect("resolve failed");
        assert!(mounts.iter().all(|m| m.kind == MountKind::Root));
    }

    #[test]
    fn test_broader_path_replaces_narrower_one() {
        let root = fake_root();
        let usb = root.path().join("run/media/usb");
        let media = root.path().join("run/media");

        let mounts = MountSetResolver::new()
            .with_root(root.path())
            .resolve(&[&usb, &media, &usb])
            .expect("resolve failed");
        let additional: Vec<_> = mounts
            .iter()
            .filter(|m| m.kind == MountKind::Additional)
            .map(|m| m.path.clone())
            .collect();
        assert_eq!(additional, vec![media]);
    }

    #[test]
    fn test_root_and_its_ancestors_are_not_mounted() {
        let root = fake_root();
        let parent = root.path().parent().expect("temp dir has parent").to_path_buf();

        let mounts = MountSetResolver::new()
            .with_root(root.path())
            .resolve(&[root.path().to_path_buf(), parent])
            .expect("resolve failed");
        assert!(mounts.iter().all(|m| m.kind == MountKind::Root));
        assert!(!mounts.iter().any(|m| m.path == root.path()));
    }

    #[test]
    fn test_no_entry_contains_another() {
        let root = fake_root();
        let prefix = root.path().join("home/user/prefix");
        fs::create_dir_all(&prefix).expect("failed to create prefix");
        let required = vec![
            root.path().join("run/media/usb"),
            prefix,
            root.path().to_path_buf(),
            root.path().join("run/media"),
            root.path().join("usr/share"),
            root.path().join("usr"),
            root.path().join("opt"),
        ];

        let mounts = MountSetResolver::new()
            .with_root(root.path())
            .resolve(&required)
            .expect("resolve failed");

        for (i, outer) in mounts.iter().enumerate() {
            for (j, inner) in mounts.iter().enumerate() {
                assert!(
                    i == j || !inner.path.starts_with(&outer.path),
                    "{} contains {}",
                    outer.path.display(),
                    inner.path.display()
                );
            }
        }
        let paths: Vec<_> = mounts.iter().map(|m| m.path.clone()).collect();
        assert!(paths.contains(&root.path().join("usr")));
        assert!(!paths.contains(&root.path().join("usr/share")));
        assert!(paths.contains(&root.path().join("run/media")));
    }

    #[test]
    fn test_unreadable_root_is_an_error() {
        let root = fake_root();
        let result = MountSetResolver::new()
            .with_root(root.path().join("nonexistent"))
            .resolve::<&Path>(&[]);
        assert!(matches!(result, Err(MountError::RootUnreadable { .. })));
    }

    #[test]
    fn test_filesystem_args_order() {
        let mounts = vec![
            MountPoint {
                path: PathBuf::from("/home"),
                kind: MountKind::Root,
            },
            MountPoint {
                path: PathBuf::from("/run/media"),
                kind: MountKind::Additional,
            },
        ];
        let args = filesystem_args(&mounts);
        assert_eq!(args, vec!["--filesystem", "/home", "--filesystem", "/run/media"]);
    }
}
