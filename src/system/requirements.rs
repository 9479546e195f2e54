//! Host capability checks.
//!
//! When winecell itself runs inside a Flatpak sandbox, starting the Steam
//! Runtime container requires sub-sandbox support, which only exists from
//! Flatpak 1.12.1 onwards. Older versions fall back to the legacy runtime.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::SystemError;
use crate::sandbox::SandboxMode;

/// Instance info file present in every Flatpak sandbox.
pub const FLATPAK_INFO_PATH: &str = "/.flatpak-info";

/// First Flatpak version supporting sub-sandboxes.
pub const FLATPAK_BWRAP_COMPATIBLE_VERSION: (u32, u32, u32) = (1, 12, 1);

/// Results of the host checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostRequirements {
    /// Running Flatpak version, if inside a Flatpak sandbox
    pub flatpak_version: Option<(u32, u32, u32)>,
    /// Whether the isolated runtime mode can be used
    pub bwrap_supported: bool,
}

impl HostRequirements {
    /// Mode to actually use when `requested` was asked for.
    #[must_use]
    pub fn effective_mode(&self, requested: SandboxMode) -> SandboxMode {
        if requested == SandboxMode::Isolated && !self.bwrap_supported {
            warn!("Flatpak version is too old (<1.12.1) to support sub-sandboxes, using legacy runtime");
            return SandboxMode::Legacy;
        }
        requested
    }
}

/// Checks the host using [`FLATPAK_INFO_PATH`].
///
/// # Errors
///
/// Returns error if the Flatpak info file exists but is malformed.
pub fn check_all() -> Result<HostRequirements, SystemError> {
    check_with_info_path(Path::new(FLATPAK_INFO_PATH))
}

/// Checks the host using the given Flatpak info file.
///
/// # Errors
///
/// Returns error if the file exists but cannot be read or parsed.
pub fn check_with_info_path(info_path: &Path) -> Result<HostRequirements, SystemError> {
    let flatpak_version = running_flatpak_version(info_path)?;
    if let Some((major, minor, patch)) = flatpak_version {
        info!("Running inside Flatpak sandbox, version {major}.{minor}.{patch}");
    }

    Ok(HostRequirements {
        flatpak_version,
        bwrap_supported: flatpak_version.is_none_or(|v| v >= FLATPAK_BWRAP_COMPATIBLE_VERSION),
    })
}

/// Reads the Flatpak version from the instance info file.
///
/// Returns `Ok(None)` when the file does not exist, i.e. outside Flatpak.
///
/// # Errors
///
/// Returns error if the file cannot be read or lacks `[Instance] flatpak-version`.
pub fn running_flatpak_version(info_path: &Path) -> Result<Option<(u32, u32, u32)>, SystemError> {
    let content = match fs::read_to_string(info_path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SystemError::ReadFailed {
                context: format!("reading {}", info_path.display()),
                source: e,
            });
        }
    };

    let raw = instance_value(&content, "flatpak-version").ok_or_else(|| SystemError::FlatpakInfo {
        reason: "missing [Instance] flatpak-version".to_string(),
    })?;

    parse_version(raw).map(Some)
}

/// Looks up a key in the `[Instance]` section of an INI-style file.
fn instance_value<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    let mut in_instance = false;
    for line in content.lines().map(str::trim) {
        if line.starts_with('[') {
            in_instance = line == "[Instance]";
            continue;
        }
        if !in_instance {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            if k.trim() == key {
                return Some(v.trim());
            }
        }
    }
    None
}

/// Parses "1.12.1" (suffixes such as "-pre" are dropped) into a tuple.
fn parse_version(raw: &str) -> Result<(u32, u32, u32), SystemError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let parts = cleaned
        .split('.')
        .map(|part| part.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| SystemError::FlatpakInfo {
            reason: format!("unparseable flatpak-version '{raw}'"),
        })?;

    match parts.as_slice() {
        [major] => Ok((*major, 0, 0)),
        [major, minor] => Ok((*major, *minor, 0)),
        [major, minor, patch, ..] => Ok((*major, *minor, *patch)),
        [] => Err(SystemError::FlatpakInfo {
            reason: format!("empty flatpak-version '{raw}'"),
        }),
    }
}
