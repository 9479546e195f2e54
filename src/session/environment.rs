//! Environment snapshots and synchronization-variable propagation.
//!
//! Wine processes sharing a prefix must agree on the synchronization
//! primitives (esync/fsync) used by the wineserver they talk to. When another
//! session already runs a wineserver for the same prefix, its values are copied
//! so our processes can connect to it. Otherwise the session defaults apply.
//!
//! Precedence, highest first:
//! 1. values set explicitly by the user
//! 2. values inherited from a peer wineserver
//! 3. enable-by-default, unless the matching `PROTON_NO_*` opt-out is set

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};

use tracing::{debug, trace, warn};

use crate::system::HelperProcessHandle;

/// A captured set of environment variables.
///
/// Snapshots are immutable; the `with_*` methods return modified copies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvironmentSnapshot {
    /// Captures the environment of the current process.
    ///
    /// See [`Self::from_os_pairs`] for variables that are not valid UTF-8.
    #[must_use]
    pub fn capture() -> Self {
        Self::from_os_pairs(std::env::vars_os())
    }

    /// Builds a snapshot from OS strings.
    ///
    /// Children are spawned with exactly the snapshot's variables, so a
    /// variable whose name or value is not valid UTF-8 does not reach them.
    /// Each one dropped is logged.
    #[must_use]
    pub fn from_os_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        Self::from_pairs(pairs.into_iter().filter_map(|(name, value)| {
            match (name.into_string(), value.into_string()) {
                (Ok(name), Ok(value)) => Some((name, value)),
                (Ok(name), Err(_)) => {
                    warn!(name = %name, "Dropping environment variable that is not valid UTF-8");
                    None
                }
                (Err(raw), _) => {
                    warn!(name = %raw.to_string_lossy(), "Dropping environment variable that is not valid UTF-8");
                    None
                }
            }
        }))
    }

    /// Builds a snapshot from name/value pairs. Later duplicates win.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Parses a NUL-separated environment block as found in `/proc/<pid>/environ`.
    ///
    /// Entries without `=` are ignored.
    #[must_use]
    pub fn from_environ_block(block: &[u8]) -> Self {
        let pairs = block
            .split(|b| *b == 0)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                let entry = String::from_utf8_lossy(entry);
                let (key, value) = entry.split_once('=')?;
                Some((key.to_string(), value.to_string()))
            });
        Self::from_pairs(pairs)
    }

    /// Returns the value of a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Returns the value of a variable, treating an empty value as unset.
    #[must_use]
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    /// Returns true if the variable is set, even to an empty value.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Returns a copy with the variable set.
    #[must_use]
    pub fn with_var(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut vars = self.vars.clone();
        vars.insert(name.into(), value.into());
        Self { vars }
    }

    /// Returns a copy with all given variables set.
    #[must_use]
    pub fn with_vars<I, K, V>(&self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut vars = self.vars.clone();
        vars.extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self { vars }
    }

    /// Returns a copy with the variable removed.
    #[must_use]
    pub fn without_var(&self, name: &str) -> Self {
        let mut vars = self.vars.clone();
        vars.remove(name);
        Self { vars }
    }

    /// Iterates over the variables in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of variables in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns true if the snapshot holds no variables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Pairs suitable for `Command::envs`.
    pub fn as_os_pairs(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars
            .iter()
            .map(|(k, v)| (OsStr::new(k.as_str()), OsStr::new(v.as_str())))
    }
}

/// A synchronization variable and its opt-out switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncVariable {
    /// Variable read by Wine.
    pub name: &'static str,
    /// Variable that disables the enable-by-default behavior.
    pub opt_out: &'static str,
}

impl SyncVariable {
    /// Returns true if `env` sets the opt-out. Like Proton, an empty value
    /// or `0` leaves the default enabled.
    #[must_use]
    pub fn opted_out(&self, env: &EnvironmentSnapshot) -> bool {
        env.get_non_empty(self.opt_out).is_some_and(|value| value != "0")
    }
}

/// Allow-list of variables copied from a peer wineserver.
pub const SYNC_VARIABLES: &[SyncVariable] = &[
    SyncVariable {
        name: "WINEESYNC",
        opt_out: "PROTON_NO_ESYNC",
    },
    SyncVariable {
        name: "WINEFSYNC",
        opt_out: "PROTON_NO_FSYNC",
    },
];

/// Where a propagated value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// Set by the user before the session started; left untouched.
    User,
    /// Copied from the peer wineserver.
    Peer,
    /// The peer runs without this variable; left unset to match it.
    PeerUnset,
    /// Session default applied.
    Default,
    /// Default suppressed by the opt-out variable.
    OptedOut,
}

/// Outcome for a single allow-listed variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Variable name.
    pub name: &'static str,
    /// Value to export, if any.
    pub value: Option<String>,
    /// Why this value was chosen.
    pub source: ValueSource,
}

/// Merges synchronization variables from the user, a peer and the defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentPropagator;

impl EnvironmentPropagator {
    /// Creates a propagator over [`SYNC_VARIABLES`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Decides the value of every allow-listed variable.
    ///
    /// Only the peer's captured snapshot is consulted, so all inherited values
    /// come from the same process.
    #[must_use]
    pub fn decide(
        &self,
        user: &EnvironmentSnapshot,
        peer: Option<&HelperProcessHandle>,
    ) -> Vec<Decision> {
        SYNC_VARIABLES
            .iter()
            .map(|var| {
                if let Some(value) = user.get(var.name) {
                    return Decision {
                        name: var.name,
                        value: Some(value.to_string()),
                        source: ValueSource::User,
                    };
                }

                if let Some(peer) = peer {
                    return match peer.environment.get(var.name) {
                        Some(value) => Decision {
                            name: var.name,
                            value: Some(value.to_string()),
                            source: ValueSource::Peer,
                        },
                        None => Decision {
                            name: var.name,
                            value: None,
                            source: ValueSource::PeerUnset,
                        },
                    };
                }

                if var.opted_out(user) {
                    Decision {
                        name: var.name,
                        value: None,
                        source: ValueSource::OptedOut,
                    }
                } else {
                    Decision {
                        name: var.name,
                        value: Some("1".to_string()),
                        source: ValueSource::Default,
                    }
                }
            })
            .collect()
    }

    /// Returns `user` with the propagated values applied.
    #[must_use]
    pub fn apply(
        &self,
        user: &EnvironmentSnapshot,
        peer: Option<&HelperProcessHandle>,
    ) -> EnvironmentSnapshot {
        if let Some(peer) = peer {
            debug!(pid = peer.pid, "Inheriting synchronization settings from running wineserver");
        } else {
            debug!("No running wineserver found, applying synchronization defaults");
        }

        let decisions = self.decide(user, peer);
        let mut result = user.clone();
        for decision in decisions {
            trace!(name = decision.name, value = ?decision.value, source = ?decision.source, "Propagated variable");
            if let Some(value) = decision.value {
                result = result.with_var(decision.name, value);
            }
        }
        result
    }
}
