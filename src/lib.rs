//! winecell - Steam Runtime session coordinator for Wine prefixes.
//!
//! Runs tools such as winetricks against a Proton prefix while routing every
//! Wine binary they start through the Steam Linux Runtime container, sharing
//! settings with a game already running in the same prefix and keeping one
//! background wineserver alive for the whole session.
//!
//! # Platform Requirements
//!
//! - Linux with procfs mounted at `/proc`
//! - A Proton installation and, for `bwrap` mode, the Steam Linux Runtime
//! - Flatpak 1.12.1+ when running inside a Flatpak sandbox in `bwrap` mode
//!
//! # Example
//!
//! ```no_run
//! use winecell::sandbox::SessionConfig;
//! use winecell::session::{EnvironmentSnapshot, SessionOrchestrator};
//! use winecell::system;
//!
//! fn main() -> miette::Result<()> {
//!     let env = EnvironmentSnapshot::capture();
//!     let config = SessionConfig::from_env(&env)?;
//!
//!     let orchestrator =
//!         SessionOrchestrator::new(config).with_host_requirements(system::check_all()?);
//!
//!     let code = orchestrator.run(&env, "winecfg".as_ref(), &[], None)?;
//!     std::process::exit(code);
//! }
//! ```

pub mod error;
pub mod sandbox;
pub mod session;
pub mod system;

// Re-export commonly used types
pub use error::{Error, INFRASTRUCTURE_EXIT_CODE, Result};
pub use sandbox::{LaunchPlan, MountSetResolver, SandboxLauncher, SandboxMode, SessionConfig};
pub use session::{EnvironmentSnapshot, KeepaliveManager, Session, SessionOrchestrator};
