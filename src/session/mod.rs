//! Session management.
//!
//! A session spans one top-level `winecell run` and every Wine binary started
//! from it. It owns a private directory under the temp root, the environment
//! handed to its commands and, optionally, a background wineserver kept alive
//! until the session ends.
//!
//! # Storage Layout
//!
//! ```text
//! $TMPDIR/
//! └── winecell-keepalive-{session-id}/
//!     ├── keepalive   # present while the background wineserver should live
//!     └── restart     # asks the idle loop to step aside for `wineserver -w`
//! ```
//!
//! # Example
//!
//! ```no_run
//! use winecell::sandbox::SessionConfig;
//! use winecell::session::{EnvironmentSnapshot, SessionOrchestrator};
//!
//! let env = EnvironmentSnapshot::capture();
//! let config = SessionConfig::from_env(&env).unwrap().with_background_helper(true);
//!
//! let session = SessionOrchestrator::new(config).start_session(&env).unwrap();
//! println!("Session ID: {}", session.id());
//!
//! // Dropping the session stops the helper and removes its directory
//! drop(session);
//! ```

mod environment;
mod keepalive;
mod lifecycle;
mod storage;

pub use environment::{
    Decision, EnvironmentPropagator, EnvironmentSnapshot, SYNC_VARIABLES, SyncVariable,
    ValueSource,
};
pub use keepalive::{GUARD_POLL_INTERVAL, KeepaliveConfig, KeepaliveManager, KeepaliveState};
pub use lifecycle::{Session, SessionOrchestrator};
pub use storage::{
    KEEPALIVE_MARKER, RESTART_MARKER, SESSION_DIR_PREFIX, SessionPaths, remove_marker,
    touch_marker,
};
