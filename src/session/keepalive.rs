//! Background wineserver keepalive.
//!
//! Starting a wineserver inside the Steam Runtime is slow, and every Wine
//! binary started while none is running pays for it. For the duration of a
//! session a helper (`wine cmd.exe /c winecell-keepalive.bat`) idles in the
//! prefix, keeping the wineserver alive.
//!
//! # Protocol
//!
//! The helper and the controller share two marker files in the session
//! directory:
//!
//! - `keepalive`: created at start. The idle loop ends for good once it is gone.
//! - `restart`: created when something runs `wineserver -w`, which blocks until
//!   every Wine process of the prefix has exited, including the helper. The
//!   idle loop deletes it and ends its current iteration.
//!
//! After an iteration ends while `keepalive` still exists, the outer loop in
//! this process waits until no `wineserver -w` for the prefix is left and
//! starts a fresh iteration. The outer loop runs on its own thread and is
//! stopped through a channel.
//!
//! ```text
//! Starting --spawn--> Running --iteration ends--> PausedForWait
//!                        ^                              |
//!                        +---- no blocked waiters ------+
//! any state --keepalive removed / stop--> Stopped
//! ```

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, trace, warn};

use super::EnvironmentSnapshot;
use super::storage::{SessionPaths, remove_marker, touch_marker};
use crate::error::KeepaliveError;
use crate::sandbox::{ProxyBinDir, windows_path};
use crate::system::{HelperProcessLocator, PeerEnvironmentReader};

/// Interval of the liveness guard polling for blocked `wineserver -w` calls.
pub const GUARD_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Observable state of the keepalive helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveState {
    /// Markers created, no iteration spawned yet.
    Starting,
    /// An idle loop iteration is running.
    Running,
    /// The last iteration ended; waiting for blocked waiters before respawning.
    PausedForWait,
    /// The helper is gone for good.
    Stopped,
}

/// How the idle loop is spawned and supervised.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Program running one idle loop iteration.
    pub program: PathBuf,
    /// Its arguments.
    pub args: Vec<OsString>,
    /// Its environment.
    pub environment: EnvironmentSnapshot,
    /// Prefix whose blocked waiters hold back a respawn. No guard if unset.
    pub prefix: Option<PathBuf>,
    /// Liveness guard poll interval.
    pub guard_interval: Duration,
    /// How often the outer loop checks the child and the stop channel.
    pub tick: Duration,
    /// How long the child may take to exit once stopped.
    pub grace_period: Duration,
    /// Delay before respawning after an iteration failed.
    pub respawn_delay: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("wine"),
            args: Vec::new(),
            environment: EnvironmentSnapshot::default(),
            prefix: None,
            guard_interval: GUARD_POLL_INTERVAL,
            tick: Duration::from_millis(50),
            grace_period: Duration::from_secs(3),
            respawn_delay: Duration::from_secs(1),
        }
    }
}

impl KeepaliveConfig {
    /// Creates a configuration running `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Runs the keepalive batch script through the proxied `wine`.
    #[must_use]
    pub fn for_proxy_dir(proxy: &ProxyBinDir) -> Self {
        Self::new(proxy.binary("wine")).with_args([
            OsString::from("cmd.exe"),
            OsString::from("/c"),
            OsString::from(windows_path(&proxy.keepalive_script())),
        ])
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the environment.
    #[must_use]
    pub fn with_environment(mut self, environment: EnvironmentSnapshot) -> Self {
        self.environment = environment;
        self
    }

    /// Sets the prefix watched by the liveness guard.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Sets the liveness guard poll interval.
    #[must_use]
    pub fn with_guard_interval(mut self, interval: Duration) -> Self {
        self.guard_interval = interval;
        self
    }

    /// Sets the outer loop tick.
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Sets the stop grace period.
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Sets the delay before respawning a failed iteration.
    #[must_use]
    pub fn with_respawn_delay(mut self, delay: Duration) -> Self {
        self.respawn_delay = delay;
        self
    }
}

/// Owns the keepalive helper of one session.
///
/// Dropping the manager stops the helper.
pub struct KeepaliveManager {
    paths: SessionPaths,
    state: Arc<Mutex<KeepaliveState>>,
    spawn_count: Arc<AtomicUsize>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl KeepaliveManager {
    /// Creates the session directory and `keepalive` marker and starts the
    /// outer loop.
    ///
    /// # Errors
    ///
    /// Returns `KeepaliveError` if the directory, the marker or the loop
    /// thread cannot be created. Failing to spawn the helper itself is
    /// retried by the loop.
    #[instrument(skip(config, reader), fields(root = %paths.root.display()))]
    pub fn start(
        paths: SessionPaths,
        config: KeepaliveConfig,
        reader: Arc<dyn PeerEnvironmentReader>,
    ) -> Result<Self, KeepaliveError> {
        paths.create_directories()?;
        touch_marker(&paths.keepalive)?;

        let state = Arc::new(Mutex::new(KeepaliveState::Starting));
        let spawn_count = Arc::new(AtomicUsize::new(0));
        let (stop_tx, stop_rx) = mpsc::channel();

        let outer = OuterLoop {
            paths: paths.clone(),
            config,
            reader,
            state: Arc::clone(&state),
            spawn_count: Arc::clone(&spawn_count),
            stop: stop_rx,
        };
        let handle = thread::Builder::new()
            .name("winecell-keepalive".to_string())
            .spawn(move || outer.run_outer_loop())
            .map_err(KeepaliveError::Thread)?;

        info!("Background wineserver keepalive started");
        Ok(Self {
            paths,
            state,
            spawn_count,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Asks the current idle loop iteration to end so a `wineserver -w` can
    /// complete.
    ///
    /// Does nothing once the helper is stopping.
    ///
    /// # Errors
    ///
    /// Returns `KeepaliveError::Marker` if the marker cannot be written.
    pub fn request_restart(&self) -> Result<(), KeepaliveError> {
        if !self.paths.keepalive_exists() {
            debug!("Keepalive already stopped, ignoring restart request");
            return Ok(());
        }
        touch_marker(&self.paths.restart)
    }

    /// Stops the helper and waits for the outer loop to finish.
    ///
    /// Idempotent. The session directory itself is left in place.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        remove_marker(&self.paths.keepalive);
        if let Some(tx) = self.stop_tx.take() {
            // The loop may already have exited on its own
            let _ = tx.send(());
        }
        if handle.join().is_err() {
            warn!("Keepalive loop panicked");
        }
        remove_marker(&self.paths.restart);
        set_state(&self.state, KeepaliveState::Stopped);
        info!(spawns = self.spawn_count(), "Background wineserver keepalive stopped");
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> KeepaliveState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of idle loop iterations spawned so far.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// Paths of the session directory.
    #[must_use]
    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }
}

impl Drop for KeepaliveManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for KeepaliveManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepaliveManager")
            .field("root", &self.paths.root)
            .field("state", &self.state())
            .field("spawn_count", &self.spawn_count())
            .finish()
    }
}

fn set_state(state: &Mutex<KeepaliveState>, next: KeepaliveState) {
    let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
    if *current != next {
        trace!(from = ?*current, to = ?next, "Keepalive state change");
        *current = next;
    }
}

enum ChildOutcome {
    Exited(ExitStatus),
    StopRequested,
}

struct OuterLoop {
    paths: SessionPaths,
    config: KeepaliveConfig,
    reader: Arc<dyn PeerEnvironmentReader>,
    state: Arc<Mutex<KeepaliveState>>,
    spawn_count: Arc<AtomicUsize>,
    stop: Receiver<()>,
}

impl OuterLoop {
    fn run_outer_loop(self) {
        loop {
            if self.stop_requested() || !self.paths.keepalive_exists() {
                break;
            }

            let mut child = match self.spawn_iteration() {
                Ok(child) => child,
                Err(e) => {
                    warn!(program = %self.config.program.display(), error = %e, "Failed to start keepalive helper");
                    if self.sleep(self.config.respawn_delay) {
                        break;
                    }
                    continue;
                }
            };
            self.spawn_count.fetch_add(1, Ordering::SeqCst);
            set_state(&self.state, KeepaliveState::Running);

            let status = match self.wait_child(&mut child) {
                ChildOutcome::StopRequested => {
                    self.terminate(child);
                    break;
                }
                ChildOutcome::Exited(status) => status,
            };

            if !self.paths.keepalive_exists() {
                debug!("Keepalive marker removed, idle loop finished");
                break;
            }

            set_state(&self.state, KeepaliveState::PausedForWait);
            // A crashed iteration may leave the marker behind
            remove_marker(&self.paths.restart);

            if !status.success() {
                warn!(status = %status, "Keepalive helper exited unexpectedly, restarting");
                if self.sleep(self.config.respawn_delay) {
                    break;
                }
            }

            if self.wait_for_blocked_waiters() {
                break;
            }
            debug!("Resuming keepalive");
        }

        set_state(&self.state, KeepaliveState::Stopped);
    }

    fn spawn_iteration(&self) -> std::io::Result<Child> {
        trace!("Spawning idle loop iteration");
        Command::new(&self.config.program)
            .args(&self.config.args)
            .env_clear()
            .envs(self.config.environment.as_os_pairs())
            .current_dir(&self.paths.root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
    }

    fn wait_child(&self, child: &mut Child) -> ChildOutcome {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return ChildOutcome::Exited(status),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to poll keepalive helper");
                    return ChildOutcome::StopRequested;
                }
            }
            if self.sleep(self.config.tick) {
                return ChildOutcome::StopRequested;
            }
        }
    }

    /// Gives the child the grace period to notice the missing marker, then kills it.
    fn terminate(&self, mut child: Child) {
        let deadline = Instant::now() + self.config.grace_period;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            thread::sleep(self.config.tick);
        }
        warn!(pid = child.id(), "Keepalive helper did not exit, killing it");
        let _ = child.kill();
        let _ = child.wait();
    }

    /// Liveness guard. Returns true if stopped while waiting.
    fn wait_for_blocked_waiters(&self) -> bool {
        let Some(prefix) = &self.config.prefix else {
            return false;
        };
        let locator = HelperProcessLocator::new(self.reader.as_ref());
        loop {
            let waiters = locator.blocked_waiters(prefix);
            if waiters.is_empty() {
                return false;
            }
            trace!(?waiters, "Waiting for blocked wineserver -w calls");
            if self.sleep(self.config.guard_interval) {
                return true;
            }
        }
    }

    /// Sleeps up to `duration`. Returns true if a stop was requested.
    fn sleep(&self, duration: Duration) -> bool {
        match self.stop.recv_timeout(duration) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    fn stop_requested(&self) -> bool {
        matches!(
            self.stop.try_recv(),
            Ok(()) | Err(mpsc::TryRecvError::Disconnected)
        )
    }
}
