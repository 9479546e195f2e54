//! Termination signal handling.
//!
//! Handlers only record the signal number in an atomic; the main loop polls it
//! and runs session teardown outside of signal context.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicI32, Ordering};

use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

use crate::error::SystemError;

/// Signals that trigger session teardown.
pub const TEARDOWN_SIGNALS: &[Signal] = &[
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGABRT,
];

/// Last teardown signal received, 0 if none.
static RECEIVED: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signal: libc::c_int) {
    RECEIVED.store(signal, Ordering::SeqCst);
}

/// Handle to the installed teardown signal handlers.
#[derive(Debug)]
pub struct ShutdownSignals {
    _installed: (),
}

impl ShutdownSignals {
    /// Installs handlers for [`TEARDOWN_SIGNALS`].
    ///
    /// Must be called before any worker threads are spawned.
    ///
    /// # Errors
    ///
    /// Returns `SystemError::SignalInstall` if `sigaction` fails.
    pub fn install() -> Result<Self, SystemError> {
        let action = SigAction::new(
            SigHandler::Handler(record_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in TEARDOWN_SIGNALS {
            // SAFETY: the handler only performs an atomic store.
            unsafe { signal::sigaction(*sig, &action) }.map_err(|e| {
                SystemError::SignalInstall {
                    signal: sig.as_str().to_string(),
                    reason: e.to_string(),
                }
            })?;
        }

        debug!("Teardown signal handlers installed");
        Ok(Self { _installed: () })
    }

    /// The signal received since installation, if any.
    #[must_use]
    pub fn received(&self) -> Option<Signal> {
        match RECEIVED.load(Ordering::SeqCst) {
            0 => None,
            raw => Signal::try_from(raw).ok(),
        }
    }

    /// Returns true once a teardown signal has been received.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.received().is_some()
    }

    /// Forgets a received signal.
    pub fn reset(&self) {
        RECEIVED.store(0, Ordering::SeqCst);
    }
}
