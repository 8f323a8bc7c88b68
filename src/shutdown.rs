//! Shutdown coordination
//!
//! Every way the relay can end funnels into [`ShutdownCoordinator::finish`],
//! which releases the grab, closes the device and removes the pid file
//! exactly once. Signal handlers never touch the device; they only set a
//! [`ShutdownFlag`] that the relay loop checks on every wake-up.

use crate::error::{RelayError, Result};
use crate::grab::ExclusiveSource;
use crate::pidfile::PidFile;
use crate::relay::{EventRelay, ExitReason, RelayStats};
use rustix::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Single-word "shutdown requested" flag shared with the signal handler
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark shutdown as requested
    #[inline]
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Route SIGINT, SIGTERM and SIGHUP to this flag.
    ///
    /// Can be installed once per process.
    pub fn install_handlers(&self) -> Result<()> {
        let flag = self.clone();
        ctrlc::set_handler(move || flag.request())
            .map_err(|e| RelayError::SignalHandler(e.to_string()))
    }
}

/// Make writes to a closed pipe fail with `EPIPE` instead of killing the process.
pub fn ignore_broken_pipe() -> Result<()> {
    // SAFETY: SIG_IGN installs no handler code.
    let previous = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    if previous == libc::SIG_ERR {
        return Err(RelayError::SignalHandler(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

/// How a completed session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub reason: ExitReason,
    pub stats: RelayStats,
}

/// Owns everything that must be undone when the relay stops
pub struct ShutdownCoordinator<D: ExclusiveSource> {
    device: Option<D>,
    pidfile: Option<PidFile>,
}

impl<D: ExclusiveSource> ShutdownCoordinator<D> {
    pub fn new(device: D, pidfile: Option<PidFile>) -> Self {
        Self {
            device: Some(device),
            pidfile,
        }
    }

    /// The device, until cleanup has run
    pub fn device(&self) -> Option<&D> {
        self.device.as_ref()
    }

    /// Whether the cleanup sequence has already run
    pub fn is_finished(&self) -> bool {
        self.device.is_none()
    }

    /// Run the relay against the owned device, then clean up.
    pub fn run<O: AsFd>(
        mut self,
        mut relay: EventRelay,
        sink: &O,
        shutdown: &ShutdownFlag,
    ) -> Result<SessionReport> {
        let result = match self.device.as_ref() {
            Some(device) => relay.run(device, sink, shutdown),
            None => Err(RelayError::AlreadyTerminated),
        };
        let stats = relay.stats();

        match &result {
            Ok(reason) => tracing::info!(
                records = stats.records,
                bytes = stats.bytes,
                "shutting down: {}",
                reason
            ),
            Err(_) => tracing::info!(
                records = stats.records,
                bytes = stats.bytes,
                "shutting down after error"
            ),
        }

        self.finish();
        relay.terminate();
        result.map(|reason| SessionReport { reason, stats })
    }

    /// Release the grab, close the device and remove the pid file.
    ///
    /// Runs its steps at most once no matter how often it is called.
    pub fn finish(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.release();
            drop(device);
        }
        if let Some(mut pidfile) = self.pidfile.take() {
            pidfile.remove();
        }
    }
}

impl<D: ExclusiveSource> Drop for ShutdownCoordinator<D> {
    fn drop(&mut self) {
        self.finish();
    }
}
