//! Session configuration and the top-level driver

use crate::error::{RelayError, Result};
use crate::grab::GrabHandle;
use crate::liveness::LivenessStrategy;
use crate::pidfile::PidFile;
use crate::relay::{EventRelay, RelayConfig};
use crate::shutdown::{SessionReport, ShutdownCoordinator, ShutdownFlag};
use rustix::fd::AsFd;
use std::path::PathBuf;

/// Everything one relay session needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// evdev node to grab, e.g. `/dev/input/event1`
    pub device: PathBuf,
    /// Optional pid marker, written after the grab and removed on exit
    pub pidfile: Option<PathBuf>,
    pub liveness: LivenessStrategy,
    pub relay: RelayConfig,
}

impl SessionConfig {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            pidfile: None,
            liveness: LivenessStrategy::None,
            relay: RelayConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.as_os_str().is_empty() {
            return Err(RelayError::InvalidConfig("device path is empty".to_string()));
        }
        self.relay.validate()
    }
}

/// Grab the configured device and relay it to `sink` until the session ends.
///
/// Open and grab failures return before anything needs undoing. From the
/// moment the grab succeeds every exit path, including errors, goes through
/// [`ShutdownCoordinator`].
pub fn run_session<O: AsFd>(
    config: &SessionConfig,
    sink: &O,
    shutdown: &ShutdownFlag,
) -> Result<SessionReport> {
    config.validate()?;

    let mut device = GrabHandle::open(&config.device)?;
    device.acquire()?;

    let pidfile = config.pidfile.as_ref().and_then(|path| match PidFile::create(path) {
        Ok(pidfile) => Some(pidfile),
        Err(e) => {
            tracing::warn!("{}", e);
            None
        }
    });

    tracing::info!(
        device = %config.device.display(),
        liveness = config.liveness.name(),
        record_size = config.relay.record_size,
        poll_ms = config.relay.poll_interval.as_millis() as u64,
        "relaying events"
    );

    let relay = EventRelay::new(config.relay.clone(), config.liveness.clone());
    ShutdownCoordinator::new(device, pidfile).run(relay, sink, shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new("/dev/input/event1");
        assert_eq!(config.liveness, LivenessStrategy::None);
        assert!(config.pidfile.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_device_rejected() {
        let config = SessionConfig::new("");
        assert!(matches!(config.validate(), Err(RelayError::InvalidConfig(_))));
    }

    #[test]
    fn test_open_failure_leaves_no_pidfile() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_path = dir.path().join("grab.pid");
        let mut config = SessionConfig::new(dir.path().join("event-missing"));
        config.pidfile = Some(pid_path.clone());

        let (_rx, tx) = rustix::pipe::pipe().unwrap();
        let err = run_session(&config, &tx, &ShutdownFlag::new()).err().unwrap();

        assert!(matches!(err, RelayError::Open { .. }));
        assert!(!pid_path.exists());
    }

    #[test]
    fn test_grab_failure_leaves_no_pidfile() {
        let dir = tempfile::TempDir::new().unwrap();
        let device = dir.path().join("not-an-evdev");
        std::fs::write(&device, b"").unwrap();
        let pid_path = dir.path().join("grab.pid");
        let mut config = SessionConfig::new(&device);
        config.pidfile = Some(pid_path.clone());

        let (_rx, tx) = rustix::pipe::pipe().unwrap();
        let err = run_session(&config, &tx, &ShutdownFlag::new()).err().unwrap();

        assert!(matches!(err, RelayError::Grab { .. }));
        assert!(!pid_path.exists());
    }
}
