//! Event relay loop
//!
//! Waits on the grabbed device with a bounded timeout, forwards each raw
//! `input_event` record to the output untouched, and stops on the first
//! terminating condition:
//!
//! - device end-of-stream or read failure
//! - liveness verdict `Stale` (heartbeat expired, or consumer hang-up)
//! - output write failure
//! - shutdown flag set by a termination signal
//!
//! The output is switched to non-blocking mode for the duration of the run,
//! so a consumer that stays connected but stops reading cannot hold the loop
//! inside `write`. The original file status flags are restored on return.
//!
//! # Records
//!
//! A record is one kernel `struct input_event`: 16 bytes on 32-bit targets,
//! 24 bytes on 64-bit ones. Records are never parsed, merged or split.

use crate::error::{RelayError, Result};
use crate::liveness::{LivenessMonitor, LivenessStrategy, StaleCause, Verdict, DEFAULT_POLL_INTERVAL};
use crate::shutdown::ShutdownFlag;
use rustix::event::{poll, PollFd, PollFlags};
use rustix::fd::AsFd;
use rustix::fs::{fcntl_getfl, fcntl_setfl, OFlags};
use rustix::io::{read, write, Errno};
use std::fmt;
use std::io;
use std::time::{Duration, Instant, SystemTime};

/// `struct input_event` size with a 32-bit `timeval`
pub const RECORD_SIZE_32: usize = 16;

/// `struct input_event` size with a 64-bit `timeval`
pub const RECORD_SIZE_64: usize = 24;

/// `struct input_event` size on the target this was built for
pub const NATIVE_RECORD_SIZE: usize = std::mem::size_of::<libc::input_event>();

/// Largest supported record, sizes the read buffer
const MAX_RECORD_SIZE: usize = RECORD_SIZE_64;

/// Relay loop state.
///
/// `Running -> Terminated` on EOF, error, stale verdict or write failure.
/// A shutdown request moves the loop to `Draining`, where it performs no
/// further I/O; [`EventRelay::terminate`] completes it once cleanup has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Draining,
    Terminated,
}

/// Designed, non-error ways for the relay to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Device returned end-of-file
    EndOfStream,
    /// Liveness strategy judged the consumer gone
    Stale(StaleCause),
    /// Output pipe has no reader left
    BrokenPipe,
    /// Termination signal received
    ShutdownSignal,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::EndOfStream => write!(f, "device reached end of stream"),
            ExitReason::Stale(StaleCause::Expired { age }) => {
                write!(f, "heartbeat stale ({:.1}s old)", age.as_secs_f64())
            }
            ExitReason::Stale(StaleCause::Missing) => write!(f, "heartbeat file missing"),
            ExitReason::Stale(StaleCause::Unreadable) => write!(f, "heartbeat file unreadable"),
            ExitReason::Stale(StaleCause::ConsumerClosed) | ExitReason::BrokenPipe => {
                write!(f, "output closed")
            }
            ExitReason::ShutdownSignal => write!(f, "received termination signal"),
        }
    }
}

/// Counters for what the relay forwarded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub records: u64,
    pub bytes: u64,
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Size of one record in bytes
    pub record_size: usize,
    /// Upper bound on any single wait
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            record_size: NATIVE_RECORD_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.record_size != RECORD_SIZE_32 && self.record_size != RECORD_SIZE_64 {
            return Err(RelayError::InvalidConfig(format!(
                "record size must be {} or {} bytes, got {}",
                RECORD_SIZE_32, RECORD_SIZE_64, self.record_size
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(RelayError::InvalidConfig(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Poll timeout in milliseconds, at least 1
    fn timeout_ms(&self) -> i32 {
        i32::try_from(self.poll_interval.as_millis())
            .unwrap_or(i32::MAX)
            .max(1)
    }
}

/// Result of one multiplexed wait
struct Wakeup {
    timed_out: bool,
    device: PollFlags,
    sink: PollFlags,
}

/// Single-threaded read/forward loop
pub struct EventRelay {
    config: RelayConfig,
    monitor: LivenessMonitor,
    state: LoopState,
    stats: RelayStats,
}

impl EventRelay {
    pub fn new(config: RelayConfig, strategy: LivenessStrategy) -> Self {
        let monitor = LivenessMonitor::new(strategy, config.poll_interval);
        Self {
            config,
            monitor,
            state: LoopState::Running,
            stats: RelayStats::default(),
        }
    }

    #[inline]
    pub fn state(&self) -> LoopState {
        self.state
    }

    #[inline]
    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    #[inline]
    pub fn strategy(&self) -> &LivenessStrategy {
        self.monitor.strategy()
    }

    /// Relay records from `source` to `sink` until something terminates the loop.
    ///
    /// The loop runs once. After a shutdown request the relay is left
    /// `Draining`, otherwise `Terminated`; either way a second call returns
    /// [`RelayError::AlreadyTerminated`].
    pub fn run<S: AsFd, O: AsFd>(
        &mut self,
        source: &S,
        sink: &O,
        shutdown: &ShutdownFlag,
    ) -> Result<ExitReason> {
        if self.state != LoopState::Running {
            return Err(RelayError::AlreadyTerminated);
        }
        let result = self.config.validate().and_then(|()| {
            let flags = set_nonblocking(sink)?;
            let result = self.relay_loop(source, sink, shutdown);
            if let Err(e) = fcntl_setfl(sink, flags) {
                tracing::warn!(error = %e, "failed to restore output flags");
            }
            result
        });
        if self.state == LoopState::Running {
            self.state = LoopState::Terminated;
        }
        result
    }

    /// Move a draining relay to `Terminated`. No-op in any other state.
    pub fn terminate(&mut self) {
        if self.state == LoopState::Draining {
            self.state = LoopState::Terminated;
            tracing::debug!("relay terminated");
        }
    }

    fn drain(&mut self) -> ExitReason {
        self.state = LoopState::Draining;
        tracing::debug!("draining after shutdown request");
        ExitReason::ShutdownSignal
    }

    fn relay_loop<S: AsFd, O: AsFd>(
        &mut self,
        source: &S,
        sink: &O,
        shutdown: &ShutdownFlag,
    ) -> Result<ExitReason> {
        let record_size = self.config.record_size;
        let timeout = self.config.timeout_ms();
        let mut buf = [0u8; MAX_RECORD_SIZE];

        loop {
            if shutdown.is_requested() {
                return Ok(self.drain());
            }

            let wakeup = match self.wait(source, sink, timeout)? {
                Some(wakeup) => wakeup,
                // Interrupted wait, re-check the flag
                None => continue,
            };

            if shutdown.is_requested() {
                return Ok(self.drain());
            }

            if let Verdict::Stale(cause) = self.monitor.sink_verdict(wakeup.sink) {
                return Ok(ExitReason::Stale(cause));
            }

            if !wakeup.device.is_empty() {
                let record = &mut buf[..record_size];
                match read_record(source, record)? {
                    ReadOutcome::Record => {
                        if let Some(reason) = self.forward(sink, record, timeout, shutdown)? {
                            return Ok(reason);
                        }
                    }
                    ReadOutcome::EndOfStream => return Ok(ExitReason::EndOfStream),
                    ReadOutcome::Retry => {}
                }
            }

            if let Verdict::Stale(cause) = self.check_liveness(wakeup.timed_out) {
                return Ok(ExitReason::Stale(cause));
            }
        }
    }

    /// Consult the liveness strategy on a timeout, or once an interval is due
    fn check_liveness(&mut self, timed_out: bool) -> Verdict {
        let now = Instant::now();
        if timed_out || self.monitor.is_due(now) {
            self.monitor.check(now, SystemTime::now())
        } else {
            Verdict::Continue
        }
    }

    /// Bounded wait on the device, plus the sink when the strategy watches it.
    ///
    /// Returns `None` when the wait was interrupted by a signal.
    fn wait<S: AsFd, O: AsFd>(&self, source: &S, sink: &O, timeout: i32) -> Result<Option<Wakeup>> {
        // An empty event mask still reports ERR, HUP and NVAL, which is all
        // the sink is watched for.
        let mut fds = [
            PollFd::new(source, PollFlags::IN),
            PollFd::new(sink, PollFlags::empty()),
        ];
        let watched = if self.monitor.strategy().watches_sink() { 2 } else { 1 };

        match poll(&mut fds[..watched], timeout) {
            Ok(ready) => Ok(Some(Wakeup {
                timed_out: ready == 0,
                device: fds[0].revents(),
                sink: fds[1].revents(),
            })),
            Err(Errno::INTR) => Ok(None),
            Err(e) => Err(RelayError::Poll(e.into())),
        }
    }

    /// Write one whole record. Returns a reason when the output is gone.
    ///
    /// While the output is full, each bounded wait for writability is
    /// followed by the same shutdown and liveness checks the main loop makes.
    fn forward<O: AsFd>(
        &mut self,
        sink: &O,
        record: &[u8],
        timeout: i32,
        shutdown: &ShutdownFlag,
    ) -> Result<Option<ExitReason>> {
        let mut written = 0;
        while written < record.len() {
            match write(sink, &record[written..]) {
                Ok(0) => return Err(RelayError::Write(io::ErrorKind::WriteZero.into())),
                Ok(n) => written += n,
                Err(Errno::INTR) => {}
                Err(Errno::AGAIN) => {
                    let pending = wait_writable(sink, timeout)?;
                    if shutdown.is_requested() {
                        return Ok(Some(self.drain()));
                    }
                    if let Verdict::Stale(cause) = self.monitor.sink_verdict(pending.revents) {
                        return Ok(Some(ExitReason::Stale(cause)));
                    }
                    if let Verdict::Stale(cause) = self.check_liveness(pending.timed_out) {
                        return Ok(Some(ExitReason::Stale(cause)));
                    }
                }
                Err(Errno::PIPE) => return Ok(Some(ExitReason::BrokenPipe)),
                Err(e) => return Err(RelayError::Write(e.into())),
            }
        }

        self.stats.records += 1;
        self.stats.bytes += record.len() as u64;
        Ok(None)
    }
}

enum ReadOutcome {
    Record,
    EndOfStream,
    Retry,
}

/// Read exactly one record. A partial record is a device error.
fn read_record<S: AsFd>(source: &S, record: &mut [u8]) -> Result<ReadOutcome> {
    match read(source, record) {
        Ok(0) => Ok(ReadOutcome::EndOfStream),
        Ok(n) if n == record.len() => Ok(ReadOutcome::Record),
        Ok(n) => Err(RelayError::ShortRead {
            expected: record.len(),
            got: n,
        }),
        Err(Errno::INTR) | Err(Errno::AGAIN) => Ok(ReadOutcome::Retry),
        Err(e) => Err(RelayError::DeviceRead(e.into())),
    }
}

/// Result of one bounded wait on a full output
struct PendingWrite {
    timed_out: bool,
    revents: PollFlags,
}

/// An interrupted wait reports nothing ready and no timeout.
fn wait_writable<O: AsFd>(sink: &O, timeout: i32) -> Result<PendingWrite> {
    let mut fds = [PollFd::new(sink, PollFlags::OUT)];
    match poll(&mut fds, timeout) {
        Ok(ready) => Ok(PendingWrite {
            timed_out: ready == 0,
            revents: fds[0].revents(),
        }),
        Err(Errno::INTR) => Ok(PendingWrite {
            timed_out: false,
            revents: PollFlags::empty(),
        }),
        Err(e) => Err(RelayError::Poll(e.into())),
    }
}

/// Add `O_NONBLOCK` to the sink, returning the flags to restore afterwards.
fn set_nonblocking<O: AsFd>(sink: &O) -> Result<OFlags> {
    let flags = fcntl_getfl(sink).map_err(|e| RelayError::Output(e.into()))?;
    fcntl_setfl(sink, flags | OFlags::NONBLOCK).map_err(|e| RelayError::Output(e.into()))?;
    Ok(flags)
}
