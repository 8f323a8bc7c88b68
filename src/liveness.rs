//! Consumer liveness detection
//!
//! The relay is only useful while somebody reads its output. A
//! [`LivenessStrategy`] decides how that is judged: not at all, by the age
//! of a heartbeat file some remote process keeps touching, or by watching
//! the output descriptor for a hang-up.
//!
//! The two file strategies differ only in how a missing or unreadable file
//! is treated:
//!
//! | Strategy       | File missing | File unreadable | File older than threshold |
//! |----------------|--------------|-----------------|---------------------------|
//! | `AliveFile`    | continue     | continue        | stale                     |
//! | `WatchdogFile` | stale        | stale           | stale                     |

use rustix::event::PollFlags;
use rustix::fs::stat;
use rustix::io::Errno;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Heartbeat age after which the consumer is presumed gone
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(10);

/// Upper bound on any single wait in the relay loop
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// How the relay decides its consumer is still there.
///
/// Exactly one strategy is active per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessStrategy {
    /// Never stale. An external supervisor is expected to kill the process.
    None,
    /// Heartbeat file; a missing file means the consumer has not touched it yet.
    AliveFile {
        path: PathBuf,
        staleness_threshold: Duration,
    },
    /// Heartbeat file; a missing file fails closed.
    WatchdogFile {
        path: PathBuf,
        staleness_threshold: Duration,
    },
    /// Hang-up or error reported on the output descriptor
    ConsumerSinkClosed,
}

/// Why the consumer was judged gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleCause {
    /// Heartbeat file older than the threshold
    Expired { age: Duration },
    /// Heartbeat file absent under a fail-closed strategy
    Missing,
    /// Heartbeat file could not be stat'ed for a reason other than absence
    Unreadable,
    /// Output descriptor reported hang-up, error or invalid
    ConsumerClosed,
}

/// Outcome of one liveness evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Stale(StaleCause),
}

impl Verdict {
    #[inline]
    pub fn is_stale(&self) -> bool {
        matches!(self, Verdict::Stale(_))
    }
}

impl LivenessStrategy {
    /// Evaluate the strategy against the wall clock.
    ///
    /// `ConsumerSinkClosed` always continues here; its verdict comes from
    /// the poll result, see [`LivenessMonitor::sink_verdict`].
    pub fn evaluate(&self, now: SystemTime) -> Verdict {
        match self {
            LivenessStrategy::None | LivenessStrategy::ConsumerSinkClosed => Verdict::Continue,
            LivenessStrategy::AliveFile {
                path,
                staleness_threshold,
            } => match heartbeat_age(path, now) {
                Heartbeat::Age(age) => judge_age(age, *staleness_threshold),
                Heartbeat::Missing | Heartbeat::Unreadable => Verdict::Continue,
            },
            LivenessStrategy::WatchdogFile {
                path,
                staleness_threshold,
            } => match heartbeat_age(path, now) {
                Heartbeat::Age(age) => judge_age(age, *staleness_threshold),
                Heartbeat::Missing => Verdict::Stale(StaleCause::Missing),
                Heartbeat::Unreadable => Verdict::Stale(StaleCause::Unreadable),
            },
        }
    }

    /// Whether the output descriptor must join the multiplexed wait
    #[inline]
    pub fn watches_sink(&self) -> bool {
        matches!(self, LivenessStrategy::ConsumerSinkClosed)
    }

    /// Heartbeat file, for the file-based strategies
    pub fn heartbeat_file(&self) -> Option<&Path> {
        match self {
            LivenessStrategy::AliveFile { path, .. } | LivenessStrategy::WatchdogFile { path, .. } => {
                Some(path)
            }
            _ => None,
        }
    }

    /// Short name used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            LivenessStrategy::None => "none",
            LivenessStrategy::AliveFile { .. } => "alive-file",
            LivenessStrategy::WatchdogFile { .. } => "watchdog-file",
            LivenessStrategy::ConsumerSinkClosed => "consumer-closed",
        }
    }
}

fn judge_age(age: Duration, threshold: Duration) -> Verdict {
    if age > threshold {
        Verdict::Stale(StaleCause::Expired { age })
    } else {
        Verdict::Continue
    }
}

enum Heartbeat {
    Age(Duration),
    Missing,
    Unreadable,
}

/// Age of the heartbeat file.
///
/// A modification time in the future counts as age zero.
fn heartbeat_age(path: &Path, now: SystemTime) -> Heartbeat {
    let st = match stat(path) {
        Ok(st) => st,
        Err(Errno::NOENT) => return Heartbeat::Missing,
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "cannot stat heartbeat file");
            return Heartbeat::Unreadable;
        }
    };

    let secs = st.st_mtime as i64;
    let nanos = st.st_mtime_nsec as u32;
    let mtime = UNIX_EPOCH + Duration::new(secs.max(0) as u64, nanos);

    Heartbeat::Age(now.duration_since(mtime).unwrap_or(Duration::ZERO))
}

/// Applies a [`LivenessStrategy`] at most once per polling interval.
///
/// The relay asks [`is_due`](Self::is_due) on every wake-up, so the
/// strategy is consulted on every idle timeout and at least once per
/// interval while the device is busy.
pub struct LivenessMonitor {
    strategy: LivenessStrategy,
    interval: Duration,
    last_check: Option<Instant>,
}

impl LivenessMonitor {
    pub fn new(strategy: LivenessStrategy, interval: Duration) -> Self {
        Self {
            strategy,
            interval,
            last_check: None,
        }
    }

    #[inline]
    pub fn strategy(&self) -> &LivenessStrategy {
        &self.strategy
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a full interval has passed since the last check
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_check {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        }
    }

    /// Evaluate the strategy and record the check time
    pub fn check(&mut self, now: Instant, wall: SystemTime) -> Verdict {
        self.last_check = Some(now);
        let verdict = self.strategy.evaluate(wall);
        tracing::trace!(strategy = self.strategy.name(), ?verdict, "liveness check");
        verdict
    }

    /// Interpret readiness flags reported for the output descriptor
    pub fn sink_verdict(&self, revents: PollFlags) -> Verdict {
        if self.strategy.watches_sink()
            && revents.intersects(PollFlags::ERR | PollFlags::HUP | PollFlags::NVAL)
        {
            Verdict::Stale(StaleCause::ConsumerClosed)
        } else {
            Verdict::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    fn touched(age: Duration) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file()
            .set_modified(SystemTime::now() - age)
            .unwrap();
        file
    }

    fn alive(path: &Path, threshold: Duration) -> LivenessStrategy {
        LivenessStrategy::AliveFile {
            path: path.to_path_buf(),
            staleness_threshold: threshold,
        }
    }

    fn watchdog(path: &Path, threshold: Duration) -> LivenessStrategy {
        LivenessStrategy::WatchdogFile {
            path: path.to_path_buf(),
            staleness_threshold: threshold,
        }
    }

    #[test]
    fn test_missing_file_policies_differ() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("alive");
        let now = SystemTime::now();

        assert_eq!(alive(&missing, Duration::from_secs(5)).evaluate(now), Verdict::Continue);
        assert_eq!(
            watchdog(&missing, Duration::from_secs(5)).evaluate(now),
            Verdict::Stale(StaleCause::Missing)
        );
    }

    #[test]
    fn test_unreadable_file_is_not_reported_missing() {
        // A regular file used as a directory fails with ENOTDIR, not ENOENT
        let parent = NamedTempFile::new().unwrap();
        let unreadable = parent.path().join("alive");
        let now = SystemTime::now();

        assert_eq!(alive(&unreadable, Duration::from_secs(5)).evaluate(now), Verdict::Continue);
        assert_eq!(
            watchdog(&unreadable, Duration::from_secs(5)).evaluate(now),
            Verdict::Stale(StaleCause::Unreadable)
        );
    }

    #[test]
    fn test_fresh_heartbeat_continues() {
        let file = touched(Duration::from_secs(1));
        let now = SystemTime::now();

        assert_eq!(alive(file.path(), Duration::from_secs(5)).evaluate(now), Verdict::Continue);
        assert_eq!(watchdog(file.path(), Duration::from_secs(5)).evaluate(now), Verdict::Continue);
    }

    #[test]
    fn test_old_heartbeat_is_stale() {
        let file = touched(Duration::from_secs(30));
        let now = SystemTime::now();

        for strategy in [
            alive(file.path(), Duration::from_secs(5)),
            watchdog(file.path(), Duration::from_secs(5)),
        ] {
            match strategy.evaluate(now) {
                Verdict::Stale(StaleCause::Expired { age }) => {
                    assert!(age >= Duration::from_secs(29), "age was {:?}", age)
                }
                other => panic!("expected expired heartbeat, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_future_mtime_is_not_stale() {
        let file = NamedTempFile::new().unwrap();
        file.as_file()
            .set_modified(SystemTime::now() + Duration::from_secs(3600))
            .unwrap();

        let verdict = watchdog(file.path(), Duration::ZERO).evaluate(SystemTime::now());
        assert_eq!(verdict, Verdict::Continue);
    }

    #[test]
    fn test_none_and_sink_strategies_never_stale_by_clock() {
        let far_future = SystemTime::now() + Duration::from_secs(1_000_000);
        assert_eq!(LivenessStrategy::None.evaluate(far_future), Verdict::Continue);
        assert_eq!(LivenessStrategy::ConsumerSinkClosed.evaluate(far_future), Verdict::Continue);
    }

    #[test]
    fn test_sink_verdict_only_for_sink_strategy() {
        let watching = LivenessMonitor::new(LivenessStrategy::ConsumerSinkClosed, DEFAULT_POLL_INTERVAL);
        let ignoring = LivenessMonitor::new(LivenessStrategy::None, DEFAULT_POLL_INTERVAL);

        assert_eq!(
            watching.sink_verdict(PollFlags::HUP),
            Verdict::Stale(StaleCause::ConsumerClosed)
        );
        assert_eq!(
            watching.sink_verdict(PollFlags::ERR),
            Verdict::Stale(StaleCause::ConsumerClosed)
        );
        assert_eq!(watching.sink_verdict(PollFlags::OUT), Verdict::Continue);
        assert_eq!(watching.sink_verdict(PollFlags::empty()), Verdict::Continue);
        assert_eq!(ignoring.sink_verdict(PollFlags::HUP), Verdict::Continue);
    }

    #[test]
    fn test_monitor_due_once_per_interval() {
        let interval = Duration::from_millis(500);
        let mut monitor = LivenessMonitor::new(LivenessStrategy::None, interval);
        let start = Instant::now();

        assert!(monitor.is_due(start));
        assert_eq!(monitor.check(start, SystemTime::now()), Verdict::Continue);
        assert!(!monitor.is_due(start + Duration::from_millis(100)));
        assert!(monitor.is_due(start + interval));
    }

    #[test]
    fn test_heartbeat_file_accessor() {
        let path = Path::new("/tmp/evrelay-alive");
        assert_eq!(alive(path, DEFAULT_STALE_THRESHOLD).heartbeat_file(), Some(path));
        assert_eq!(LivenessStrategy::None.heartbeat_file(), None);
        assert!(LivenessStrategy::ConsumerSinkClosed.watches_sink());
        assert!(!watchdog(path, DEFAULT_STALE_THRESHOLD).watches_sink());
    }
}
