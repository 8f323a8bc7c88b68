//! evrelay - exclusive input device relay
//!
//! Grabs a Linux evdev node with `EVIOCGRAB`, copies its raw `input_event`
//! records to an output descriptor, and gives the grab back the moment the
//! consumer of that output is judged gone.
//!
//! # Architecture
//!
//! - **GrabHandle**: owns the device descriptor and the exclusive grab
//! - **LivenessMonitor**: decides whether the consumer is still there
//! - **EventRelay**: bounded-wait read/forward loop
//! - **ShutdownCoordinator**: single cleanup path for every way out
//!
//! Everything runs on one thread. Signal handlers only set a
//! [`ShutdownFlag`]; the loop never waits longer than one polling interval
//! before looking at it again.

pub mod config;
pub mod error;
pub mod grab;
pub mod liveness;
pub mod pidfile;
pub mod relay;
pub mod shutdown;

pub use config::{run_session, SessionConfig};
pub use error::{RelayError, Result};
pub use grab::{ExclusiveSource, GrabHandle};
pub use liveness::{LivenessMonitor, LivenessStrategy, StaleCause, Verdict};
pub use relay::{EventRelay, ExitReason, LoopState, RelayConfig, RelayStats};
pub use shutdown::{ignore_broken_pipe, SessionReport, ShutdownCoordinator, ShutdownFlag};
