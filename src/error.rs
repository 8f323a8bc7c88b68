//! Error types for evrelay

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for evrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that end a relay session abnormally.
///
/// Designed terminations (end of stream, stale heartbeat, consumer gone,
/// termination signal) are not errors; see [`crate::relay::ExitReason`].
#[derive(Debug, Error)]
pub enum RelayError {
    /// Device path missing or unreadable
    #[error("Failed to open input device '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Exclusive grab refused (already held, or insufficient privilege)
    #[error("Failed to grab input device '{}': {source}", path.display())]
    Grab {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Read from the grabbed device failed
    #[error("Failed to read from input device: {0}")]
    DeviceRead(#[source] io::Error),

    /// Device returned something other than one whole record
    #[error("Short read from input device: expected {expected} bytes, got {got} bytes")]
    ShortRead { expected: usize, got: usize },

    /// Output sink write failed with something other than a broken pipe
    #[error("Failed to write to output: {0}")]
    Write(#[source] io::Error),

    /// Output sink could not be switched to non-blocking mode
    #[error("Failed to configure output: {0}")]
    Output(#[source] io::Error),

    /// Multiplexed wait failed
    #[error("Failed to wait for device readiness: {0}")]
    Poll(#[source] io::Error),

    /// Process-id marker could not be written
    #[error("Failed to write pid file '{}': {source}", path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The relay loop was entered after it had already terminated
    #[error("Relay loop has already terminated")]
    AlreadyTerminated,

    /// Termination handlers could not be installed
    #[error("Failed to install signal handler: {0}")]
    SignalHandler(String),

    /// Contradictory or out-of-range configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
