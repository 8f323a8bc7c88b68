//! Command-line arguments and their mapping onto `SessionConfig`

use clap::{Parser, ValueEnum};
use evrelay::relay::{RelayConfig, NATIVE_RECORD_SIZE};
use evrelay::{LivenessStrategy, RelayError, Result, SessionConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "evrelay")]
#[command(about = "Grab an input device exclusively and stream its raw events to stdout")]
#[command(version)]
pub struct Cli {
    /// Input device to grab (same as --device)
    #[arg(value_name = "DEVICE", conflicts_with = "device")]
    pub device_path: Option<PathBuf>,

    /// Input device to grab, e.g. /dev/input/event1
    #[arg(long, value_name = "PATH")]
    pub device: Option<PathBuf>,

    /// Write our pid here at startup, remove it on exit
    #[arg(long, value_name = "PATH")]
    pub pidfile: Option<PathBuf>,

    /// Heartbeat file the consumer keeps touching
    #[arg(long, value_name = "PATH")]
    pub alive_file: Option<PathBuf>,

    /// Heartbeat age in seconds after which the consumer is presumed gone
    #[arg(long, value_name = "SECONDS", default_value_t = 10)]
    pub stale_sec: u64,

    /// Liveness strategy [default: alive-file if --alive-file is given, else none]
    #[arg(long, value_enum)]
    pub liveness: Option<LivenessArg>,

    /// Longest single wait before liveness and signals are re-checked
    #[arg(long, value_name = "MILLIS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Bytes per input_event record (16 on 32-bit devices, 24 on 64-bit)
    #[arg(long, value_name = "BYTES", default_value_t = NATIVE_RECORD_SIZE)]
    pub record_size: usize,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
pub enum LivenessArg {
    /// Never stale; rely on a supervisor to stop us
    None,
    /// Heartbeat file, missing file tolerated
    AliveFile,
    /// Heartbeat file, missing file is stale
    WatchdogFile,
    /// Stop when stdout hangs up
    ConsumerClosed,
}

impl Cli {
    /// Resolve the liveness strategy implied by the flags
    pub fn liveness_strategy(&self) -> Result<LivenessStrategy> {
        let staleness_threshold = Duration::from_secs(self.stale_sec);
        let mode = self.liveness.unwrap_or(if self.alive_file.is_some() {
            LivenessArg::AliveFile
        } else {
            LivenessArg::None
        });

        let heartbeat = || {
            self.alive_file.clone().ok_or_else(|| {
                RelayError::InvalidConfig("--liveness file modes need --alive-file".to_string())
            })
        };

        Ok(match mode {
            LivenessArg::None => LivenessStrategy::None,
            LivenessArg::AliveFile => LivenessStrategy::AliveFile {
                path: heartbeat()?,
                staleness_threshold,
            },
            LivenessArg::WatchdogFile => LivenessStrategy::WatchdogFile {
                path: heartbeat()?,
                staleness_threshold,
            },
            LivenessArg::ConsumerClosed => LivenessStrategy::ConsumerSinkClosed,
        })
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        let device = self
            .device
            .clone()
            .or_else(|| self.device_path.clone())
            .ok_or_else(|| RelayError::InvalidConfig("no input device given".to_string()))?;

        if self.alive_file.is_some()
            && matches!(self.liveness, Some(LivenessArg::None | LivenessArg::ConsumerClosed))
        {
            tracing::warn!("--alive-file is ignored with the selected liveness strategy");
        }

        let config = SessionConfig {
            device,
            pidfile: self.pidfile.clone(),
            liveness: self.liveness_strategy()?,
            relay: RelayConfig {
                record_size: self.record_size,
                poll_interval: Duration::from_millis(self.poll_interval_ms),
            },
        };
        config.validate()?;
        Ok(config)
    }
}
