//! evrelay - grab an input device and stream its raw events to stdout
//!
//!   - main.rs: process setup, logging, exit codes
//!   - args.rs: flag parsing and validation
//!
//! Diagnostics go to stderr; stdout carries nothing but event records.

mod args;

use args::Cli;
use clap::Parser;
use evrelay::{ignore_broken_pipe, run_session, ShutdownFlag};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    let config = match cli.session_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    // ═══════════════════════════════════════════════════════════════════════
    // Process setup
    // ═══════════════════════════════════════════════════════════════════════

    if let Err(e) = ignore_broken_pipe() {
        tracing::error!("{}", e);
        return ExitCode::FAILURE;
    }

    let shutdown = ShutdownFlag::new();
    if let Err(e) = shutdown.install_handlers() {
        tracing::error!("{}", e);
        return ExitCode::FAILURE;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Relay
    // ═══════════════════════════════════════════════════════════════════════

    let stdout = std::io::stdout();
    match run_session(&config, &stdout, &shutdown) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(quiet: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
