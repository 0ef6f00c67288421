//! procwarden - operator CLI over the process manager.
//!
//! Thin binary entry point: loads configuration, sets up tracing and hands
//! the parsed command to [`commands::dispatch`].

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use procwarden_config::{ConfigManager, LoggingConfig};

mod args;
mod commands;

use args::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::load_from_file(path),
        None => ConfigManager::load(),
    }
    .context("failed to load configuration")?;
    let config = manager.into_config();

    initialize_tracing(&config.logging);

    commands::dispatch(cli, config).await
}

/// `RUST_LOG` wins; otherwise the configured level applies to the procwarden
/// targets. Logs go to stderr so command output on stdout stays clean.
fn initialize_tracing(logging: &LoggingConfig) {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging.filter_directive()));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let init_result = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();

    if let Err(err) = init_result {
        tracing::warn!(error = %err, "tracing already initialized; skipping setup");
    }
}
