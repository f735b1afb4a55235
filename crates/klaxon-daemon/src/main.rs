//! klaxond - Klaxon audio-routing daemon scaffold
//!
//! Usage:
//!   klaxond [--config /etc/klaxon/klaxond.toml] [--control-socket PATH]
//!           [--log-filter DIRECTIVES]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use klaxon_daemon::{run_daemon, Config};

/// Klaxon audio-routing daemon scaffold
#[derive(Parser)]
#[command(name = "klaxond")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Control socket path (overrides the config file)
    #[arg(long, value_name = "PATH")]
    control_socket: Option<PathBuf>,

    /// Log filter directives (overrides RUST_LOG)
    #[arg(long, value_name = "DIRECTIVES")]
    log_filter: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match &cli.log_filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::from_default_env()
            .add_directive("klaxon_daemon=info".parse().unwrap())
            .add_directive("klaxon_watchdog=info".parse().unwrap()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config =
        Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(path) = cli.control_socket {
        config.control.socket = path;
    }

    run_daemon(config)
}
