//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bc_domain::config::BrokerConfig;

#[derive(Parser)]
#[command(name = "beamcode", about = "Session broker for AI coding-agent CLIs")]
pub struct Cli {
    /// Path to the broker config file (TOML).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the broker (default).
    Serve,
    /// Validate the config file and exit.
    ConfigValidate,
}

/// Initialize tracing with `RUST_LOG`-style filtering.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,beamcode=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Load and validate the configuration.
pub fn load_config(path: Option<&PathBuf>) -> anyhow::Result<BrokerConfig> {
    let config = BrokerConfig::load(path)?;
    config.validate()?;
    Ok(config)
}
