//! CLI entry point for the lab monitor.
//!
//! # Usage
//!
//! Run against real hardware:
//! ```bash
//! labmon run --config config/monitor.toml
//! ```
//!
//! Run every family against simulated drivers:
//! ```bash
//! labmon run --config config/monitor.example.toml --simulate
//! ```
//!
//! Validate a configuration and print it fully resolved:
//! ```bash
//! labmon check-config --config config/monitor.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lab_monitor::app::MonitorApp;
use lab_monitor::config::MonitorConfig;
use lab_monitor::hardware::DriverRegistry;
use lab_monitor::logging;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "labmon")]
#[command(about = "Laboratory environment monitor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every enabled device until Ctrl-C
    Run {
        /// Path to the TOML configuration
        #[arg(long, default_value = "config/monitor.toml")]
        config: PathBuf,

        /// Use simulated drivers for every device family
        #[arg(long)]
        simulate: bool,
    },

    /// Validate a configuration and print it as JSON
    CheckConfig {
        /// Path to the TOML configuration
        #[arg(long, default_value = "config/monitor.toml")]
        config: PathBuf,
    },
}

fn load(path: &PathBuf) -> Result<MonitorConfig> {
    let config = MonitorConfig::load_from(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, simulate } => run(config, simulate).await,
        Commands::CheckConfig { config } => {
            let config = load(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(path: PathBuf, simulate: bool) -> Result<()> {
    let config = Arc::new(load(&path)?);
    logging::init_from_config(&config)?;

    let registry = if simulate {
        warn!("Simulated drivers in use, no hardware will be touched");
        DriverRegistry::simulated(&config)
    } else {
        DriverRegistry::with_builtin(&config)
    };

    let app = MonitorApp::start(Arc::clone(&config), &registry).await?;
    info!(devices = ?app.running_devices(), "Press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Ctrl-C received");

    let summary = app.shutdown().await?;
    if let Some(flush) = summary.final_flush {
        info!(items = flush.items, rows = flush.rows, "Last batch stored");
    }
    Ok(())
}
