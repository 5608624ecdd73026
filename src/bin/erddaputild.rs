// src/bin/erddaputild.rs

//! The daemon's entry point: parse `--config`, load and validate the
//! configuration, install a reloadable log subscriber, assemble the shared
//! [`Core`], and hand it to the [`Supervisor`] for the rest of the
//! process's life.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use erddaputil_core::config::Config;
use erddaputil_core::core::supervisor::{Core, Supervisor};
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = run().await {
        eprintln!("erddaputild: {e}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version") {
        println!("erddaputild version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();
    let _reload_handle = Arc::new(reload_handle);

    tracing::info!(version = VERSION, "starting erddaputild");

    let (core, metrics_rx) = Core::build(config).map_err(|e| anyhow::anyhow!(e))?;
    let supervisor = Supervisor::new(core, metrics_rx);
    if let Err(e) = supervisor.run().await {
        error!(error = %e, "supervisor exited with an error");
        return Err(anyhow::anyhow!(e));
    }

    Ok(())
}
