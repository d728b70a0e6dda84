//! Adviser Server - headless trading advisory system
//!
//! Runs the advisory system without a UI, suitable for server
//! deployments. Metrics are pushed via structured JSON logs to stdout
//! on the configured interval -- no HTTP server, no incoming connections.
//!
//! # Usage
//! ```sh
//! cargo run --bin server -- --config config.yaml
//! ```
//!
//! # Environment Variables
//! - `ADVISER_HOME` - overrides the data home directory from config.yaml
//! - any `${VAR}` referenced inside config.yaml is resolved from the process env

use std::path::PathBuf;

use adviser::application::bootstrap::Application;
use adviser::config::AppConfig;
use anyhow::Result;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("Adviser Server {} starting...", env!("CARGO_PKG_VERSION"));
    info!("Mode: HEADLESS (no UI, no HTTP server)");
    info!("Metrics: push-based (METRICS_JSON lines to stdout)");

    let config_path = std::env::args().skip_while(|a| a != "--config").nth(1).map(PathBuf::from);

    let config = AppConfig::load(config_path.as_deref(), None)?;
    info!(home = %config.home_path().display(), "configuration loaded");

    info!("building application...");
    let app = Application::build(config).await?;

    info!("starting application...");
    app.start().await?;
    info!("adviser running. Press Ctrl+C to shut down.");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping...");

    app.stop().await;
    info!("stopped cleanly.");

    Ok(())
}
