use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleece_road::{serve, telemetry::Telemetry, AppState, Cli, RoadConfig};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = RoadConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        handshake_timeout_secs = config.handshake_timeout.as_secs(),
        "starting fleece-road"
    );

    let state = Arc::new(AppState::new(&config, Some(telemetry.metrics_handle())));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("fleece-road listening on {}", config.listen_addr);

    serve(listener, state, shutdown_signal())
        .await
        .context("server shutdown with error")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
