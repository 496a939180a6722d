//! Process shutdown on SIGINT or SIGTERM.

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Resolve once the process is asked to stop.
pub async fn signal_received() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            info!("Received SIGINT, shutting down");
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }
    Ok(())
}
