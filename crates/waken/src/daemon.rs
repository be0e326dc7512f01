//! The `watch` command: run the watchdog loop until asked to stop.

use std::sync::Arc;

use miette::Result;
use tokio::sync::watch;
use tracing::info;

use waken_scheduler::{Orchestrator, Watchdog, WatchdogConfig};

/// Run the watchdog until SIGINT or SIGTERM.
pub async fn run(orchestrator: Arc<Orchestrator>, config: WatchdogConfig) -> Result<()> {
    info!(
        root = %orchestrator.layout().root().display(),
        "starting waken watchdog"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let watchdog = Watchdog::new(orchestrator, config);
    watchdog.run(shutdown_rx).await;

    info!("watchdog stopped");
    Ok(())
}

#[cfg(unix)]
pub(crate) async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM, only ctrl-c will stop the watchdog");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
pub(crate) async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
