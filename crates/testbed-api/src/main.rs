//! testbed-api entry point.
//!
//! Serves the REST API until SIGINT, then destroys every testbed it created.

use std::sync::Arc;
use testbed_api::{http, ApiConfig, AppState};
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("testbed_api=info".parse()?)
                .add_directive("testbed_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting testbed API");

    let config = ApiConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // Warn-only so a local setup without a catalog still starts.
    config.validate_warn();

    let manager = Arc::new(config.build_manager()?);
    let state = AppState::new(manager.clone())
        .with_timeouts(config.client_timeout, config.run_timeout);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut shutdown_rx = shutdown_tx.subscribe();
    let http_addr = config.http_addr;

    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };
        if let Err(e) = http::serve(state, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });
    tracing::info!(addr = %http_addr, cluster = ?config.cluster, "Server ready");

    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");
    let _ = shutdown_tx.send(());

    let destroyed = manager.destroy_all(None).await;
    tracing::info!(destroyed, "Testbeds cleaned up");

    let _ = http_handle.await;
    tracing::info!("Server shutdown complete");
    Ok(())
}
