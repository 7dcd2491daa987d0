//! testbed-agent entry point.
//!
//! Binds the protocol ports, starts the sidecar HTTP surface and runs the
//! dispatch loop until SIGINT.

use std::sync::Arc;
use testbed_agent::{http, Agent, AgentConfig, ExecutionBoard};
use testbed_proto::{ChannelBinding, TcpCommunicator};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("testbed_agent=debug".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = AgentConfig::from_env()?;
    tracing::info!(?config, "testbed-agent starting...");

    let binding = ChannelBinding::agent(
        config.testbed_id.clone(),
        config.publish_addr.to_string(),
        config.subscribe_addr.to_string(),
    );
    let comm = TcpCommunicator::open(binding).await?;
    tracing::info!(
        publish = ?comm.publish_addr(),
        subscribe = ?comm.subscribe_addr(),
        "Protocol ports bound"
    );

    let shutdown = CancellationToken::new();
    let board = ExecutionBoard::new();

    let http_handle = config.http_addr.map(|addr| {
        let config = config.clone();
        let board = board.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let signal = async move { token.cancelled().await };
            if let Err(e) = http::serve(&config, board, addr, signal).await {
                tracing::error!(error = %e, "Sidecar HTTP server error");
            }
        })
    });

    let agent = Agent::new(Arc::new(comm), config).with_board(board);
    let agent_handle = tokio::spawn(agent.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");
    shutdown.cancel();

    let _ = agent_handle.await;
    if let Some(handle) = http_handle {
        let _ = handle.await;
    }
    tracing::info!("testbed-agent stopped");
    Ok(())
}
