mod config;
mod pool;
mod status;

use anyhow::{Context, Result};
use clap::Parser;
use evonet_protocol::Node;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use crate::config::Cli;
use crate::pool::MigrantPool;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = cli.node_config().context("Invalid node configuration")?;
    tracing::info!(
        addr = %cfg.addr,
        seeds = cfg.seeds.len(),
        fleet = cfg.fleet_size_estimate,
        subnet = %cfg.subnet.label(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting evonet node"
    );

    let pool = MigrantPool::new();
    let node = Node::start(cfg, pool.clone())
        .await
        .context("Failed to start node")?;

    if let Some(port) = cli.status_port {
        let state = Arc::new(status::StatusState {
            node: node.monitor(),
            pool: pool.clone(),
        });
        let app = status::create_router(state);
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
            .await
            .with_context(|| format!("Failed to bind status port {port}"))?;
        tracing::info!(port, "Status endpoint listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Status server error: {e}");
            }
        });
    }

    shutdown_signal().await;
    tracing::info!("Shutting down gracefully");
    node.shutdown();
    node.join().await;

    let left = pool.drain();
    if !left.is_empty() {
        tracing::info!(migrants = left.len(), "Discarding unabsorbed migrants");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
