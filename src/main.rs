//! Broker binary: parses CLI args, wires up tracing, and runs the accept loop until
//! ctrl-c.

use std::net::SocketAddr;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use market_broker::config::{Args, Config, LogFormat};
use market_broker::manager::MarketManager;
use market_broker::server::BrokerServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args(Args::parse());
    init_tracing(config.log_format);

    tracing::info!(
        port = config.port,
        default_stock = config.default_stock,
        sale_duration_secs = config.sale_duration.as_secs(),
        sweep_interval_ms = config.sweep_interval.as_millis() as u64,
        "starting market broker"
    );

    let (broadcast_tx, broadcast_rx) = BrokerServer::channel();
    let manager = MarketManager::new(config.default_stock, config.sale_duration, broadcast_tx.clone());
    let _sweeper = manager.spawn_sweeper(config.sweep_interval);

    let server = BrokerServer::new(manager, broadcast_tx, broadcast_rx);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    server.run(listener, shutdown_signal()).await?;
    Ok(())
}

/// Resolves on ctrl-c. If installing the handler fails, shutdown is simply disabled
/// rather than the process exiting immediately.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(%err, "failed to install ctrl-c handler; shutdown signal disabled");
        std::future::pending::<()>().await;
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}
