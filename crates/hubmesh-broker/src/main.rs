#![warn(missing_docs)]

//! Hubmesh broker daemon.

use std::sync::Arc;

use hubmesh_broker::{Broker, BrokerConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = BrokerConfig::from_env();
    let broker = Arc::new(Broker::new(config));
    let running = broker.listen().await?;
    tracing::info!(addr = %running.local_addr(), seed = broker.seed(), "hubmesh broker up");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    running.shutdown();
    Ok(())
}
