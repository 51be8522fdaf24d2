//! chatrelay - main entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chatrelay::broker::Broker;
use chatrelay::config::Config;
use chatrelay::gateway::{self, GatewayState};

#[derive(Parser, Debug)]
#[command(name = "chatrelay")]
#[command(about = "OpenAI-compatible completion broker backed by WebSocket worker agents")]
#[command(version)]
struct Args {
    /// Listen address override (host:port); defaults to configuration.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chatrelay=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting chatrelay");

    let config = Config::from_env()?;
    let addr = match args.listen {
        Some(addr) => addr,
        None => config.gateway.listen_addr()?,
    };

    let broker = Arc::new(Broker::new(config.broker.clone()));
    let eviction = broker.start_eviction();

    let state = GatewayState {
        broker: Arc::clone(&broker),
    };
    let (bound, server) = gateway::start_server(addr, state).await?;
    tracing::info!(
        "chatrelay listening on {} (workers connect at ws://{}/ws)",
        bound,
        bound
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
        result = server => {
            match result {
                Ok(Ok(())) => tracing::error!("gateway server exited unexpectedly"),
                Ok(Err(e)) => tracing::error!("gateway server failed: {}", e),
                Err(e) => tracing::error!("gateway server task failed: {}", e),
            }
        }
    }
    eviction.abort();

    Ok(())
}
