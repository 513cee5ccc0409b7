//! Gateway daemon entry point.
//!
//! Loads configuration from the environment, wires up structured logging,
//! and runs the engine until it gives up (watchdog trip, fatal upstream
//! error) or the process is signaled to stop.

use gateway_core::config::GatewayConfig;
use gateway_core::engine::Engine;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gateway_core=info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = GatewayConfig::load()?;
    tracing::info!(host = %config.api_host, port = config.api_port, "starting gateway");

    let engine = Engine::new(config.clone());
    let commands = engine.command_sender();
    let tcp_port = config.tcp_port;
    tokio::spawn(async move {
        if let Err(err) = gateway_core::listener::serve("0.0.0.0", tcp_port, commands).await {
            tracing::error!(%err, "downstream listener exited");
        }
    });

    if let Err(err) = engine.run().await {
        tracing::error!(%err, "gateway exiting");
        std::process::exit(1);
    }
    Ok(())
}
