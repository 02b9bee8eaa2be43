use anyhow::Context;
use build_agent_server::{AgentServer, cli::Cli};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Cli::parse().into_config();
    let server = AgentServer::start(config)
        .await
        .context("Failed to start build agent")?;
    tracing::info!("Build agent running on http://{}", server.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    server.shutdown().await?;
    Ok(())
}
