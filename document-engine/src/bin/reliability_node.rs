//! Reliability node binary
//!
//! Usage: `reliability-node [config.toml]`. Without a path, `RELIABILITY_CONFIG`
//! is tried, then environment variables.

use document_engine::{Node, NodeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Reliability node starting...");

    // Load configuration
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RELIABILITY_CONFIG").ok());
    let config = match path {
        Some(path) => {
            tracing::info!(path = %path, "Loading configuration file");
            NodeConfig::from_file(&path)?
        }
        None => NodeConfig::from_env()?,
    };

    tracing::info!(
        backend = ?config.ledger.backend,
        charging = ?config.documents.charging,
        provider = %config.documents.gateway.base_url,
        "Configuration loaded"
    );

    let node = Node::start(config).await?;

    tokio::signal::ctrl_c().await?;

    node.shutdown().await?;
    Ok(())
}
