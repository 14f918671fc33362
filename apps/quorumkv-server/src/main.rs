use quorumkv_server::{config, node};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "quorumkv.yaml".to_string());

    tracing::info!("Loading configuration from: {}", config_path);

    // File first, environment as fallback
    let config = if std::path::Path::new(&config_path).exists() {
        config::ServerConfig::load_from_file(&config_path)?
    } else {
        tracing::warn!("Config file not found, loading from environment variables");
        config::ServerConfig::load_from_env()?
    };

    tracing::info!("Starting quorumkv node: {}", config.node_id);
    tracing::info!("RPC address: {}", config.rpc_addr);
    tracing::info!("Data directory: {}", config.data_dir.display());

    let mut node = node::Node::new(config).await?;
    node.start().await?;

    tracing::info!("quorumkv server is ready");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Received shutdown signal, gracefully shutting down...");
    node.shutdown().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
