//! Tessera full node binary.
//!
//! Loads the layered configuration, opens RocksDB storage, and runs the chain
//! service and block synchroniser over TCP until Ctrl+C.

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use tessera_node_lib::{Node, NodeConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "tessera-node",
    version,
    about = "Tessera full node with RocksDB storage and TCP block sync"
)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for chain storage
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// P2P listen address (host:port)
    #[arg(long)]
    listen: Option<String>,

    /// Bootstrap peers (comma-separated host:port)
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long)]
    log_format: Option<String>,

    /// Skip producer-proof verification (single-node testing)
    #[arg(long)]
    skip_multisig: bool,
}

impl Args {
    /// Load the configuration file and environment, then apply flags.
    fn into_config(self) -> anyhow::Result<NodeConfig> {
        let mut config = NodeConfig::load(self.config.as_deref()).context("loading configuration")?;
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if !self.peers.is_empty() {
            config.peers = self.peers;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if self.skip_multisig {
            config.chain.skip_check_multisig = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tessera-node: {e:#}");
            process::exit(2);
        }
    };

    init_logging(&config.log_level, &config.log_format);

    if let Err(e) = run(config).await {
        error!("{e:#}");
        process::exit(1);
    }
}

async fn run(config: NodeConfig) -> anyhow::Result<()> {
    info!("Tessera Node v{}", env!("CARGO_PKG_VERSION"));
    info!("data_dir: {:?}", config.data_dir);
    info!("chain_id: {}", config.chain.chain_id);
    info!("bootstrap_peers: {:?}", config.peers);
    if config.chain.skip_check_multisig {
        info!("producer-proof verification disabled");
    }

    let node = Node::init(config).context("failed to start node")?;
    if let Some(tip) = node.chain().best_chain() {
        info!(
            "chain_tip: height={} hash={}",
            tip.height(),
            hex::encode(tip.hash().as_bytes())
        );
    }

    let addr = node.run().await.context("failed to start networking")?;
    info!("Tessera node listening on {addr} (Ctrl+C to stop)");

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("received Ctrl+C, shutting down...");

    node.stop().await;
    info!("Tessera node shutdown complete");
    Ok(())
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `format = "json"` selects structured JSON output; anything else is text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
