//! Karst full node binary.
//!
//! Loads configuration from the resources directory, boots the node with
//! its scheduled tasks, and runs until interrupted.
//!
//! Exit codes: 0 clean shutdown, 1 fatal startup error, 2 fatal runtime
//! error.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use karst_core::clock::SystemClock;
use karst_core::crypto::KeyPair;
use karst_node_lib::{KarstNode, NodeConfig};

/// Karst full node.
#[derive(Parser, Debug)]
#[command(name = "karst-node", version, about = "Karst full node")]
struct Args {
    /// Resources directory holding config-node.json and harvesting keys
    #[arg(long)]
    resources: Option<PathBuf>,

    /// Peer-to-peer port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Local API port (overrides the config file)
    #[arg(long)]
    api_port: Option<u16>,

    /// Disable block production on this node
    #[arg(long)]
    no_harvesting: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> anyhow::Result<NodeConfig> {
    let mut config = match &args.resources {
        Some(resources) => {
            let path = resources.join("config-node.json");
            if path.exists() {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?
            } else {
                NodeConfig::default()
            }
        }
        None => NodeConfig::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(api_port) = args.api_port {
        config.api_port = api_port;
    }
    if args.no_harvesting {
        config.harvesting_enabled = false;
    }
    Ok(config)
}

/// Harvesting keys from `harvesting-keys.json` in the resources directory:
/// a JSON array of hex-encoded 32-byte seeds.
fn load_harvesting_keys(resources: Option<&PathBuf>) -> anyhow::Result<Vec<KeyPair>> {
    let Some(resources) = resources else {
        return Ok(Vec::new());
    };
    let path = resources.join("harvesting-keys.json");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let seeds: Vec<String> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    let mut keys = Vec::with_capacity(seeds.len());
    for seed_hex in seeds {
        let bytes = (0..seed_hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&seed_hex[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .context("harvesting key is not hex")?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("harvesting key must be 32 bytes"))?;
        keys.push(KeyPair::from_seed(seed));
    }
    Ok(keys)
}

fn init_logging(level_str: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e:#}");
            process::exit(1);
        }
    };
    let keys = match load_harvesting_keys(args.resources.as_ref()) {
        Ok(keys) => keys,
        Err(e) => {
            error!("failed to load harvesting keys: {e:#}");
            process::exit(1);
        }
    };

    info!("karst node v{}", env!("CARGO_PKG_VERSION"));
    info!(port = config.port, api_port = config.api_port, "configuration loaded");
    if keys.is_empty() {
        info!("no harvesting keys unlocked; running as a relay");
    } else {
        info!(count = keys.len(), "harvesting keys unlocked");
    }

    // Runtime invariant violations flush logs and abort with exit code 2.
    let fatal_handler = Arc::new(|e: &karst_core::error::KarstError| {
        error!("fatal runtime error: {e}");
        process::exit(2);
    });

    let node = match KarstNode::new(config, keys, Arc::new(SystemClock), |_| {}, fatal_handler) {
        Ok(node) => node,
        Err(e) => {
            error!("failed to start node: {e}");
            process::exit(1);
        }
    };

    let scheduler = node.boot();
    info!(
        height = node.chain_height(),
        tip = %node.tip_hash(),
        "node running (Ctrl+C to stop)",
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to wait for shutdown signal: {e}");
        process::exit(2);
    }
    info!("shutdown signal received");

    scheduler.shutdown().await;
    node.shutdown();
    info!("node stopped cleanly");
}
