//! Tessera Metadata Node
//!
//! Hosts the metadata partitions of one node: reloads those already on
//! disk, creates the ones listed in the config file, and keeps their
//! store schedulers running until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tessera_common::Config;
use tessera_meta::MetadataManager;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tessera-meta")]
#[command(about = "Tessera Metadata Node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/tessera/meta.toml")]
    config: PathBuf,

    /// Node ID (overrides the config file)
    #[arg(long)]
    node_id: Option<u64>,

    /// Data directory (overrides the config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(node_id) = args.node_id {
        config.node.node_id = node_id;
    }
    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting Tessera Metadata Node {} (data dir {})",
        config.node.node_id,
        config.node.data_dir.display()
    );

    std::fs::create_dir_all(&config.node.data_dir)
        .with_context(|| format!("failed to create {}", config.node.data_dir.display()))?;
    let manager = MetadataManager::new(config.node.node_id, &config.node.data_dir);

    let reloaded = manager.load_all()?;
    info!("Reloaded {} partitions", reloaded);

    for partition in config.partitions {
        let id = partition.partition_id;
        if manager.partition(id).is_some() {
            continue;
        }
        match manager.create_partition(partition) {
            Ok(mp) => info!("Created partition {} at {}", id, mp.config().root_dir.display()),
            Err(e) => error!("Failed to create partition {}: {}", id, e),
        }
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    manager.stop_all().await;

    info!("Metadata Node shut down gracefully");
    Ok(())
}
