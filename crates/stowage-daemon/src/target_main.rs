//! Backup target.
//!
//!   stowage-target --config target.toml
//!   stowage-target --name nas --server http://backup.lan:8400 --storage /srv/stowage

use std::path::PathBuf;

use clap::Parser;
use stowage_daemon::{init_tracing, load_config, shutdown_signal};
use stowage_target::{HttpLink, TargetAgent, TargetConfig, TargetStore};

#[derive(Parser)]
#[command(name = "stowage-target", about = "Store files relayed by a stowage server")]
struct Args {
    /// TOML config file.
    #[arg(long, env = "STOWAGE_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    storage: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let args = Args::parse();

    let mut config: TargetConfig = load_config(args.config.as_deref())?;
    if let Some(name) = args.name {
        config.target_name = name;
    }
    if let Some(server) = args.server {
        config.server_address = server;
    }
    if let Some(storage) = args.storage {
        config.storage_root = storage;
    }

    let store = TargetStore::open(&config.storage_root)?;
    let link = HttpLink::new(&config.server_address, config.request_timeout())?;
    tracing::info!(
        "Target {} storing under {}, server {}",
        config.target_name,
        config.storage_root.display(),
        config.server_address
    );

    TargetAgent::new(&config, store, link)
        .run(shutdown_signal())
        .await?;
    Ok(())
}
