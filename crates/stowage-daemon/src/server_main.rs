//! Job router.
//!
//!   stowage-server --config server.toml
//!   stowage-server --listen 0.0.0.0:8400 --data-dir /var/lib/stowage

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use stowage_daemon::{init_tracing, load_config, shutdown_signal};
use stowage_server::{JobRouter, ServerConfig};

#[derive(Parser)]
#[command(name = "stowage-server", about = "Authenticate client jobs and relay them to targets")]
struct Args {
    /// TOML config file.
    #[arg(long, env = "STOWAGE_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long)]
    listen: Option<SocketAddr>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let args = Args::parse();

    let mut config: ServerConfig = load_config(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    tracing::info!("Client registry at {}", config.registry_path().display());
    let router = Arc::new(JobRouter::open(config)?);
    stowage_server::serve(router, shutdown_signal()).await?;
    Ok(())
}
