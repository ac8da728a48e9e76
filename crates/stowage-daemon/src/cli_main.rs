//! Client CLI.
//!
//!   stowage --config client.toml register
//!   stowage --config client.toml run --every 300

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use stowage_client::{ClientConfig, Coordinator, FlushReport, HttpTransport, PemKeyDir};
use stowage_daemon::{init_tracing, load_config, shutdown_signal};

#[derive(Parser)]
#[command(name = "stowage", about = "Back files up through a stowage server")]
struct Args {
    /// TOML config file.
    #[arg(long, env = "STOWAGE_CONFIG")]
    config: Option<PathBuf>,
    /// Server base URL, overriding the config file.
    #[arg(long)]
    server: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register this client's public key.
    Register,
    /// Report in and list which targets are reachable.
    Checkin,
    /// Compare local files against a target and queue what it lacks.
    Sync { target: String },
    /// Send queued jobs for every reachable target.
    Flush,
    /// Show the delivery queues.
    Jobs,
    /// Register, then check in, sync and flush in a loop.
    Run {
        /// Seconds between cycles; runs once when omitted.
        #[arg(long)]
        every: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let args = Args::parse();

    let mut config: ClientConfig = load_config(args.config.as_deref())?;
    if let Some(server) = args.server {
        config.server_address = server;
    }

    let keys = PemKeyDir::new(&config.data_dir, config.key_bits);
    let transport = HttpTransport::new(&config.server_address, config.request_timeout())?;
    let mut coordinator = Coordinator::open(config, &keys, transport)?;

    match args.command {
        Command::Register => print_json(&coordinator.register().await?)?,
        Command::Checkin => {
            let outcome = coordinator.checkin().await?;
            print_json(&outcome.result)?;
        }
        Command::Sync { target } => {
            coordinator.refresh_tree()?;
            coordinator.checkin().await?;
            let outcome = coordinator.sync_target(&target).await?;
            print_json(&outcome.result)?;
            match outcome.plan {
                Some(plan) => {
                    let queued = coordinator.queue_transfers(&target, &plan)?;
                    coordinator.mirror_locally(&plan)?;
                    println!("{queued} transfers queued, {} deletions reported", plan.delete.len());
                    print_flush(coordinator.flush().await)?;
                }
                None => println!("{target} has not reported a tree yet; try again shortly"),
            }
        }
        Command::Flush => {
            coordinator.checkin().await?;
            print_flush(coordinator.flush().await)?;
        }
        Command::Jobs => print_json(&coordinator.list_jobs())?,
        Command::Run { every } => {
            let registration = coordinator.register().await?;
            if !registration.success {
                bail!(
                    "registration refused: {}",
                    registration.msg.unwrap_or_default()
                );
            }
            let Some(every) = every else {
                let report = coordinator.run_cycle().await?;
                println!(
                    "{} queued, {} delivered, offline: {:?}",
                    report.queued,
                    report.deliveries.len(),
                    report.offline
                );
                return match report.flush_error {
                    Some(e) => Err(e).context("flush stopped early"),
                    None => Ok(()),
                };
            };

            let mut ticker = tokio::time::interval(Duration::from_secs(every.max(1)));
            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = ticker.tick() => {
                        let error = match coordinator.run_cycle().await {
                            Ok(report) => {
                                tracing::info!(
                                    queued = report.queued,
                                    delivered = report.deliveries.len(),
                                    offline = ?report.offline,
                                    "cycle done"
                                );
                                report.flush_error
                            }
                            Err(e) => Some(e),
                        };
                        match error {
                            // Jobs stay queued; the next cycle retries them.
                            Some(e) if e.is_transport() => tracing::warn!("Server unreachable: {}", e),
                            Some(e) => return Err(e).context("backup cycle failed"),
                            None => {}
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Print what was delivered, then fail if the flush stopped early.
fn print_flush(report: FlushReport) -> anyhow::Result<()> {
    print_json(&report.deliveries)?;
    match report.error {
        Some(e) => Err(e).context("flush stopped early"),
        None => Ok(()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
