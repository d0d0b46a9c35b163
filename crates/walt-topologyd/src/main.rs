//! WALT topology tracker entry point.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use walt_common::{config::DEFAULT_CONFIG_PATH, open_store, WaltConfig};
use walt_topologyd::{DeviceClassifier, LldpBackend, TopologyTracker};

/// Discover and display the WALT network topology
#[derive(Parser, Debug)]
#[command(name = "walt-topologyd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rediscover the whole network
    Rescan,
    /// Print the topology tree
    Tree,
    /// Print connected and replaced devices
    Show,
}

fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact(),
        )
        .init();
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %e, "walt-topologyd: command failed");
            Err(e)
        }
    }
}

async fn run(args: Args) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = WaltConfig::load_or_default(&args.config)?;
    let store = open_store(&config.database).await?;
    let server_mac = config.topology.resolve_server_mac()?;
    info!(%server_mac, "walt-topologyd: starting");

    let classifier = DeviceClassifier::new(&config.topology, server_mac);
    let discovery = Arc::new(LldpBackend::new(&config.topology));
    let tracker = TopologyTracker::new(
        store,
        discovery,
        classifier,
        config.topology.retry_delay(),
    );

    match args.command {
        Command::Rescan => {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    println!("{line}");
                }
            });
            let tracker = tracker.with_progress(tx);
            let outcome: walt_topologyd::Result<_> = async {
                tracker.rescan().await?;
                tracker.tree().await
            }
            .await;
            // closes the progress channel
            drop(tracker);
            printer.await?;
            println!();
            for line in outcome? {
                println!("{line}");
            }
        }
        Command::Tree => {
            for line in tracker.tree().await? {
                println!("{line}");
            }
        }
        Command::Show => print!("{}", tracker.show().await?),
    }
    Ok(())
}
