//! WALT log relay entry point.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio::signal;
use tracing::{error, info};
use walt_common::{config::DEFAULT_CONFIG_PATH, open_store, WaltConfig};
use walt_logd::client::{self, dial_addr, format_record};
use walt_logd::{format_timestamp, CheckpointBook, RelayServer, SubscribeParams};

type CliResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Relay, store and replay WALT node logs
#[derive(Parser, Debug)]
#[command(name = "walt-logd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay
    Serve,
    /// Manage named timestamps
    Checkpoint {
        /// Owner of the checkpoints
        #[arg(short, long, env = "USER")]
        user: String,

        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Print records from the relay
    Tail {
        /// Replay records from this timestamp or checkpoint
        #[arg(long)]
        since: Option<String>,

        /// Stop the replay at this timestamp or checkpoint
        #[arg(long, requires = "since")]
        until: Option<String>,

        /// Exit after the replay
        #[arg(long)]
        no_realtime: bool,

        /// Sender device names
        #[arg(short, long = "sender", required = true)]
        senders: Vec<String>,

        /// Regular expression on stream names
        #[arg(long)]
        streams: Option<String>,

        /// Resolve checkpoint names for this user
        #[arg(short, long, env = "USER", default_value = "")]
        user: String,
    },
    /// Forward standard input lines to the relay
    Send {
        /// Stream name
        #[arg(long)]
        stream: String,
    },
}

#[derive(Subcommand, Debug)]
enum CheckpointAction {
    /// Save a checkpoint
    Add {
        name: String,
        /// RFC 3339 timestamp, now if omitted
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Delete a checkpoint
    Remove { name: String },
    /// List checkpoints
    List,
    /// Print the timestamp of a checkpoint
    Show { name: String },
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
async fn main() -> CliResult<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %e, "walt-logd: command failed");
            Err(e)
        }
    }
}

async fn run(args: Args) -> CliResult<()> {
    let config = WaltConfig::load_or_default(&args.config)?;
    config.validate()?;
    let relay = &config.relay;

    match args.command {
        Command::Serve => {
            let store = open_store(&config.database).await?;
            let server = RelayServer::bind(store, relay).await?;
            info!("walt-logd: starting");
            server
                .run(async {
                    if signal::ctrl_c().await.is_ok() {
                        info!("walt-logd: Received SIGINT");
                    }
                })
                .await?;
        }
        Command::Checkpoint { user, action } => {
            let book = CheckpointBook::new(open_store(&config.database).await?);
            match action {
                CheckpointAction::Add { name, at } => {
                    let checkpoint = book.add(&user, &name, at).await?;
                    println!("{} {}", checkpoint.name, format_timestamp(checkpoint.timestamp));
                }
                CheckpointAction::Remove { name } => book.remove(&user, &name).await?,
                CheckpointAction::List => {
                    for checkpoint in book.list(&user).await? {
                        println!("{} {}", checkpoint.name, format_timestamp(checkpoint.timestamp));
                    }
                }
                CheckpointAction::Show { name } => println!("{}", book.lookup(&user, &name).await?),
            }
        }
        Command::Tail {
            since,
            until,
            no_realtime,
            senders,
            streams,
            user,
        } => {
            let history = match since {
                Some(since) => {
                    let book = CheckpointBook::new(open_store(&config.database).await?);
                    let start = book.resolve_boundary(&user, &since).await?;
                    let end = match until {
                        Some(until) => book.resolve_boundary(&user, &until).await?,
                        None => Utc::now(),
                    };
                    Some((start, end))
                }
                None => None,
            };
            let params = SubscribeParams {
                history,
                realtime: !no_realtime,
                senders: senders.into_iter().collect::<BTreeSet<_>>(),
                streams,
            };
            client::tail(
                dial_addr(relay.subscriber_listen),
                &params,
                relay.max_frame_length,
                |record| println!("{}", format_record(&record)),
            )
            .await?;
        }
        Command::Send { stream } => {
            let input = BufReader::new(tokio::io::stdin());
            client::send(
                dial_addr(relay.producer_listen),
                &stream,
                input,
                relay.max_frame_length,
            )
            .await?;
        }
    }
    Ok(())
}
