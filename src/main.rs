use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;

use chain_ingest::cmd;
use chain_ingest::shutdown::Shutdown;

#[derive(Parser, Debug)]
#[command(
    name = "chain-ingest",
    about = "Continuous ClickHouse ingestion and derivation pipeline for EVM and P-chain networks."
)]
struct Cli {
    #[arg(
        short,
        long,
        global = true,
        default_value = "config.yaml",
        help = "Path to the chain configuration file"
    )]
    config: String,

    #[arg(long, global = true, help = "Start log with debug", default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the continuous ingestion process
    Ingest {
        #[arg(long, help = "Skip all indexers (incremental and metrics)")]
        fast: bool,
    },
    /// Fill the RPC cache at max speed (no ClickHouse)
    Cache,
    /// Show ClickHouse table sizes and disk usage
    Size,
    /// Check for duplicate records in raw tables
    Duplicates,
    /// Drop calculated tables (keeps raw_* and sync_watermark)
    Wipe {
        #[arg(long, help = "Drop all tables including raw_* tables")]
        all: bool,
        #[arg(long, help = "Wipe data for a specific chain ID only")]
        chain: Option<u32>,
        #[arg(long, help = "Wipe P-chain calculated tables only")]
        pchain: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(level)
        .init()
        .expect("logger initialises once");

    dotenv().ok();

    let shutdown = Arc::new(Shutdown::new());
    spawn_signal_handler(shutdown.clone());

    let result = match cli.command {
        Command::Ingest { fast } => cmd::run_ingest(&cli.config, fast, shutdown.clone()).await,
        Command::Cache => cmd::run_cache(&cli.config, shutdown.clone()).await,
        Command::Size => cmd::run_size().await,
        Command::Duplicates => cmd::run_duplicates().await,
        Command::Wipe { all, chain, pchain } => cmd::run_wipe(all, chain, pchain).await,
    };

    if let Err(err) = result {
        error!("{err:#}");
        std::process::exit(1);
    }

    // Loops only stop when a termination signal asked them to.
    if shutdown.is_triggered() {
        std::process::exit(1);
    }
}

fn spawn_signal_handler(shutdown: Arc<Shutdown>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler installs");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received - shutting down"),
                _ = sigterm.recv() => info!("SIGTERM received - shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received - shutting down");
        }

        shutdown.trigger();
    });
}
