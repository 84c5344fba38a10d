//! shelfd: serve one field-map store over TCP.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shelfstore_core::{Config, FieldStore, OpenFlags, ShelfError, ShelfResult, Store};
use shelfstore_remote::{Server, ServerConfig, DEFAULT_MAX_FRAME};

#[derive(Parser)]
#[command(name = "shelfd", version, about = "Serve a shelfstore database over TCP")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on (0 picks a free one)
    #[arg(long, default_value_t = 1978)]
    port: u16,
    /// Database file; created if missing. Without it the store lives in memory.
    #[arg(long)]
    db: Option<PathBuf>,
    /// Skip the per-write fsync; records reach disk on sync or close
    #[arg(long)]
    buffered: bool,
    /// Largest request payload in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME)]
    max_frame: usize,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn run(cli: Cli) -> ShelfResult<()> {
    let config = if cli.buffered { Config::buffered() } else { Config::durable() };
    let store: FieldStore = match &cli.db {
        Some(path) => Store::open_with(path, OpenFlags::WRITER | OpenFlags::CREATE, config)?,
        None => Store::memory_with(config)?,
    };

    let server_config = ServerConfig {
        max_frame: cli.max_frame,
        ..ServerConfig::default()
    };
    server_config.validate().map_err(ShelfError::invalid)?;
    let listener = TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .map_err(|e| ShelfError::connectivity(format!("bind failed: {}", e)))?;
    info!(addr = %listener.local_addr()?, db = ?cli.db, "shelfd ready");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutting down");
    };
    Server::serve(listener, Arc::new(store), server_config, shutdown).await
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "shelfd failed");
            ExitCode::FAILURE
        }
    }
}
