use std::time::Duration;

use clap::Parser;
use netstore::config::{
    DEFAULT_PORT, DEFAULT_REAP_DELAY, DEFAULT_TID_BLOCK_SIZE, DEFAULT_TXN_TIMEOUT,
};
use netstore::{MemoryStore, Server, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Networked transactional object store server.
#[derive(Debug, Parser)]
#[command(name = "netstore-server", version, about)]
struct Args {
    /// Port to listen on (0 picks an ephemeral port)
    #[arg(short, long, env = "NETSTORE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Server-side transaction timeout in milliseconds
    #[arg(long, env = "NETSTORE_TXN_TIMEOUT_MS", default_value_t = DEFAULT_TXN_TIMEOUT.as_millis() as u64)]
    txn_timeout_ms: u64,

    /// Delay between reaper sweeps in milliseconds
    #[arg(long, env = "NETSTORE_REAP_DELAY_MS", default_value_t = DEFAULT_REAP_DELAY.as_millis() as u64)]
    reap_delay_ms: u64,

    /// Transaction IDs reserved from the store per refill
    #[arg(long, env = "NETSTORE_TID_BLOCK_SIZE", default_value_t = DEFAULT_TID_BLOCK_SIZE)]
    tid_block_size: u64,

    /// Default log level when RUST_LOG is not set
    #[arg(long, env = "NETSTORE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::default()
        .with_port(args.port)
        .with_txn_timeout(Duration::from_millis(args.txn_timeout_ms))
        .with_reap_delay(Duration::from_millis(args.reap_delay_ms))
        .with_tid_block_size(args.tid_block_size);

    let server = Server::bind(config, MemoryStore::new()).await?;
    info!(addr = %server.local_addr()?, "starting netstore server");

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received interrupt");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for interrupt"),
        }
    });

    server.serve().await?;
    Ok(())
}
