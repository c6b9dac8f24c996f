//! Capwire RPC Server - hosts the example handlers over a capwire connection server.
//!
//! The bound port is printed to stdout so a parent process can connect.

mod handlers;
mod server;

use anyhow::Result;
use capwire_core::ProtocolConfig;
use clap::Parser;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "capwire-rpc")]
#[command(about = "Capability RPC server")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value_t = ProtocolConfig::DEFAULT_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = ProtocolConfig::DEFAULT_HOST)]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Interval of the status-api heartbeat event in milliseconds (0 = disabled)
    #[arg(long, default_value = "1000")]
    heartbeat_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Capwire RPC Server");

    let heartbeat = (args.heartbeat_ms > 0).then(|| Duration::from_millis(args.heartbeat_ms));
    let mut handle = server::start_server(&args.host, args.port, heartbeat).await?;

    // Print port for the parent process to read (intentional stdout for IPC)
    println!("CAPWIRE_PORT={}", handle.port());

    info!("RPC server running on {}", handle.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown();

    Ok(())
}
