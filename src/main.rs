mod check;
mod coalescer;
mod config;
mod controller;
mod engine;
mod error;
mod filter;
mod jsonrpc;
mod scope;
mod server;
mod source;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use config::Config;
use server::InspectServer;

#[tokio::main]
async fn main() -> Result<()> {
    // The config file may set the log level, so merge it before logging starts
    let config = Config::parse().with_file_config();

    tracing_subscriber::fmt()
        .with_env_filter(config.log_filter())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("auto-inspect starting with config: {:?}", config);

    let mut server = InspectServer::new(config)?;
    server.run().await?;

    Ok(())
}
