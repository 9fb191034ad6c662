//! `intake-server`: accepts media uploads over TCP, queues them through a bounded admission
//! queue, and moves completed files into storage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use intake_server::cli::Args;
use intake_server::config::ServerConfig;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,intake_server=info")
        }))
        .init();

    let config = ServerConfig::from_args(&args)?;
    intake_server::runtime::run(config)
}
