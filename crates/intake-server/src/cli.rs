use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

/// Command-line overrides; anything left unset falls back to the config file, then defaults.
#[derive(Parser, Debug, Default)]
#[command(name = "intake-server", version = VERSION)]
pub struct Args {
    /// Optional server config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:3002
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Listen port (replaces only the port of the bind address)
    #[arg(long)]
    pub port: Option<u16>,

    /// Scratch directory for uploads in progress or queued
    #[arg(long)]
    pub intake_dir: Option<PathBuf>,

    /// Final storage directory for completed uploads
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Admission queue capacity (uploads waiting for the drain thread)
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Worker threads parsing headers and serving list/get requests
    #[arg(long)]
    pub workers: Option<usize>,

    /// Seconds to wait for in-flight work on shutdown before aborting it
    #[arg(long)]
    pub shutdown_grace_secs: Option<u64>,

    /// Seconds an upload body may go silent before the transfer is dropped
    #[arg(long)]
    pub body_idle_timeout_secs: Option<u64>,
}
