//! `intake-send`: upload every file in a directory to an `intake-server`.
//!
//! Each sender thread probes the admission queue before committing a body and retries after
//! a delay while the server reports `full`.

mod library;
mod worker;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "intake-send")]
struct Args {
    /// Address of the server, e.g. 192.168.1.10:3002
    #[arg(long)]
    addr: SocketAddr,

    /// Directory to upload from (non-recursive). Defaults to current directory.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Parallel upload threads
    #[arg(long, default_value_t = 3)]
    threads: usize,

    /// Wait between attempts when the queue is full or the connection fails
    #[arg(long, default_value_t = 2000)]
    retry_delay_ms: u64,

    /// Attempts per file before giving up (0 = retry forever)
    #[arg(long, default_value_t = 0)]
    max_attempts: u32,

    /// Socket timeout in seconds (0 = none)
    #[arg(long, default_value_t = 0)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,intake_send=info")
        }))
        .init();

    let files = library::list_uploads(&args.dir)?;
    if files.is_empty() {
        tracing::info!(dir = ?args.dir, "nothing to upload");
        return Ok(());
    }
    tracing::info!(count = files.len(), addr = %args.addr, threads = args.threads, "uploading");

    let policy = worker::RetryPolicy {
        delay: Duration::from_millis(args.retry_delay_ms),
        max_attempts: args.max_attempts,
    };
    let timeout = (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs));
    worker::check_queue(args.addr, timeout);
    let summary = worker::run_uploads(args.addr, files, args.threads, policy, timeout)?;

    tracing::info!(
        stored = summary.stored,
        failed = summary.failed.len(),
        "upload run finished"
    );
    if !summary.failed.is_empty() {
        bail!("{} file(s) failed: {}", summary.failed.len(), summary.failed.join(", "));
    }
    Ok(())
}
