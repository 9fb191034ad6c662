//! Configuration loading and validation.
//!
//! The TOML file and the CLI are both optional layers; they are merged once at startup into
//! a typed [`ServerConfig`] so nothing downstream deals with missing or malformed keys.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::cli::Args;

pub const DEFAULT_PORT: u16 = 3002;
pub const DEFAULT_QUEUE_CAPACITY: usize = 5;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);
pub const DEFAULT_BODY_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_INTAKE_DIR: &str = "upload_videos";
const DEFAULT_STORAGE_DIR: &str = "stored_videos";

/// Server configuration as it appears on disk.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfigFile {
    /// Listen address (host:port).
    pub bind: Option<String>,
    /// Listen port; overrides the port in `bind`.
    pub port: Option<u16>,
    /// Scratch directory for uploads in progress.
    pub intake_dir: Option<PathBuf>,
    /// Final storage directory.
    pub storage_dir: Option<PathBuf>,
    /// Admission queue capacity.
    pub queue_capacity: Option<usize>,
    /// Worker pool size.
    pub workers: Option<usize>,
    /// Shutdown grace period in seconds.
    pub shutdown_grace_secs: Option<u64>,
    /// Seconds an upload body may stall before the transfer is dropped.
    pub body_idle_timeout_secs: Option<u64>,
}

impl ServerConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<ServerConfigFile>(raw)?)
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub intake_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub queue_capacity: usize,
    pub workers: usize,
    pub shutdown_grace: Duration,
    /// Longest silence tolerated while reading an upload body.
    pub body_idle_timeout: Duration,
}

impl ServerConfig {
    /// Defaults rooted at the given directories; handy for embedding and tests.
    pub fn with_dirs(intake_dir: impl Into<PathBuf>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            intake_dir: intake_dir.into(),
            storage_dir: storage_dir.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            body_idle_timeout: DEFAULT_BODY_IDLE_TIMEOUT,
        }
    }

    /// Load the optional config file named by `args` and merge the CLI on top.
    pub fn from_args(args: &Args) -> Result<Self> {
        let file = match args.config.as_deref() {
            Some(path) => ServerConfigFile::load(path)?,
            None => ServerConfigFile::default(),
        };
        Self::resolve(args, &file)
    }

    /// Merge layers (CLI over file over defaults) and validate the result.
    pub fn resolve(args: &Args, file: &ServerConfigFile) -> Result<Self> {
        let mut bind = match (args.bind, file.bind.as_deref()) {
            (Some(addr), _) => addr,
            (None, Some(raw)) => raw
                .parse()
                .with_context(|| format!("parse bind {raw:?}"))?,
            (None, None) => SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
        };
        if let Some(port) = args.port.or(file.port) {
            bind.set_port(port);
        }

        let intake_dir = args
            .intake_dir
            .clone()
            .or_else(|| file.intake_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INTAKE_DIR));
        let storage_dir = args
            .storage_dir
            .clone()
            .or_else(|| file.storage_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));

        let cfg = Self {
            bind,
            intake_dir,
            storage_dir,
            queue_capacity: args
                .queue_capacity
                .or(file.queue_capacity)
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            workers: args.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS),
            shutdown_grace: args
                .shutdown_grace_secs
                .or(file.shutdown_grace_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE),
            body_idle_timeout: args
                .body_idle_timeout_secs
                .or(file.body_idle_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_BODY_IDLE_TIMEOUT),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be at least 1"));
        }
        if self.workers == 0 {
            return Err(anyhow!("workers must be at least 1"));
        }
        if self.body_idle_timeout.is_zero() {
            return Err(anyhow!("body_idle_timeout_secs must be at least 1"));
        }
        if self.intake_dir.as_os_str().is_empty() {
            return Err(anyhow!("intake_dir must not be empty"));
        }
        if self.storage_dir.as_os_str().is_empty() {
            return Err(anyhow!("storage_dir must not be empty"));
        }
        if self.intake_dir == self.storage_dir {
            return Err(anyhow!(
                "intake_dir and storage_dir must differ (both {:?})",
                self.intake_dir
            ));
        }
        Ok(())
    }
}
