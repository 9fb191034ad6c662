pub mod cli;
pub mod config;
pub mod connection;
pub mod queue;
pub mod runtime;
pub mod storage;
pub mod transfer;

mod drain;
mod handler;
mod pool;
mod reactor;
mod registry;

pub use config::ServerConfig;
pub use runtime::{Server, ShutdownHandle};
