//! Server assembly and lifecycle.
//!
//! [`Server::bind`] prepares directories and the listening socket; [`Server::run`] starts the
//! drain thread and worker pool, runs the reactor on the calling thread, and performs the
//! graceful shutdown once a [`ShutdownHandle`] fires.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::config::ServerConfig;
use crate::drain;
use crate::handler::Handler;
use crate::pool::WorkerPool;
use crate::queue::AdmissionQueue;
use crate::reactor::Reactor;
use crate::registry::InFlight;
use crate::storage::StorageDirs;
use crate::transfer::TransferHandle;

/// Time allowed for threads to notice aborted sockets after the grace period ran out.
const ABORT_WAIT: Duration = Duration::from_secs(2);

/// Requests a graceful stop from any thread, including a signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "failed to wake reactor for shutdown");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

pub struct Server {
    config: ServerConfig,
    local_addr: SocketAddr,
    storage: Arc<StorageDirs>,
    queue: Arc<AdmissionQueue<TransferHandle>>,
    in_flight: Arc<InFlight>,
    reactor: Reactor,
    shutdown: ShutdownHandle,
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(StorageDirs::new(&config.intake_dir, &config.storage_dir));
        storage.ensure()?;

        let listener = mio::net::TcpListener::bind(config.bind)
            .with_context(|| format!("bind {}", config.bind))?;
        let queue = Arc::new(AdmissionQueue::new(config.queue_capacity));
        let flag = Arc::new(AtomicBool::new(false));
        let reactor = Reactor::new(listener, queue.clone(), flag.clone())?;
        let local_addr = reactor.local_addr().context("listener local addr")?;
        let shutdown = ShutdownHandle {
            flag,
            waker: reactor.waker(),
        };

        Ok(Self {
            config,
            local_addr,
            storage,
            queue,
            in_flight: InFlight::new(),
            reactor,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn queue(&self) -> Arc<AdmissionQueue<TransferHandle>> {
        self.queue.clone()
    }

    /// Serve until shutdown is requested, then drain admitted uploads within the grace period.
    pub fn run(self) -> Result<()> {
        let Server {
            config,
            local_addr,
            storage,
            queue,
            in_flight,
            mut reactor,
            shutdown: _,
        } = self;

        let mut drain = drain::spawn(queue.clone(), storage.clone(), config.body_idle_timeout)?;
        let handler = Arc::new(Handler::new(
            queue.clone(),
            storage.clone(),
            in_flight.clone(),
            config.body_idle_timeout,
        ));
        let mut pool = WorkerPool::spawn(config.workers, handler, reactor.link())?;

        tracing::info!(
            bind = %local_addr,
            intake = ?storage.intake_dir(),
            storage = ?storage.storage_dir(),
            capacity = config.queue_capacity,
            workers = config.workers,
            body_idle_secs = config.body_idle_timeout.as_secs(),
            "intake server listening"
        );
        let served = reactor.run(&pool);
        if let Err(e) = &served {
            tracing::error!("reactor failed: {e:#}");
        }
        // Releases the listener; new connections are refused from here on.
        drop(reactor);

        tracing::info!(
            queued = queue.len(),
            in_flight = in_flight.len(),
            grace_secs = config.shutdown_grace.as_secs(),
            "shutting down; draining admitted uploads"
        );
        queue.close();
        let deadline = Instant::now() + config.shutdown_grace;
        let workers_done = pool.shutdown(deadline);
        let drain_done = drain.wait(deadline);

        if !(workers_done && drain_done) {
            let discarded = queue.discard();
            let aborted = in_flight.abort_all();
            tracing::warn!(discarded, aborted, "shutdown grace elapsed; aborting transfers");
            let deadline = Instant::now() + ABORT_WAIT;
            let workers_done = pool.shutdown(deadline);
            if !(drain.wait(deadline) && workers_done) {
                tracing::warn!("threads still busy after abort; leaving them behind");
            }
        }

        tracing::info!("intake server stopped");
        served
    }
}

/// Bind, install a Ctrl-C handler, and serve until interrupted.
pub fn run(config: ServerConfig) -> Result<()> {
    let server = Server::bind(config)?;
    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        if shutdown.is_requested() {
            std::process::exit(130);
        }
        shutdown.request();
    })
    .context("install Ctrl-C handler")?;
    server.run()
}
