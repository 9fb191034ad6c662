//! Fixed pool of worker threads fed by the reactor.
//!
//! Each job is one readable connection. A worker scans it, routes it if the header is
//! complete, or sends it back to the reactor to wait for more bytes.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::connection::Connection;
use crate::handler::Handler;

/// Return path from a worker to the reactor.
#[derive(Clone)]
pub(crate) struct ReactorLink {
    tx: Sender<Connection>,
    waker: Arc<mio::Waker>,
}

impl ReactorLink {
    pub(crate) fn new(tx: Sender<Connection>, waker: Arc<mio::Waker>) -> Self {
        Self { tx, waker }
    }

    /// Give a connection back for re-registration. Dropped if the reactor is gone.
    pub(crate) fn hand_back(&self, conn: Connection) {
        let peer = conn.peer;
        if self.tx.send(conn).is_err() {
            tracing::debug!(peer = %peer, "reactor stopped; dropping idle connection");
            return;
        }
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "reactor wake failed");
        }
    }
}

struct DoneSignal(Sender<()>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

pub(crate) struct WorkerPool {
    job_tx: Option<Sender<Connection>>,
    done_rx: Receiver<()>,
    running: usize,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(size: usize, handler: Arc<Handler>, link: ReactorLink) -> Result<Self> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Connection>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size.max(1) {
            let job_rx = job_rx.clone();
            let handler = handler.clone();
            let link = link.clone();
            let done = DoneSignal(done_tx.clone());
            let join = std::thread::Builder::new()
                .name(format!("intake-worker-{i}"))
                .spawn(move || {
                    let _done = done;
                    worker_main(&job_rx, &handler, &link);
                })
                .with_context(|| format!("spawn worker {i}"))?;
            workers.push(join);
        }
        tracing::debug!(workers = workers.len(), "worker pool started");
        Ok(Self {
            job_tx: Some(job_tx),
            done_rx,
            running: workers.len(),
            workers,
        })
    }

    /// Queue a readable connection. After shutdown has begun the connection is dropped.
    pub(crate) fn submit(&self, conn: Connection) {
        let Some(tx) = self.job_tx.as_ref() else {
            return;
        };
        if let Err(e) = tx.send(conn) {
            tracing::debug!(peer = %e.0.peer, "worker pool closed; dropping connection");
        }
    }

    /// Stop accepting jobs and wait for workers to finish what they hold, up to `deadline`.
    ///
    /// Returns `true` once every worker has exited. May be called again after a timeout.
    pub(crate) fn shutdown(&mut self, deadline: Instant) -> bool {
        self.job_tx = None;
        while self.running > 0 {
            match self.done_rx.recv_deadline(deadline) {
                Ok(()) => self.running -= 1,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(busy = self.running, "workers still busy at deadline");
                    return false;
                }
                Err(RecvTimeoutError::Disconnected) => self.running = 0,
            }
        }
        for join in self.workers.drain(..) {
            if join.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        true
    }
}

fn worker_main(jobs: &Receiver<Connection>, handler: &Handler, link: &ReactorLink) {
    for conn in jobs.iter() {
        if let Some(conn) = handler.on_readable(conn) {
            link.hand_back(conn);
        }
    }
}
