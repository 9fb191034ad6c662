//! Readiness loop: accepts connections and lends readable ones to the worker pool.
//!
//! Connections are registered edge-triggered. A connection is deregistered before it is
//! submitted, so at most one worker ever touches it; an unfinished header comes back through
//! [`ReactorLink`] and is registered again under the same token.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use intake_proto::RESPONSE_FULL;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::connection::Connection;
use crate::pool::{ReactorLink, WorkerPool};
use crate::queue::AdmissionQueue;
use crate::transfer::TransferHandle;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;
const EVENTS_CAPACITY: usize = 256;

pub(crate) struct Reactor {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    idle: HashMap<Token, Connection>,
    next_token: usize,
    returned_tx: Sender<Connection>,
    returned_rx: Receiver<Connection>,
    queue: Arc<AdmissionQueue<TransferHandle>>,
    stop: Arc<AtomicBool>,
}

impl Reactor {
    pub(crate) fn new(
        mut listener: TcpListener,
        queue: Arc<AdmissionQueue<TransferHandle>>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let poll = Poll::new().context("create poll instance")?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .context("register listener")?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).context("create waker")?);
        let (returned_tx, returned_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            poll,
            listener,
            waker,
            idle: HashMap::new(),
            next_token: FIRST_CONNECTION,
            returned_tx,
            returned_rx,
            queue,
            stop,
        })
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub(crate) fn link(&self) -> ReactorLink {
        ReactorLink::new(self.returned_tx.clone(), self.waker.clone())
    }

    /// Run until the stop flag is raised and the waker fires.
    pub(crate) fn run(&mut self, pool: &WorkerPool) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while !self.stop.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e).context("poll for readiness");
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready(),
                    WAKER => self.reclaim_returned(),
                    token => self.dispatch(token, pool),
                }
            }
        }
        tracing::info!(idle = self.idle.len(), "reactor stopped; closing idle connections");
        self.idle.clear();
        Ok(())
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if self.queue.is_full() {
            tracing::info!(peer = %peer, "admission queue full; rejecting at accept");
            // Best effort: the peer may already have sent bytes we will never read.
            let _ = stream.write_all(format!("{RESPONSE_FULL}\n").as_bytes());
            let _ = stream.shutdown(Shutdown::Write);
            return;
        }
        let token = Token(self.next_token);
        self.next_token += 1;
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            tracing::warn!(peer = %peer, error = %e, "register connection failed");
            return;
        }
        tracing::debug!(peer = %peer, token = token.0, "connection accepted");
        self.idle.insert(token, Connection::new(token, peer, stream));
    }

    fn dispatch(&mut self, token: Token, pool: &WorkerPool) {
        // Stale events for connections already lent out are expected.
        let Some(mut conn) = self.idle.remove(&token) else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            tracing::warn!(peer = %conn.peer, error = %e, "deregister connection failed");
            return;
        }
        pool.submit(conn);
    }

    fn reclaim_returned(&mut self) {
        while let Ok(mut conn) = self.returned_rx.try_recv() {
            if self.stop.load(Ordering::Acquire) {
                continue;
            }
            let token = conn.token;
            if let Err(e) = self
                .poll
                .registry()
                .register(&mut conn.stream, token, Interest::READABLE)
            {
                tracing::warn!(peer = %conn.peer, error = %e, "re-register connection failed");
                continue;
            }
            self.idle.insert(token, conn);
        }
    }
}
