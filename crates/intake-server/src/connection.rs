//! Per-connection header state machine.
//!
//! A [`Connection`] lives on the reactor while it waits for bytes and is lent to a worker
//! whenever it becomes readable. The worker scans as far as the socket allows and either
//! finishes the header or hands the connection back for the next readiness event.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use intake_proto::{HEADER_MAX_LEN, HeaderScanner, is_queue_check};
use mio::Token;
use mio::net::TcpStream;

const REPLY_WRITE_ATTEMPTS: u32 = 50;
const REPLY_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    AwaitingHeader,
    HeaderComplete,
    BodyInFlight,
    Closed,
}

impl Phase {
    /// Move to `next`; requests to go backwards are ignored.
    pub(crate) fn advance(&mut self, next: Phase) {
        debug_assert!(next >= *self, "phase regression {self:?} -> {next:?}");
        if next > *self {
            *self = next;
        }
    }
}

/// Outcome of one scanning pass over a readable socket.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HeaderPoll {
    /// Socket drained without a terminator; wait for more bytes.
    Pending,
    /// A `queuecheck` probe arrived; scanning may continue afterwards.
    Probe,
    /// Header line complete (terminator stripped).
    Complete(String),
    /// Peer closed before sending a terminator.
    Eof,
}

pub(crate) struct Connection {
    pub(crate) token: Token,
    pub(crate) peer: SocketAddr,
    pub(crate) stream: TcpStream,
    scanner: HeaderScanner,
    phase: Phase,
}

impl Connection {
    pub(crate) fn new(token: Token, peer: SocketAddr, stream: TcpStream) -> Self {
        Self {
            token,
            peer,
            stream,
            scanner: HeaderScanner::new(),
            phase: Phase::AwaitingHeader,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Read until the socket would block, a line completes, or the peer closes.
    ///
    /// Lines already buffered from an earlier read are returned before touching the socket.
    pub(crate) fn poll_header(&mut self) -> io::Result<HeaderPoll> {
        let mut buf = [0u8; HEADER_MAX_LEN];
        loop {
            if let Some(line) = self.scanner.next_line()? {
                if is_queue_check(&line) {
                    return Ok(HeaderPoll::Probe);
                }
                self.phase.advance(Phase::HeaderComplete);
                return Ok(HeaderPoll::Complete(line));
            }
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.phase.advance(Phase::Closed);
                    return Ok(HeaderPoll::Eof);
                }
                Ok(n) => self.scanner.push(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(HeaderPoll::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Answer a queue check on the still non-blocking socket.
    ///
    /// A full send buffer is retried for a bounded time, then reported as `TimedOut`.
    pub(crate) fn reply_line(&mut self, reply: &str) -> io::Result<()> {
        let line = format!("{reply}\n");
        let mut pending = line.as_bytes();
        let mut stalls = 0u32;
        while !pending.is_empty() {
            match self.stream.write(pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => pending = &pending[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    stalls += 1;
                    if stalls >= REPLY_WRITE_ATTEMPTS {
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                    thread::sleep(REPLY_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Switch to blocking I/O for routing, keeping bytes read past the header.
    pub(crate) fn into_blocking(self) -> io::Result<(std::net::TcpStream, Vec<u8>)> {
        debug_assert_eq!(self.phase, Phase::HeaderComplete);
        let stream = std::net::TcpStream::from(self.stream);
        stream.set_nonblocking(false)?;
        Ok((stream, self.scanner.into_leftover()))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token)
            .field("peer", &self.peer)
            .field("phase", &self.phase)
            .field("buffered", &self.scanner.buffered().len())
            .finish()
    }
}
