//! Blocking client side of the protocol, one connection per call.
//!
//! Used by `intake-send` and by the server's end-to-end tests.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::{FILES_MARKER, QUEUE_CHECK, RESPONSE_FULL, RESPONSE_OK, Request, parse_received};

/// Server answer to a `queuecheck` probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Available,
    Full,
}

/// Result of one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored; carries the name echoed by the server.
    Received(String),
    /// Admission queue full; try again later.
    Full,
    /// Connection closed without a response (ignored name, server shutting down).
    NoReply,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Applied to connect and to every socket read/write. `None` blocks indefinitely.
    pub timeout: Option<Duration>,
    /// Probe the queue on the same connection before committing to the body.
    pub probe_first: bool,
}

fn connect(addr: SocketAddr, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let stream = match timeout {
        Some(t) => TcpStream::connect_timeout(&addr, t)?,
        None => TcpStream::connect(addr)?,
    };
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;
    stream.set_nodelay(true).ok(); // best-effort
    Ok(stream)
}

fn read_status_line(reader: &mut impl BufRead) -> io::Result<QueueStatus> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    match line.trim() {
        s if s.eq_ignore_ascii_case(RESPONSE_FULL) => Ok(QueueStatus::Full),
        RESPONSE_OK => Ok(QueueStatus::Available),
        "" => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before probe reply",
        )),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected probe reply {other:?}"),
        )),
    }
}

/// Ask the server whether an upload would currently be admitted.
pub fn queue_check(addr: SocketAddr, timeout: Option<Duration>) -> io::Result<QueueStatus> {
    let stream = connect(addr, timeout)?;
    (&stream).write_all(format!("{QUEUE_CHECK}\n").as_bytes())?;
    let mut reader = BufReader::new(&stream);
    read_status_line(&mut reader)
}

/// Upload `body` as `name` and wait for the server's verdict.
///
/// The body ends when `body` is exhausted; the write side is then shut down and the reply
/// is read until the server closes.
pub fn send_file(
    addr: SocketAddr,
    name: &str,
    body: &mut impl Read,
    opts: &SendOptions,
) -> io::Result<PutOutcome> {
    let header = Request::Put {
        name: name.to_string(),
    }
    .to_header_line()?;
    let stream = connect(addr, opts.timeout)?;
    let mut reader = BufReader::new(&stream);

    if opts.probe_first {
        (&stream).write_all(format!("{QUEUE_CHECK}\n").as_bytes())?;
        if read_status_line(&mut reader)? == QueueStatus::Full {
            return Ok(PutOutcome::Full);
        }
    }

    (&stream).write_all(header.as_bytes())?;
    io::copy(body, &mut &stream)?;
    stream.shutdown(Shutdown::Write)?;

    let mut reply = String::new();
    reader.read_to_string(&mut reply)?;
    let reply = reply.trim();
    if reply.is_empty() {
        return Ok(PutOutcome::NoReply);
    }
    if reply.eq_ignore_ascii_case(RESPONSE_FULL) {
        return Ok(PutOutcome::Full);
    }
    match parse_received(reply) {
        Some(stored) => Ok(PutOutcome::Received(stored.to_string())),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected upload reply {reply:?}"),
        )),
    }
}

/// List file names known to the server.
///
/// A connection closed without the `Files:` marker (admission rejected) is an error.
pub fn list_files(
    addr: SocketAddr,
    filter: Option<&str>,
    timeout: Option<Duration>,
) -> io::Result<Vec<String>> {
    let header = Request::List {
        filter: filter.map(str::to_string),
    }
    .to_header_line()?;
    let stream = connect(addr, timeout)?;
    (&stream).write_all(header.as_bytes())?;

    let reader = BufReader::new(&stream);
    let mut lines = reader.lines();
    match lines.next().transpose()? {
        Some(marker) if marker.trim_end() == FILES_MARKER => {}
        Some(other) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected listing reply {other:?}"),
            ));
        }
        None => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before listing",
            ));
        }
    }

    let mut names = Vec::new();
    for line in lines {
        let line = line?;
        let name = line.trim_end();
        if !name.is_empty() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Download `name` into `out`, returning the byte count (0 for a miss).
pub fn fetch_file(
    addr: SocketAddr,
    name: &str,
    out: &mut impl Write,
    timeout: Option<Duration>,
) -> io::Result<u64> {
    let header = Request::Get {
        name: name.to_string(),
    }
    .to_header_line()?;
    let stream = connect(addr, timeout)?;
    (&stream).write_all(header.as_bytes())?;
    io::copy(&mut &stream, out)
}
