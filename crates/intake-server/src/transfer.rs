//! Transfer handles: one accepted upload waiting in, or leaving, the admission queue.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use intake_proto::{BODY_CHUNK_LEN, FileName, RESPONSE_FULL, received_line};

use crate::connection::Phase;
use crate::registry::Tracked;

/// An upload whose header has been parsed and whose body is still on the wire.
///
/// The handle owns the client socket outright; whoever holds the handle is the only one
/// touching the connection.
pub struct TransferHandle {
    header: String,
    name: FileName,
    peer: SocketAddr,
    stream: TcpStream,
    leftover: Vec<u8>,
    bytes_written: u64,
    phase: Phase,
    tracked: Option<Tracked>,
}

impl TransferHandle {
    pub(crate) fn new(
        header: String,
        name: FileName,
        peer: SocketAddr,
        stream: TcpStream,
        leftover: Vec<u8>,
        tracked: Option<Tracked>,
    ) -> Self {
        Self {
            header,
            name,
            peer,
            stream,
            leftover,
            bytes_written: 0,
            phase: Phase::HeaderComplete,
            tracked,
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn file_name(&self) -> &FileName {
        &self.name
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn leftover_len(&self) -> usize {
        self.leftover.len()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Bound how long a single body read may wait for bytes.
    pub(crate) fn set_idle_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))
    }

    /// Copy the rest of the body into `out` until the peer closes its write side.
    ///
    /// Bytes read past the header go first. Returns the total byte count; on error,
    /// [`bytes_written`](Self::bytes_written) tells how far it got.
    pub(crate) fn receive_into(&mut self, out: &mut impl Write) -> io::Result<u64> {
        self.phase.advance(Phase::BodyInFlight);
        if !self.leftover.is_empty() {
            out.write_all(&self.leftover)?;
            self.bytes_written += self.leftover.len() as u64;
            self.leftover = Vec::new();
        }

        let mut buf = vec![0u8; BODY_CHUNK_LEN];
        loop {
            let n = match self.stream.read(&mut buf) {
                Ok(0) if self.tracked.as_ref().is_some_and(Tracked::aborted) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "transfer aborted by shutdown",
                    ));
                }
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            out.write_all(&buf[..n])?;
            self.bytes_written += n as u64;
        }
        out.flush()?;
        Ok(self.bytes_written)
    }

    /// Send `Received: <name>` and close.
    pub(crate) fn acknowledge(self) -> io::Result<()> {
        let line = received_line(self.name.as_str());
        let result = (&self.stream).write_all(line.as_bytes());
        self.close();
        result
    }

    /// Tell the client to try again later, then close.
    pub(crate) fn reject_full(self) {
        let _ = (&self.stream).write_all(format!("{RESPONSE_FULL}\n").as_bytes());
        self.close();
    }

    /// Release the connection without a response.
    pub(crate) fn close(mut self) {
        self.phase.advance(Phase::Closed);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHandle")
            .field("header", &self.header)
            .field("peer", &self.peer)
            .field("leftover", &self.leftover.len())
            .field("bytes_written", &self.bytes_written)
            .field("phase", &self.phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn handle_with_client(leftover: &[u8]) -> (TransferHandle, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        let handle = TransferHandle::new(
            "fileput:clip.mp4".to_string(),
            FileName::parse("clip.mp4").unwrap(),
            peer,
            server,
            leftover.to_vec(),
            None,
        );
        (handle, client)
    }

    #[test]
    fn receive_into_writes_leftover_then_stream_until_eof() {
        let (mut handle, mut client) = handle_with_client(b"head-");
        let writer = std::thread::spawn(move || {
            client.write_all(&[7u8; 20_000]).unwrap();
            client.shutdown(Shutdown::Write).unwrap();
            let mut reply = String::new();
            client.read_to_string(&mut reply).unwrap();
            reply
        });

        let mut out = Vec::new();
        let n = handle.receive_into(&mut out).unwrap();
        assert_eq!(n, 5 + 20_000);
        assert_eq!(&out[..5], b"head-");
        assert!(out[5..].iter().all(|b| *b == 7));
        assert_eq!(handle.bytes_written(), n);
        assert_eq!(handle.phase(), Phase::BodyInFlight);

        handle.acknowledge().unwrap();
        assert_eq!(writer.join().unwrap(), "Received: clip.mp4\n");
    }

    #[test]
    fn eof_after_abort_is_reported_as_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        let registry = crate::registry::InFlight::new();
        let tracked = registry.track(&server);
        let mut handle = TransferHandle::new(
            "fileput:cut.mp4".to_string(),
            FileName::parse("cut.mp4").unwrap(),
            peer,
            server,
            b"partial".to_vec(),
            tracked,
        );

        registry.abort_all();
        assert!(handle.receive_into(&mut Vec::new()).is_err());
        assert_eq!(handle.bytes_written(), 7);
    }

    #[test]
    fn idle_timeout_ends_a_stalled_body() {
        let (mut handle, mut client) = handle_with_client(b"");
        client.write_all(b"abc").unwrap();
        handle.set_idle_timeout(Duration::from_millis(100)).unwrap();

        let mut out = Vec::new();
        let err = handle.receive_into(&mut out).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
        assert_eq!(out, b"abc");
        assert_eq!(handle.bytes_written(), 3);
    }

    #[test]
    fn reject_full_sends_token() {
        let (handle, mut client) = handle_with_client(b"");
        handle.reject_full();
        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "full\n");
    }
}
