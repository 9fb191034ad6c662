//! Worker-side request handling: header scanning and protocol routing.

use std::fs::File;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use intake_proto::{FILES_MARKER, FileName, RESPONSE_FULL, RESPONSE_OK, Request, parse_request};

use crate::connection::{Connection, HeaderPoll};
use crate::queue::{AdmissionQueue, RejectReason};
use crate::registry::InFlight;
use crate::storage::StorageDirs;
use crate::transfer::TransferHandle;

pub(crate) struct Handler {
    queue: Arc<AdmissionQueue<TransferHandle>>,
    storage: Arc<StorageDirs>,
    in_flight: Arc<InFlight>,
    body_idle_timeout: Duration,
}

impl Handler {
    pub(crate) fn new(
        queue: Arc<AdmissionQueue<TransferHandle>>,
        storage: Arc<StorageDirs>,
        in_flight: Arc<InFlight>,
        body_idle_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            storage,
            in_flight,
            body_idle_timeout,
        }
    }

    /// Advance a readable connection.
    ///
    /// Returns the connection when it needs more bytes; the caller hands it back to the
    /// reactor. Everything else ends here, with the connection either routed or dropped.
    pub(crate) fn on_readable(&self, mut conn: Connection) -> Option<Connection> {
        let peer = conn.peer;
        loop {
            match conn.poll_header() {
                Ok(HeaderPoll::Pending) => return Some(conn),
                Ok(HeaderPoll::Probe) => {
                    let reply = if self.queue.is_full() {
                        RESPONSE_FULL
                    } else {
                        RESPONSE_OK
                    };
                    tracing::debug!(peer = %peer, reply, "queue probe");
                    if let Err(e) = conn.reply_line(reply) {
                        tracing::warn!(peer = %peer, error = %e, "probe reply failed");
                        return None;
                    }
                }
                Ok(HeaderPoll::Complete(line)) => {
                    self.route(conn, line);
                    return None;
                }
                Ok(HeaderPoll::Eof) => {
                    tracing::debug!(
                        peer = %peer,
                        phase = ?conn.phase(),
                        "connection closed before header terminator"
                    );
                    return None;
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    tracing::warn!(peer = %peer, error = %e, "malformed header; closing");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "header read failed");
                    return None;
                }
            }
        }
    }

    fn route(&self, conn: Connection, line: String) {
        let peer = conn.peer;
        let request = match parse_request(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(peer = %peer, header = %line, error = %e, "unknown header; closing");
                return;
            }
        };
        let (stream, leftover) = match conn.into_blocking() {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "switch to blocking mode failed");
                return;
            }
        };

        let result = match request {
            Request::Put { name } => {
                self.admit_upload(line, &name, peer, stream, leftover);
                Ok(())
            }
            Request::List { filter } => self.send_listing(stream, filter.as_deref()),
            Request::Get { name } => self.send_file(stream, &name, peer),
        };
        if let Err(e) = result {
            tracing::warn!(peer = %peer, error = %e, "request failed");
        }
    }

    fn admit_upload(
        &self,
        header: String,
        raw_name: &str,
        peer: SocketAddr,
        stream: TcpStream,
        leftover: Vec<u8>,
    ) {
        let name = match FileName::parse(raw_name) {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(peer = %peer, name = raw_name, error = %e, "rejected upload file name");
                return;
            }
        };
        if name.is_reserved() {
            match self.discard_body(stream) {
                Ok(bytes) => {
                    tracing::debug!(peer = %peer, file = %name, bytes, "ignored reserved file name")
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, file = %name, error = %e, "reserved upload cut short")
                }
            }
            return;
        }

        let file = name.to_string();
        let tracked = self.in_flight.track(&stream);
        let handle = TransferHandle::new(header, name, peer, stream, leftover, tracked);
        match self.queue.try_enqueue(handle) {
            Ok(()) => {
                tracing::info!(
                    peer = %peer,
                    file = %file,
                    queued = self.queue.len(),
                    capacity = self.queue.capacity(),
                    "upload admitted"
                );
            }
            Err(rejected) => {
                let reason = rejected.reason;
                let handle = rejected.into_inner();
                match reason {
                    RejectReason::Full => tracing::info!(
                        peer = %peer,
                        file = %handle.file_name(),
                        "admission queue full; rejecting upload"
                    ),
                    RejectReason::Closed => tracing::info!(
                        peer = %peer,
                        file = %handle.file_name(),
                        "shutting down; rejecting upload"
                    ),
                }
                handle.reject_full();
            }
        }
    }

    /// Read an unwanted body to EOF so the close is orderly, then shut the socket down.
    fn discard_body(&self, mut stream: TcpStream) -> io::Result<u64> {
        let _tracked = self.in_flight.track(&stream);
        stream.set_read_timeout(Some(self.body_idle_timeout))?;
        let bytes = io::copy(&mut stream, &mut io::sink())?;
        let _ = stream.shutdown(Shutdown::Both);
        Ok(bytes)
    }

    fn send_listing(&self, mut stream: TcpStream, filter: Option<&str>) -> Result<()> {
        let _tracked = self.in_flight.track(&stream);
        let names = self.storage.list(filter)?;
        let mut body = format!("{FILES_MARKER}\n");
        for name in &names {
            body.push_str(name);
            body.push('\n');
        }
        stream.write_all(body.as_bytes()).context("write listing")?;
        let _ = stream.shutdown(Shutdown::Both);
        tracing::debug!(count = names.len(), filter = ?filter, "listing sent");
        Ok(())
    }

    fn send_file(&self, mut stream: TcpStream, raw_name: &str, peer: SocketAddr) -> Result<()> {
        let _tracked = self.in_flight.track(&stream);
        let name = FileName::parse(raw_name)
            .with_context(|| format!("fileget name {raw_name:?}"))?;
        let Some(path) = self.storage.locate(&name) else {
            tracing::info!(peer = %peer, file = %name, "fileget miss");
            return Ok(());
        };
        let mut file = File::open(&path).with_context(|| format!("open {:?}", path))?;
        let sent = io::copy(&mut file, &mut stream).context("stream file")?;
        let _ = stream.shutdown(Shutdown::Both);
        tracing::info!(peer = %peer, file = %name, bytes = sent, "fileget served");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Token;
    use std::io::Read;

    struct Fixture {
        _root: tempfile::TempDir,
        handler: Handler,
        queue: Arc<AdmissionQueue<TransferHandle>>,
        storage: Arc<StorageDirs>,
    }

    fn fixture(capacity: usize) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageDirs::new(
            root.path().join("intake"),
            root.path().join("store"),
        ));
        storage.ensure().unwrap();
        let queue = Arc::new(AdmissionQueue::new(capacity));
        let handler = Handler::new(
            queue.clone(),
            storage.clone(),
            InFlight::new(),
            Duration::from_secs(10),
        );
        Fixture {
            _root: root,
            handler,
            queue,
            storage,
        }
    }

    /// Write `request`, close the write side, and drive the handler until it lets go.
    fn drive(handler: &Handler, request: &[u8]) -> std::net::TcpStream {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        client.write_all(request).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let mut conn = Connection::new(Token(2), peer, mio::net::TcpStream::from_std(server));
        for _ in 0..200 {
            match handler.on_readable(conn) {
                Some(back) => {
                    conn = back;
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                None => return client,
            }
        }
        panic!("handler never finished");
    }

    #[test]
    fn put_is_enqueued_with_leftover() {
        let fx = fixture(2);
        let _client = drive(&fx.handler, b"fileput:clip.mp4\nBODY");
        assert_eq!(fx.queue.len(), 1);
        let handle = fx.queue.dequeue().unwrap();
        assert_eq!(handle.file_name().as_str(), "clip.mp4");
        assert_eq!(handle.header(), "fileput:clip.mp4");
        assert!(handle.leftover_len() <= 4);
    }

    #[test]
    fn put_rejected_when_queue_full() {
        let fx = fixture(1);
        let _first = drive(&fx.handler, b"fileput:a.mp4\n");
        let mut second = drive(&fx.handler, b"fileput:b.mp4\n");
        let mut reply = String::new();
        second.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "full\n");
        assert_eq!(fx.queue.len(), 1);
        assert!(!fx.storage.intake_path(&FileName::parse("b.mp4").unwrap()).exists());
    }

    #[test]
    fn traversal_and_reserved_names_are_not_enqueued() {
        let fx = fixture(4);
        let _a = drive(&fx.handler, b"fileput:../escape.mp4\n");
        let _b = drive(&fx.handler, b"fileput:.DS_Store\n");
        assert!(fx.queue.is_empty());
    }

    #[test]
    fn reserved_upload_body_is_consumed_before_close() {
        let fx = fixture(4);
        let mut request = b"fileput:Thumbs.db\n".to_vec();
        request.extend(std::iter::repeat_n(0xAB, 300_000));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let writer = std::thread::spawn(move || {
            client.write_all(&request).unwrap();
            client.shutdown(Shutdown::Write).unwrap();
            let mut reply = Vec::new();
            client.read_to_end(&mut reply).map(|_| reply)
        });

        let mut conn = Connection::new(Token(3), peer, mio::net::TcpStream::from_std(server));
        while let Some(back) = fx.handler.on_readable(conn) {
            conn = back;
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert!(writer.join().unwrap().unwrap().is_empty());
        assert!(fx.queue.is_empty());
        assert!(!fx.storage.intake_dir().join("Thumbs.db").exists());
    }

    #[test]
    fn unknown_verb_closes_without_reply() {
        let fx = fixture(1);
        let mut client = drive(&fx.handler, b"filedelete:x\n");
        let mut reply = Vec::new();
        let _ = client.read_to_end(&mut reply);
        assert!(reply.is_empty());
        assert!(fx.queue.is_empty());
    }

    #[test]
    fn probe_then_list() {
        let fx = fixture(1);
        std::fs::write(fx.storage.storage_dir().join("a.mp4"), b"").unwrap();
        let mut client = drive(&fx.handler, b"queuecheck\nfilelist\n");
        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "ok\nFiles:\na.mp4\n");
    }

    #[test]
    fn get_streams_stored_bytes_and_miss_sends_nothing() {
        let fx = fixture(1);
        std::fs::write(fx.storage.storage_dir().join("v.mp4"), b"video-bytes").unwrap();

        let mut hit = drive(&fx.handler, b"fileget:v.mp4\n");
        let mut body = Vec::new();
        hit.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"video-bytes");

        let mut miss = drive(&fx.handler, b"fileget:none.mp4\n");
        let mut body = Vec::new();
        miss.read_to_end(&mut body).unwrap();
        assert!(body.is_empty());
    }
}
