//! Registry of sockets currently owned by blocking work (workers or the drain thread).
//!
//! Threads can't be cancelled, but their blocking socket calls can: shutting a tracked
//! socket down makes the owner's pending read or write fail promptly, which is how the
//! shutdown grace period is enforced.

use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
pub(crate) struct InFlight {
    next_id: AtomicU64,
    aborted: AtomicBool,
    conns: Mutex<HashMap<u64, TcpStream>>,
}

/// Registration guard; the socket is forgotten when this drops.
pub(crate) struct Tracked {
    id: u64,
    registry: Arc<InFlight>,
}

impl Tracked {
    /// Whether [`InFlight::abort_all`] has run; an EOF seen afterwards is not a real end of body.
    pub(crate) fn aborted(&self) -> bool {
        self.registry.aborted.load(Ordering::Acquire)
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

impl InFlight {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, TcpStream>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `stream` until the returned guard drops.
    ///
    /// Returns `None` if the socket handle can't be duplicated; the work then simply can't
    /// be aborted early.
    pub(crate) fn track(self: &Arc<Self>, stream: &TcpStream) -> Option<Tracked> {
        let clone = match stream.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                tracing::warn!(error = %e, "cannot track connection for shutdown");
                return None;
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, clone);
        Some(Tracked {
            id,
            registry: self.clone(),
        })
    }

    /// Shut down every tracked socket, returning how many were hit.
    pub(crate) fn abort_all(&self) -> usize {
        self.aborted.store(true, Ordering::Release);
        let g = self.lock();
        for stream in g.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        g.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn guard_drop_forgets_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let registry = InFlight::new();
        let guard = registry.track(&client).unwrap();
        assert_eq!(registry.len(), 1);
        drop(guard);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn abort_all_unblocks_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        let registry = InFlight::new();
        let guard = registry.track(&server).unwrap();
        assert!(!guard.aborted());

        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            server.read(&mut buf)
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(registry.abort_all(), 1);
        assert!(guard.aborted());
        // Either EOF or an error; the point is that it returns.
        let _ = reader.join().unwrap();
    }
}
