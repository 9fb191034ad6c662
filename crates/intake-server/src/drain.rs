//! Drain thread: the single consumer of the admission queue.
//!
//! For each handle it finishes receiving the body into the intake directory, moves the file
//! into storage and acknowledges. Failures are logged and the handle is dropped; the queue
//! slot was already freed by the dequeue.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::queue::AdmissionQueue;
use crate::storage::StorageDirs;
use crate::transfer::TransferHandle;

/// Signals on drop, so a panicking drain thread still reports that it ended.
struct ExitSignal(Sender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

pub(crate) struct DrainHandle {
    exited: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

pub(crate) fn spawn(
    queue: Arc<AdmissionQueue<TransferHandle>>,
    storage: Arc<StorageDirs>,
    idle_timeout: Duration,
) -> Result<DrainHandle> {
    let (exit_tx, exited) = crossbeam_channel::bounded(1);
    let join = std::thread::Builder::new()
        .name("intake-drain".to_string())
        .spawn(move || {
            let _signal = ExitSignal(exit_tx);
            drain_main(&queue, &storage, idle_timeout);
        })
        .context("spawn drain thread")?;
    Ok(DrainHandle {
        exited,
        join: Some(join),
    })
}

impl DrainHandle {
    /// Wait for the drain thread to finish, up to `deadline`.
    ///
    /// Returns `true` once the thread has exited.
    pub(crate) fn wait(&mut self, deadline: Instant) -> bool {
        if self.join.is_none() {
            return true;
        }
        match self.exited.recv_deadline(deadline) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(join) = self.join.take() {
                    if join.join().is_err() {
                        tracing::error!("drain thread panicked");
                    }
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

fn drain_main(
    queue: &AdmissionQueue<TransferHandle>,
    storage: &StorageDirs,
    idle_timeout: Duration,
) {
    tracing::debug!("drain thread started");
    while let Some(handle) = queue.dequeue() {
        persist_one(storage, handle, idle_timeout);
    }
    tracing::debug!("drain thread exiting; queue closed");
}

/// Receive, commit and acknowledge one upload.
///
/// A body that goes silent for `idle_timeout` is abandoned like any other read failure.
pub(crate) fn persist_one(
    storage: &StorageDirs,
    mut handle: TransferHandle,
    idle_timeout: Duration,
) {
    let peer = handle.peer();
    let name = handle.file_name().clone();
    let started = Instant::now();
    tracing::debug!(
        peer = %peer,
        header = handle.header(),
        leftover = handle.leftover_len(),
        "receiving upload body"
    );
    if let Err(e) = handle.set_idle_timeout(idle_timeout) {
        tracing::warn!(peer = %peer, file = %name, error = %e, "cannot set body idle timeout");
        handle.close();
        return;
    }

    let (mut file, path) = match storage.create_intake_file(&name) {
        Ok(created) => created,
        Err(e) => {
            tracing::error!(peer = %peer, file = %name, "cannot open intake file: {e:#}");
            handle.close();
            return;
        }
    };

    let received = handle
        .receive_into(&mut file)
        .and_then(|n| file.sync_all().map(|()| n));
    let bytes = match received {
        Ok(n) => n,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            tracing::warn!(
                peer = %peer,
                file = %name,
                bytes = handle.bytes_written(),
                idle_secs = idle_timeout.as_secs_f32(),
                path = %path.display(),
                "upload body stalled; partial file left in intake"
            );
            handle.close();
            return;
        }
        Err(e) => {
            tracing::warn!(
                peer = %peer,
                file = %name,
                bytes = handle.bytes_written(),
                path = %path.display(),
                error = %e,
                "upload aborted; partial file left in intake"
            );
            handle.close();
            return;
        }
    };
    drop(file);

    match storage.commit(&name) {
        Ok(stored) => {
            tracing::info!(
                peer = %peer,
                file = %name,
                bytes,
                elapsed_ms = started.elapsed().as_millis() as u64,
                path = %stored.display(),
                "upload stored"
            );
            if let Err(e) = handle.acknowledge() {
                tracing::warn!(peer = %peer, file = %name, error = %e, "acknowledgment not delivered");
            }
        }
        Err(e) => {
            tracing::error!(peer = %peer, file = %name, "storage move failed; dropping upload: {e:#}");
            handle.close();
        }
    }
}
