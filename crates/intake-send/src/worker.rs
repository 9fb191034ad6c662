//! Upload threads with retry on a full queue.
//!
//! Files are handed out through a shared job channel; each thread uploads one file at a time
//! and backs off whenever the server reports `full` or the connection fails.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use intake_proto::client::{self, PutOutcome, QueueStatus, SendOptions};

use crate::library::UploadFile;

const PRECHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// 0 retries forever.
    pub max_attempts: u32,
}

impl RetryPolicy {
    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }
}

#[derive(Debug)]
pub enum Report {
    Stored { name: String, attempts: u32 },
    Failed { name: String, attempts: u32, reason: String },
}

#[derive(Debug, Default)]
pub struct Summary {
    pub stored: usize,
    pub failed: Vec<String>,
}

/// Upload one file, retrying until it is stored or the policy gives up.
///
/// `attempt` performs a single connection; it is a parameter so retry behavior can be
/// exercised without a server.
pub fn upload_with_retry<F>(file: &UploadFile, policy: &RetryPolicy, mut attempt: F) -> Report
where
    F: FnMut(&UploadFile) -> io::Result<PutOutcome>,
{
    let name = file.name.to_string();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let reason = match attempt(file) {
            Ok(PutOutcome::Received(_)) => return Report::Stored { name, attempts },
            Ok(PutOutcome::Full) => "queue full".to_string(),
            Ok(PutOutcome::NoReply) => "closed without reply".to_string(),
            Err(e) => e.to_string(),
        };
        if policy.exhausted(attempts) {
            return Report::Failed {
                name,
                attempts,
                reason,
            };
        }
        tracing::info!(file = %name, attempts, reason = %reason, "retrying after delay");
        std::thread::sleep(policy.delay);
    }
}

fn send_once(addr: SocketAddr, file: &UploadFile, opts: &SendOptions) -> io::Result<PutOutcome> {
    let mut body = BufReader::new(File::open(&file.path)?);
    client::send_file(addr, file.name.as_str(), &mut body, opts)
}

/// Log whether the server has room before uploads start. `None` when the check failed.
pub fn check_queue(addr: SocketAddr, timeout: Option<Duration>) -> Option<QueueStatus> {
    match client::queue_check(addr, timeout.or(Some(PRECHECK_TIMEOUT))) {
        Ok(QueueStatus::Available) => {
            tracing::info!(addr = %addr, "server queue has room");
            Some(QueueStatus::Available)
        }
        Ok(QueueStatus::Full) => {
            tracing::info!(addr = %addr, "server queue is full; senders will wait and retry");
            Some(QueueStatus::Full)
        }
        Err(e) => {
            tracing::warn!(addr = %addr, error = %e, "queue check failed");
            None
        }
    }
}

/// Upload every file using `threads` parallel senders.
pub fn run_uploads(
    addr: SocketAddr,
    files: Vec<UploadFile>,
    threads: usize,
    policy: RetryPolicy,
    timeout: Option<Duration>,
) -> Result<Summary> {
    let (job_tx, job_rx) = crossbeam_channel::unbounded::<UploadFile>();
    let (report_tx, report_rx) = crossbeam_channel::unbounded::<Report>();
    for file in files {
        // The receiver is alive until the threads below exit.
        let _ = job_tx.send(file);
    }
    drop(job_tx);

    let opts = SendOptions {
        timeout,
        probe_first: true,
    };
    let mut handles = Vec::new();
    for i in 0..threads.max(1) {
        let job_rx = job_rx.clone();
        let report_tx = report_tx.clone();
        let opts = opts.clone();
        let handle = std::thread::Builder::new()
            .name(format!("intake-send-{i}"))
            .spawn(move || sender_main(addr, &job_rx, &report_tx, &policy, &opts))
            .with_context(|| format!("spawn sender thread {i}"))?;
        handles.push(handle);
    }
    drop(report_tx);

    let mut summary = Summary::default();
    for report in report_rx.iter() {
        match report {
            Report::Stored { name, attempts } => {
                tracing::info!(file = %name, attempts, "stored");
                summary.stored += 1;
            }
            Report::Failed {
                name,
                attempts,
                reason,
            } => {
                tracing::error!(file = %name, attempts, reason = %reason, "upload failed");
                summary.failed.push(name);
            }
        }
    }
    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("sender thread panicked");
        }
    }
    Ok(summary)
}

fn sender_main(
    addr: SocketAddr,
    jobs: &Receiver<UploadFile>,
    reports: &Sender<Report>,
    policy: &RetryPolicy,
    opts: &SendOptions,
) {
    for file in jobs.iter() {
        tracing::debug!(file = %file.name, "uploading");
        let report = upload_with_retry(&file, policy, |f| send_once(addr, f, opts));
        if reports.send(report).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intake_proto::FileName;
    use std::path::PathBuf;

    fn file(name: &str) -> UploadFile {
        UploadFile {
            path: PathBuf::from(name),
            name: FileName::parse(name).unwrap(),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_millis(1),
            max_attempts,
        }
    }

    #[test]
    fn retries_full_until_received() {
        let mut replies = vec![
            Ok(PutOutcome::Received("a.mp4".to_string())),
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
            Ok(PutOutcome::Full),
        ];
        let report = upload_with_retry(&file("a.mp4"), &policy(0), |_| replies.pop().unwrap());
        match report {
            Report::Stored { name, attempts } => {
                assert_eq!(name, "a.mp4");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut calls = 0;
        let report = upload_with_retry(&file("b.mp4"), &policy(2), |_| {
            calls += 1;
            Ok(PutOutcome::Full)
        });
        assert_eq!(calls, 2);
        assert!(matches!(
            report,
            Report::Failed { attempts: 2, ref reason, .. } if reason == "queue full"
        ));
    }

    #[test]
    fn queue_check_reads_server_answer() {
        use std::io::{BufRead, BufReader, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut line = String::new();
            BufReader::new(&stream).read_line(&mut line).unwrap();
            assert_eq!(line, "queuecheck\n");
            (&stream).write_all(b"full\n").unwrap();
        });
        assert_eq!(
            check_queue(addr, Some(Duration::from_secs(5))),
            Some(QueueStatus::Full)
        );
        server.join().unwrap();
    }

    #[test]
    fn queue_check_against_closed_port_is_none() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        assert_eq!(check_queue(addr, None), None);
    }

    #[test]
    fn unreachable_server_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c.mp4"), b"data").unwrap();
        let upload = UploadFile {
            path: dir.path().join("c.mp4"),
            name: FileName::parse("c.mp4").unwrap(),
        };
        // Bind then drop to get a port nobody listens on.
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let summary = run_uploads(
            addr,
            vec![upload],
            2,
            policy(1),
            Some(Duration::from_secs(2)),
        )
        .unwrap();
        assert_eq!(summary.stored, 0);
        assert_eq!(summary.failed, vec!["c.mp4".to_string()]);
    }
}
