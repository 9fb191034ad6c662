//! Shared protocol primitives for `intake-server` and `intake-send`.
//!
//! One request per TCP connection:
//! - header: one UTF-8 line terminated by `\n`, at most [`HEADER_MAX_LEN`] bytes
//!   - `fileput:<name>` followed by the raw file bytes; the sender closes its write side
//!     to mark the end of the body
//!   - `filelist[:<filter>]` (no body)
//!   - `fileget:<name>` (no body)
//! - optional probe before the header: `queuecheck`, answered with `full` or `ok`
//!
//! Responses:
//! - upload stored: `Received: <name>\n`
//! - listing: `Files:\n` followed by one name per line
//! - fetch: raw bytes, end marked by connection close
//! - admission rejected: `full\n`

use std::io;

pub mod client;

/// Upper bound for a header line, terminator excluded.
pub const HEADER_MAX_LEN: usize = 1024;
/// Chunk size used when moving body bytes from a socket to disk.
pub const BODY_CHUNK_LEN: usize = 8192;

pub const QUEUE_CHECK: &str = "queuecheck";
pub const RESPONSE_FULL: &str = "full";
pub const RESPONSE_OK: &str = "ok";
pub const FILES_MARKER: &str = "Files:";

const RECEIVED_PREFIX: &str = "Received: ";
const MAX_NAME_LEN: usize = 255;

/// OS artifacts that senders tend to pick up while walking a directory.
pub const RESERVED_NAMES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];

/// A parsed request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Upload; `name` is the raw, unsanitized argument.
    Put { name: String },
    /// Download a stored file.
    Get { name: String },
    /// List known files, optionally filtered by substring.
    List { filter: Option<String> },
}

impl Request {
    /// Render the header line, terminator included.
    pub fn to_header_line(&self) -> io::Result<String> {
        let line = match self {
            Request::Put { name } => format!("fileput:{name}"),
            Request::Get { name } => format!("fileget:{name}"),
            Request::List { filter: Some(filter) } => format!("filelist:{filter}"),
            Request::List { filter: None } => "filelist".to_string(),
        };
        if line.contains(['\n', '\r']) {
            return Err(invalid_input("header must be a single line"));
        }
        if line.len() > HEADER_MAX_LEN {
            return Err(invalid_input("header exceeds maximum length"));
        }
        Ok(line + "\n")
    }
}

/// Parse one header line (terminator already stripped).
pub fn parse_request(line: &str) -> io::Result<Request> {
    let (verb, arg) = match line.split_once(':') {
        Some((verb, arg)) => (verb.trim(), Some(arg.trim())),
        None => (line.trim(), None),
    };

    match verb {
        "fileput" => Ok(Request::Put {
            name: required_arg(verb, arg)?,
        }),
        "fileget" => Ok(Request::Get {
            name: required_arg(verb, arg)?,
        }),
        "filelist" => Ok(Request::List {
            filter: arg.filter(|f| !f.is_empty()).map(str::to_string),
        }),
        other => Err(invalid_data(format!("unknown verb {other:?}"))),
    }
}

fn required_arg(verb: &str, arg: Option<&str>) -> io::Result<String> {
    match arg {
        Some(arg) if !arg.is_empty() => Ok(arg.to_string()),
        _ => Err(invalid_data(format!("{verb} requires a file name"))),
    }
}

/// True if `line` is the pre-header capacity probe.
pub fn is_queue_check(line: &str) -> bool {
    line.trim() == QUEUE_CHECK
}

/// Acknowledgment line for a stored upload.
pub fn received_line(name: &str) -> String {
    format!("{RECEIVED_PREFIX}{name}\n")
}

/// Extract the file name from an acknowledgment line.
pub fn parse_received(line: &str) -> Option<&str> {
    line.trim_end().strip_prefix(RECEIVED_PREFIX)
}

/// A file name that is safe to join onto a storage directory.
///
/// The only constructor is [`FileName::parse`], so holding one means the name has no path
/// separators, no `.`/`..` segments and no control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileName(String);

impl FileName {
    pub fn parse(raw: &str) -> io::Result<Self> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(invalid_input("empty file name"));
        }
        if name == "." || name == ".." {
            return Err(invalid_input("file name is a relative path segment"));
        }
        if name.contains(['/', '\\', ':']) {
            return Err(invalid_input("file name contains a path separator"));
        }
        if name.chars().any(char::is_control) {
            return Err(invalid_input("file name contains control characters"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(invalid_input("file name too long"));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hidden OS marker files are accepted on the wire but never stored.
    pub fn is_reserved(&self) -> bool {
        is_reserved_name(&self.0)
    }
}

impl std::fmt::Display for FileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// Incremental line scanner for headers arriving over several partial reads.
///
/// Only the unconsumed tail is kept between calls, so it works equally well behind a
/// non-blocking socket, a blocking reader or a test fixture.
#[derive(Debug, Default)]
pub struct HeaderScanner {
    pending: Vec<u8>,
    // Prefix of `pending` already known to contain no terminator.
    scanned: usize,
}

impl HeaderScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pop the next complete line, if one is buffered.
    ///
    /// Returns `InvalidData` once more than [`HEADER_MAX_LEN`] bytes accumulate without a
    /// terminator, or if the line is not UTF-8.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        let Some(offset) = self.pending[self.scanned..].iter().position(|b| *b == b'\n') else {
            self.scanned = self.pending.len();
            if self.pending.len() > HEADER_MAX_LEN {
                return Err(invalid_data("header exceeds maximum length"));
            }
            return Ok(None);
        };

        let end = self.scanned + offset;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        self.scanned = 0;
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.len() > HEADER_MAX_LEN {
            return Err(invalid_data("header exceeds maximum length"));
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| invalid_data("header not utf-8"))
    }

    /// Bytes buffered past the last returned line.
    pub fn buffered(&self) -> &[u8] {
        &self.pending
    }

    /// Consume the scanner, keeping whatever was read past the header boundary.
    pub fn into_leftover(self) -> Vec<u8> {
        self.pending
    }
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn invalid_input(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}
