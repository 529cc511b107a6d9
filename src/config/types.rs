//! Core types and structures shared across the probebox system.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variable carrying the JSON bootstrap record from the
/// supervisor to the child. Deliberately not argv: command lines are
/// visible to other processes and unsafe for arbitrary content.
pub const BOOTSTRAP_ENV_VAR: &str = "PROBEBOX_BOOTSTRAP";

/// Maximum distinct results retained per (line, kind) before further
/// occurrences collapse to "unrecorded".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureCap {
    /// At most this many results per (line, kind).
    Finite(u32),
    /// No cap; every recording is kept.
    Unbounded,
}

impl CaptureCap {
    /// Whether a recording may still be kept after `seen` prior recordings
    /// for the same (line, kind).
    pub fn admits(self, seen: u32) -> bool {
        match self {
            CaptureCap::Finite(cap) => seen < cap,
            CaptureCap::Unbounded => true,
        }
    }

    /// Wire token for the `max_line_captures` record. `Unbounded` travels
    /// as the distinguished literal `infinity`.
    pub fn to_wire(self) -> String {
        match self {
            CaptureCap::Finite(cap) => cap.to_string(),
            CaptureCap::Unbounded => "infinity".to_string(),
        }
    }

    pub fn from_wire(token: &str) -> Result<Self> {
        if token == "infinity" {
            return Ok(CaptureCap::Unbounded);
        }
        token
            .parse::<u32>()
            .map(CaptureCap::Finite)
            .map_err(|_| ProbeError::MalformedRecord(format!("bad capture cap: {token}")))
    }
}

impl fmt::Display for CaptureCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Kind of a recorded per-line result. Closed enumeration; the wire token
/// mapping is pinned by tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultKind {
    /// Default terse value rendering.
    Inspect,
    /// Pretty-printed value rendering.
    Pp,
}

impl ResultKind {
    pub fn token(self) -> &'static str {
        match self {
            ResultKind::Inspect => "inspect",
            ResultKind::Pp => "pp",
        }
    }

    pub fn from_token(token: &str) -> Result<Self> {
        match token {
            "inspect" => Ok(ResultKind::Inspect),
            "pp" => Ok(ResultKind::Pp),
            other => Err(ProbeError::MalformedRecord(format!(
                "unknown result kind: {other}"
            ))),
        }
    }
}

/// Where the child's stdin comes from.
///
/// `Reader` is fed to the child incrementally by a dedicated writer thread,
/// so a live source is observed incrementally rather than all at once.
pub enum InputSource {
    /// Close stdin immediately.
    Null,
    /// Fixed bytes, written in chunks.
    Bytes(Vec<u8>),
    /// Streaming source, pumped until EOF.
    Reader(Box<dyn Read + Send>),
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::Null => f.write_str("Null"),
            InputSource::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            InputSource::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

/// Immutable description of one supervised run.
///
/// Built once by the caller, never mutated afterwards. `program` is the
/// already-instrumented text that gets installed at `path` for the
/// duration of the run; `interpreter` is the argv prefix that executes it
/// (the installed path is appended as the final argument).
#[derive(Debug)]
pub struct ExecutionRequest {
    /// Instrumented program text to install and run.
    pub program: String,
    /// On-disk location the program is installed at.
    pub path: PathBuf,
    /// Interpreter argv prefix, e.g. `["ruby", "-W0"]` or `["/bin/sh"]`.
    pub interpreter: Vec<String>,
    /// Child stdin source.
    pub input: InputSource,
    /// Extra directories prepended to the child's search path.
    pub search_dirs: Vec<PathBuf>,
    /// Auxiliary files the child should preload, passed through the
    /// bootstrap record.
    pub preload_files: Vec<PathBuf>,
    /// Declared text encoding label, advisory for the child's renderers.
    pub encoding: Option<String>,
    /// Wall-clock limit. `None` (or a zero duration) waits unboundedly.
    pub timeout: Option<Duration>,
    /// Per-(line, kind) capture cap.
    pub max_line_captures: CaptureCap,
    /// Filename the child reports results against.
    pub filename: String,
}

impl ExecutionRequest {
    pub fn new(
        program: impl Into<String>,
        path: impl Into<PathBuf>,
        interpreter: Vec<String>,
    ) -> Self {
        let path = path.into();
        let filename = path.to_string_lossy().into_owned();
        Self {
            program: program.into(),
            path,
            interpreter,
            input: InputSource::Null,
            search_dirs: Vec::new(),
            preload_files: Vec::new(),
            encoding: None,
            timeout: None,
            max_line_captures: CaptureCap::Unbounded,
            filename,
        }
    }

    /// Number of lines in the program text, as reported to the child.
    pub fn num_lines(&self) -> u32 {
        self.program.lines().count() as u32
    }
}

/// Supervisor-to-child bootstrap contract, serialized as JSON into
/// [`BOOTSTRAP_ENV_VAR`] before spawn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapRecord {
    /// Inherited file descriptor number of the event channel's write end.
    pub event_fd: i32,
    pub max_line_captures: CaptureCap,
    pub num_lines: u32,
    pub filename: String,
    pub preload_files: Vec<PathBuf>,
    pub encoding: Option<String>,
}

/// Errors raised by probebox operations.
///
/// Process-level outcomes (abnormal exit, timeout, signal death) are data
/// on the run outcome, not variants here; these represent bugs and
/// environment failures.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup already pending at {}", .0.display())]
    AlreadyPending(PathBuf),

    #[error("broken event channel: {0}")]
    BrokenChannel(String),

    #[error("unknown event tag: {0}")]
    UnknownEvent(String),

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("no more input")]
    NoMoreInput,

    #[error("process error: {0}")]
    Process(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

pub type Result<T> = std::result::Result<T, ProbeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_cap_admits_below_cap_only() {
        let cap = CaptureCap::Finite(2);
        assert!(cap.admits(0));
        assert!(cap.admits(1));
        assert!(!cap.admits(2));
        assert!(!cap.admits(100));
        assert!(CaptureCap::Unbounded.admits(u32::MAX));
    }

    #[test]
    fn capture_cap_wire_round_trip() {
        assert_eq!(CaptureCap::Finite(7).to_wire(), "7");
        assert_eq!(CaptureCap::Unbounded.to_wire(), "infinity");
        assert_eq!(
            CaptureCap::from_wire("infinity").unwrap(),
            CaptureCap::Unbounded
        );
        assert_eq!(CaptureCap::from_wire("7").unwrap(), CaptureCap::Finite(7));
        assert!(CaptureCap::from_wire("lots").is_err());
    }

    // Pins the kind token mapping; the cap keys on (line, kind) with this
    // closed vocabulary.
    #[test]
    fn result_kind_tokens_are_pinned() {
        assert_eq!(ResultKind::Inspect.token(), "inspect");
        assert_eq!(ResultKind::Pp.token(), "pp");
        assert_eq!(
            ResultKind::from_token("inspect").unwrap(),
            ResultKind::Inspect
        );
        assert_eq!(ResultKind::from_token("pp").unwrap(), ResultKind::Pp);
        assert!(ResultKind::from_token("dump").is_err());
    }

    #[test]
    fn request_counts_program_lines() {
        let req = ExecutionRequest::new("a\nb\nc", "/tmp/f", vec!["sh".to_string()]);
        assert_eq!(req.num_lines(), 3);
        assert_eq!(req.filename, "/tmp/f");
    }

    #[test]
    fn bootstrap_record_json_round_trip() {
        let record = BootstrapRecord {
            event_fd: 7,
            max_line_captures: CaptureCap::Finite(4),
            num_lines: 10,
            filename: "probe.rs".to_string(),
            preload_files: vec![PathBuf::from("/tmp/helper")],
            encoding: Some("utf-8".to_string()),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: BootstrapRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_fd, 7);
        assert_eq!(back.max_line_captures, CaptureCap::Finite(4));
        assert_eq!(back.filename, "probe.rs");
    }
}
