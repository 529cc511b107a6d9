//! Child process lifecycle: spawn in an own process group, plumb four
//! channels, enforce the timeout, reap the authoritative exit status.

use crate::config::types::{
    BootstrapRecord, ExecutionRequest, InputSource, ProbeError, Result, BOOTSTRAP_ENV_VAR,
};
use crate::consumer::EventConsumer;
use crate::report::{self, Report};
use crate::safety::guard;
use crate::wire::Event;
use log::{debug, warn};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::close;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const STDIN_CHUNK: usize = 4096;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One spawned child. Created at spawn, destroyed at teardown; dropping a
/// handle whose child is still running force-kills the group so abandoned
/// supervision cannot leak processes.
#[derive(Debug)]
pub struct ChildHandle {
    pub pid: i32,
    pub pgid: i32,
    pub started: Instant,
    child: Child,
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!("supervision abandoned with child {} alive; killing group", self.pid);
            kill_group(self.pgid);
            let _ = self.child.wait();
        }
    }
}

/// Everything the caller learns about one supervised run.
///
/// Process-level outcomes are data here: a timeout or signal death is a
/// populated field, never an `Err`.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: Report,
    /// OS-observed exit code; `None` when the child died by signal.
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
    pub timed_out: bool,
    /// An interrupt was observed mid-run and the child was killed for it.
    /// The interrupt itself is re-delivered by the guard after teardown.
    pub interrupted: bool,
    pub wall_time_ms: u64,
    pub child_pid: i32,
    pub child_pgid: i32,
}

/// SIGKILL the whole group so no grandchild survives. Falls back to the
/// direct pid when the group kill is refused.
fn kill_group(pgid: i32) {
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        warn!(
            "group SIGKILL fallback used: {}",
            std::io::Error::last_os_error()
        );
        let _ = unsafe { libc::kill(pgid, libc::SIGKILL) };
    }
}

fn feed_stdin(stdin: Option<ChildStdin>, input: InputSource) {
    let Some(mut stdin) = stdin else { return };
    match input {
        // Dropping the handle closes the child's stdin immediately.
        InputSource::Null => {}
        InputSource::Bytes(data) => {
            for chunk in data.chunks(STDIN_CHUNK) {
                if stdin.write_all(chunk).and_then(|_| stdin.flush()).is_err() {
                    break;
                }
            }
        }
        InputSource::Reader(mut source) => {
            let mut chunk = [0u8; STDIN_CHUNK];
            loop {
                let n = match source.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if stdin
                    .write_all(&chunk[..n])
                    .and_then(|_| stdin.flush())
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

fn close_pair(read_fd: RawFd, write_fd: RawFd) {
    let _ = close(read_fd);
    let _ = close(write_fd);
}

/// Spawn the instrumented program in a new process group with the event
/// channel opened before spawn and the bootstrap record passed out of
/// band. Returns the handle plus the fan-in consumer over the child's
/// three outbound streams.
pub fn spawn_child(request: ExecutionRequest) -> Result<(ChildHandle, EventConsumer)> {
    if request.interpreter.is_empty() {
        return Err(ProbeError::Config("empty interpreter argv".to_string()));
    }

    let (event_read, event_write) = nix::unistd::pipe()
        .map_err(|e| ProbeError::Process(format!("pipe(events): {e}")))?;
    // Only the write end crosses exec into the child.
    if let Err(e) = fcntl(event_read, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
        close_pair(event_read, event_write);
        return Err(ProbeError::Process(format!("fcntl(events): {e}")));
    }

    let bootstrap = BootstrapRecord {
        event_fd: event_write,
        max_line_captures: request.max_line_captures,
        num_lines: request.num_lines(),
        filename: request.filename.clone(),
        preload_files: request.preload_files.clone(),
        encoding: request.encoding.clone(),
    };
    let payload = match serde_json::to_string(&bootstrap) {
        Ok(payload) => payload,
        Err(e) => {
            close_pair(event_read, event_write);
            return Err(ProbeError::Config(format!("bootstrap record: {e}")));
        }
    };

    let mut command = Command::new(&request.interpreter[0]);
    command
        .args(&request.interpreter[1..])
        .arg(&request.path)
        .env(BOOTSTRAP_ENV_VAR, payload)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if !request.search_dirs.is_empty() {
        let mut parts: Vec<String> = request
            .search_dirs
            .iter()
            .map(|dir| dir.to_string_lossy().into_owned())
            .collect();
        if let Ok(existing) = std::env::var("PATH") {
            parts.push(existing);
        }
        command.env("PATH", parts.join(":"));
    }

    unsafe {
        command.pre_exec(|| {
            // Own process group: a later group kill must never reach the
            // caller.
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            close_pair(event_read, event_write);
            return Err(ProbeError::Process(format!(
                "spawn({}): {e}",
                request.interpreter[0]
            )));
        }
    };
    let started = Instant::now();
    let pid = child.id() as i32;
    // setpgid(0, 0) makes the child the leader of a group named by its
    // own pid.
    let pgid = pid;
    debug!("spawned child pid={pid} pgid={pgid}");

    // The child holds the only remaining write end now; EOF on the event
    // channel tracks child exit.
    let _ = close(event_write);
    let event_stream = unsafe { File::from_raw_fd(event_read) };

    let stdin = child.stdin.take();
    let input = request.input;
    // Feeds incrementally so a live source is observed as it produces;
    // exits on EPIPE when the child stops reading.
    thread::spawn(move || feed_stdin(stdin, input));

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProbeError::Process("child stdout not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProbeError::Process("child stderr not piped".to_string()))?;
    let consumer = EventConsumer::new(stdout, stderr, event_stream);

    Ok((
        ChildHandle {
            pid,
            pgid,
            started,
            child,
        },
        consumer,
    ))
}

struct WaitOutcome {
    exit_code: Option<i32>,
    term_signal: Option<i32>,
    timed_out: bool,
    interrupted: bool,
}

impl WaitOutcome {
    fn from_status(status: std::process::ExitStatus) -> Self {
        Self {
            exit_code: status.code(),
            term_signal: status.signal(),
            timed_out: false,
            interrupted: false,
        }
    }
}

/// Wait for exit. `None` (or zero) timeout means no deadline; the wait is
/// always a non-blocking poll so an interrupt observed by the guard cuts
/// the run short: the entire group is killed and reaped, on timeout
/// expiry likewise. A blocking `wait` here would defer the interrupt (and
/// with it the restore) until the child happened to exit on its own.
fn wait_with_timeout(
    handle: &mut ChildHandle,
    timeout: Option<Duration>,
) -> Result<WaitOutcome> {
    let limit = match timeout {
        None => None,
        Some(d) if d.is_zero() => None,
        Some(d) => Some(d),
    };

    loop {
        if let Some(status) = handle.child.try_wait()? {
            return Ok(WaitOutcome::from_status(status));
        }
        if guard::interrupted() {
            debug!("interrupt observed; killing group {}", handle.pgid);
            kill_group(handle.pgid);
            let status = handle.child.wait()?;
            return Ok(WaitOutcome {
                interrupted: true,
                ..WaitOutcome::from_status(status)
            });
        }
        if let Some(limit) = limit {
            if handle.started.elapsed() >= limit {
                debug!("timeout after {limit:?}; killing group {}", handle.pgid);
                kill_group(handle.pgid);
                let status = handle.child.wait()?;
                return Ok(WaitOutcome {
                    timed_out: true,
                    ..WaitOutcome::from_status(status)
                });
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Run one request to completion against an already-installed file.
///
/// The returned report's exit status is the OS-observed one, applied
/// after the stream is folded so any child-reported `exitstatus` record
/// stays advisory.
pub fn execute(request: ExecutionRequest) -> Result<RunOutcome> {
    let timeout = request.timeout;
    let (mut handle, mut consumer) = spawn_child(request)?;

    let waited = wait_with_timeout(&mut handle, timeout)?;
    let wall_time_ms = handle.started.elapsed().as_millis() as u64;

    let mut report = Report::new();
    report::consume_into(&mut consumer, &mut report)?;
    if let Some(code) = waited.exit_code {
        report.apply(Event::Exitstatus(code));
    }
    report.timed_out = waited.timed_out;
    report.apply(Event::Finished);

    Ok(RunOutcome {
        report,
        exit_code: waited.exit_code,
        term_signal: waited.term_signal,
        timed_out: waited.timed_out,
        interrupted: waited.interrupted,
        wall_time_ms,
        child_pid: handle.pid,
        child_pgid: handle.pgid,
    })
}
