//! Child-side event producer.
//!
//! Lives inside the instrumented child process. Call sites created by the
//! instrumentation reach it through the process-global handle
//! ([`init_from_env`] / [`global`]); a background sender thread drains an
//! internal queue onto the event fd so recording never blocks program
//! code on pipe backpressure from the parent.
//!
//! If the event channel breaks mid-send (parent gone, pipe closed) the
//! sender drains and discards the remaining queue instead of blocking or
//! crashing the child.

use crate::config::types::{
    BootstrapRecord, CaptureCap, ProbeError, Result, ResultKind, BOOTSTRAP_ENV_VAR,
};
use crate::wire::{self, Event, RecordedException};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::fmt::Debug;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle};

/// Placeholder emitted when a value's renderer panics.
pub const RENDER_FALLBACK: &str = "#<rendering failed>";

enum Outbound {
    Record(String),
    Finish,
}

fn sender_loop<W: Write>(rx: Receiver<Outbound>, mut sink: W) {
    let mut broken = false;
    for message in rx.iter() {
        match message {
            Outbound::Record(record) => {
                if broken {
                    // Drain-and-discard: the peer is gone, but program
                    // code must keep running unharmed.
                    continue;
                }
                if sink
                    .write_all(record.as_bytes())
                    .and_then(|_| sink.flush())
                    .is_err()
                {
                    broken = true;
                }
            }
            Outbound::Finish => {
                if !broken {
                    let _ = sink.write_all(wire::encode(&Event::Finished).as_bytes());
                    let _ = sink.flush();
                }
                break;
            }
        }
    }
}

/// Emits recording/exception events for the instrumented program.
pub struct EventProducer {
    tx: Sender<Outbound>,
    sender: Mutex<Option<JoinHandle<()>>>,
    counts: Mutex<HashMap<(u32, ResultKind), u32>>,
    cap: CaptureCap,
    num_lines: u32,
    filename: String,
}

impl EventProducer {
    /// Build a producer over an arbitrary sink. The metadata records
    /// (filename, line count, capture cap) are emitted immediately.
    pub fn from_writer<W: Write + Send + 'static>(
        sink: W,
        cap: CaptureCap,
        num_lines: u32,
        filename: impl Into<String>,
    ) -> Self {
        let filename = filename.into();
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = thread::spawn(move || sender_loop(rx, sink));
        let producer = Self {
            tx,
            sender: Mutex::new(Some(handle)),
            counts: Mutex::new(HashMap::new()),
            cap,
            num_lines,
            filename: filename.clone(),
        };
        producer.emit(Event::Filename(filename));
        producer.emit(Event::NumLines(num_lines));
        producer.emit(Event::MaxLineCaptures(cap));
        producer
    }

    /// Build a producer from the supervisor's bootstrap record, taking
    /// ownership of the inherited event fd.
    pub fn from_bootstrap(record: BootstrapRecord) -> Self {
        let sink = unsafe { File::from_raw_fd(record.event_fd) };
        Self::from_writer(
            sink,
            record.max_line_captures,
            record.num_lines,
            record.filename,
        )
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<(u32, ResultKind), u32>> {
        self.counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: Event) {
        let _ = self.tx.send(Outbound::Record(wire::encode(&event)));
    }

    /// Record a value against `(line, kind)` using the default
    /// stringification, returning the value unchanged.
    pub fn record_result<T: Debug>(&self, kind: ResultKind, line: u32, value: T) -> T {
        self.record_result_with(kind, line, value, |v| format!("{v:?}"))
    }

    /// Record a value with a caller-supplied renderer, returning the value
    /// unchanged.
    ///
    /// Below the cap this emits one `result` record; the recording that
    /// lands exactly on the cap emits a single `maxed_result` instead, and
    /// later recordings for the same (line, kind) emit nothing. A renderer
    /// that panics falls back to [`RENDER_FALLBACK`]; stack exhaustion
    /// does not unwind and aborts the child instead, surfacing the fault
    /// site rather than masking it.
    pub fn record_result_with<T, F>(&self, kind: ResultKind, line: u32, value: T, renderer: F) -> T
    where
        F: FnOnce(&T) -> String,
    {
        let seen = {
            let mut counts = self.counts();
            let slot = counts.entry((line, kind)).or_insert(0);
            let seen = *slot;
            // Past the cap the exact count no longer matters; saturate
            // instead of overflowing on a pathological run.
            *slot = slot.saturating_add(1);
            seen
        };

        if self.cap.admits(seen) {
            let text = match catch_unwind(AssertUnwindSafe(|| renderer(&value))) {
                Ok(text) => text,
                Err(_) => RENDER_FALLBACK.to_string(),
            };
            self.emit(Event::LineResult { kind, line, text });
        } else if matches!(self.cap, CaptureCap::Finite(cap) if seen == cap) {
            self.emit(Event::UnrecordedResult { kind, line });
        }
        value
    }

    /// Record an exception. When `line` is unknown it is derived by
    /// scanning the backtrace for frames in the reporting filename,
    /// falling back to the program's last line.
    pub fn record_exception(
        &self,
        line: Option<u32>,
        class_name: impl Into<String>,
        message: impl Into<String>,
        backtrace: Vec<String>,
    ) {
        let line = line.unwrap_or_else(|| self.line_from_backtrace(&backtrace));
        self.emit(Event::Exception(RecordedException {
            line,
            class_name: class_name.into(),
            message: message.into(),
            backtrace,
        }));
    }

    fn line_from_backtrace(&self, frames: &[String]) -> u32 {
        for frame in frames {
            let Some(rest) = frame.strip_prefix(self.filename.as_str()) else {
                continue;
            };
            let Some(rest) = rest.strip_prefix(':') else {
                continue;
            };
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            if let Ok(line) = digits.parse::<u32>() {
                return line;
            }
        }
        self.num_lines.max(1)
    }

    /// Enqueue the terminal marker and block until the background sender
    /// has flushed and exited. No event already enqueued is lost.
    pub fn finish(&self) {
        let _ = self.tx.send(Outbound::Finish);
        let handle = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn num_lines(&self) -> u32 {
        self.num_lines
    }
}

static GLOBAL: OnceLock<EventProducer> = OnceLock::new();

/// Initialize the process-global producer from [`BOOTSTRAP_ENV_VAR`].
/// Idempotent; later calls return the same handle.
pub fn init_from_env() -> Result<&'static EventProducer> {
    let payload = std::env::var(BOOTSTRAP_ENV_VAR)
        .map_err(|_| ProbeError::Config(format!("{BOOTSTRAP_ENV_VAR} is not set")))?;
    let record: BootstrapRecord = serde_json::from_str(&payload)
        .map_err(|e| ProbeError::Config(format!("bad bootstrap record: {e}")))?;
    Ok(GLOBAL.get_or_init(|| EventProducer::from_bootstrap(record)))
}

/// The process-global producer, if one was initialized.
pub fn global() -> Option<&'static EventProducer> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Decoder;
    use std::io::{Seek, SeekFrom};

    fn drain(producer: EventProducer, read_side: &mut File) -> Vec<Event> {
        producer.finish();
        read_side.seek(SeekFrom::Start(0)).unwrap();
        let mut decoder = Decoder::new(std::io::BufReader::new(read_side));
        let mut events = Vec::new();
        while let Some(event) = decoder.next_event().unwrap() {
            events.push(event);
        }
        events
    }

    fn producer_over_tempfile(
        cap: CaptureCap,
        num_lines: u32,
    ) -> (EventProducer, File) {
        let file = tempfile::tempfile().unwrap();
        let read_side = file.try_clone().unwrap();
        let producer = EventProducer::from_writer(file, cap, num_lines, "probe.rs");
        (producer, read_side)
    }

    #[test]
    fn emits_metadata_then_finish() {
        let (producer, mut read_side) = producer_over_tempfile(CaptureCap::Finite(3), 7);
        let events = drain(producer, &mut read_side);
        assert_eq!(
            events,
            vec![
                Event::Filename("probe.rs".to_string()),
                Event::NumLines(7),
                Event::MaxLineCaptures(CaptureCap::Finite(3)),
                Event::Finished,
            ]
        );
    }

    // Scenario: cap 2, five recordings for (line 3, inspect).
    #[test]
    fn cap_yields_n_results_then_one_unrecorded() {
        let (producer, mut read_side) = producer_over_tempfile(CaptureCap::Finite(2), 5);
        for i in 0..5 {
            let back = producer.record_result(ResultKind::Inspect, 3, i);
            assert_eq!(back, i);
        }
        let events = drain(producer, &mut read_side);
        let for_line: Vec<&Event> = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    Event::LineResult { line: 3, .. } | Event::UnrecordedResult { line: 3, .. }
                )
            })
            .collect();
        assert_eq!(for_line.len(), 3);
        assert!(matches!(
            for_line[0],
            Event::LineResult { text, .. } if text == "0"
        ));
        assert!(matches!(
            for_line[1],
            Event::LineResult { text, .. } if text == "1"
        ));
        assert!(matches!(
            for_line[2],
            Event::UnrecordedResult {
                kind: ResultKind::Inspect,
                line: 3
            }
        ));
    }

    #[test]
    fn cap_keys_on_line_and_kind_independently() {
        let (producer, mut read_side) = producer_over_tempfile(CaptureCap::Finite(1), 5);
        producer.record_result(ResultKind::Inspect, 1, "a");
        producer.record_result(ResultKind::Pp, 1, "b");
        producer.record_result(ResultKind::Inspect, 2, "c");
        let events = drain(producer, &mut read_side);
        let results = events
            .iter()
            .filter(|e| matches!(e, Event::LineResult { .. }))
            .count();
        assert_eq!(results, 3);
    }

    #[test]
    fn unbounded_cap_never_collapses() {
        let (producer, mut read_side) = producer_over_tempfile(CaptureCap::Unbounded, 5);
        for i in 0..50 {
            producer.record_result(ResultKind::Inspect, 1, i);
        }
        let events = drain(producer, &mut read_side);
        let results = events
            .iter()
            .filter(|e| matches!(e, Event::LineResult { .. }))
            .count();
        let maxed = events
            .iter()
            .filter(|e| matches!(e, Event::UnrecordedResult { .. }))
            .count();
        assert_eq!(results, 50);
        assert_eq!(maxed, 0);
    }

    #[test]
    fn panicking_renderer_falls_back_to_placeholder() {
        let (producer, mut read_side) = producer_over_tempfile(CaptureCap::Unbounded, 1);
        let back =
            producer.record_result_with(ResultKind::Inspect, 1, 7u32, |_| panic!("bad render"));
        assert_eq!(back, 7);
        let events = drain(producer, &mut read_side);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::LineResult { text, .. } if text == RENDER_FALLBACK
        )));
    }

    #[test]
    fn exception_line_derived_from_backtrace() {
        let (producer, mut read_side) = producer_over_tempfile(CaptureCap::Unbounded, 9);
        producer.record_exception(
            None,
            "RuntimeError",
            "kaboom",
            vec![
                "other.rs:44".to_string(),
                "probe.rs:6".to_string(),
            ],
        );
        producer.record_exception(None, "RuntimeError", "nowhere", vec![]);
        let events = drain(producer, &mut read_side);
        let lines: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                Event::Exception(exception) => Some(exception.line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec![6, 9]);
    }

    #[test]
    fn global_producer_initializes_once_from_env() {
        use std::os::unix::io::IntoRawFd;

        let file = tempfile::tempfile().unwrap();
        let mut read_side = file.try_clone().unwrap();
        let record = BootstrapRecord {
            event_fd: file.into_raw_fd(),
            max_line_captures: CaptureCap::Finite(2),
            num_lines: 4,
            filename: "probe.rs".to_string(),
            preload_files: vec![],
            encoding: None,
        };
        std::env::set_var(BOOTSTRAP_ENV_VAR, serde_json::to_string(&record).unwrap());

        let first = init_from_env().unwrap();
        let second = init_from_env().unwrap();
        assert!(std::ptr::eq(first, second), "later calls return the same handle");
        assert!(std::ptr::eq(first, global().unwrap()));
        assert_eq!(first.num_lines(), 4);
        assert_eq!(first.filename(), "probe.rs");

        first.record_result(ResultKind::Inspect, 1, "x");
        first.finish();

        read_side.seek(SeekFrom::Start(0)).unwrap();
        let mut decoder = Decoder::new(std::io::BufReader::new(&mut read_side));
        let mut events = Vec::new();
        while let Some(event) = decoder.next_event().unwrap() {
            events.push(event);
        }
        assert_eq!(events[0], Event::Filename("probe.rs".to_string()));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::LineResult { line: 1, text, .. } if text == "\"x\""
        )));
        assert_eq!(events.last(), Some(&Event::Finished));
    }

    #[test]
    fn broken_sink_discards_without_crashing() {
        struct BrokenSink;
        impl Write for BrokenSink {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let producer =
            EventProducer::from_writer(BrokenSink, CaptureCap::Unbounded, 2, "probe.rs");
        for i in 0..100 {
            producer.record_result(ResultKind::Inspect, 1, i);
        }
        producer.finish();
    }

    #[test]
    fn finish_is_idempotent() {
        let (producer, mut read_side) = producer_over_tempfile(CaptureCap::Unbounded, 1);
        producer.finish();
        producer.finish();
        let events = drain(producer, &mut read_side);
        let finishes = events.iter().filter(|e| **e == Event::Finished).count();
        assert_eq!(finishes, 1);
    }
}
