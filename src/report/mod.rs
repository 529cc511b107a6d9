//! Bounded-memory aggregation of the event stream.
//!
//! [`Report::apply`] folds one event at a time into an addressable
//! per-line structure; nothing retains the raw stream. Lines are created
//! on first touch (sparse map) and iteration synthesizes empty lines
//! across the contiguous seen range.

use crate::config::types::{CaptureCap, ProbeError, Result};
use crate::consumer::EventConsumer;
use crate::wire::{Event, RecordedException};
use std::collections::BTreeMap;

/// Placeholder appended for recordings collapsed by the capture cap.
pub const UNRECORDED_MARKER: &str = "...";

/// Ordered rendered results for one program line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Line {
    results: Vec<String>,
    has_exception: bool,
}

impl Line {
    pub fn results(&self) -> &[String] {
        &self.results
    }

    pub fn has_exception(&self) -> bool {
        self.has_exception
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && !self.has_exception
    }
}

/// Addressable per-line result structure for one run.
///
/// Starts empty, is mutated only by [`Report::apply`], then handed to the
/// caller immutably.
#[derive(Debug, Default)]
pub struct Report {
    lines: BTreeMap<u32, Line>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exception: Option<RecordedException>,
    pub exitstatus: Option<i32>,
    pub timed_out: bool,
    pub num_lines: Option<u32>,
    pub max_line_captures: Option<CaptureCap>,
    pub filename: Option<String>,
    min_line: Option<u32>,
    max_line: Option<u32>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self, line: u32) -> &mut Line {
        self.min_line = Some(self.min_line.map_or(line, |min| min.min(line)));
        self.max_line = Some(self.max_line.map_or(line, |max| max.max(line)));
        self.lines.entry(line).or_default()
    }

    /// Fold one event into the report.
    pub fn apply(&mut self, event: Event) {
        match event {
            Event::Stdout(bytes) => self.stdout.extend_from_slice(&bytes),
            Event::Stderr(bytes) => self.stderr.extend_from_slice(&bytes),
            Event::LineResult { line, text, .. } => self.touch(line).results.push(text),
            Event::UnrecordedResult { line, .. } => {
                self.touch(line).results.push(UNRECORDED_MARKER.to_string())
            }
            Event::Exception(exception) => {
                self.touch(exception.line).has_exception = true;
                self.exception = Some(exception);
            }
            Event::NumLines(count) => self.num_lines = Some(count),
            Event::MaxLineCaptures(cap) => self.max_line_captures = Some(cap),
            Event::Filename(name) => self.filename = Some(name),
            Event::Exitstatus(code) => self.exitstatus = Some(code),
            // Completion signal; the report is already whole.
            Event::Finished => {}
        }
    }

    /// Results recorded for one line, if that line was ever touched.
    pub fn line(&self, line: u32) -> Option<&Line> {
        self.lines.get(&line)
    }

    /// Iterate the contiguous [min, max] range of lines seen, yielding a
    /// synthesized empty [`Line`] for untouched lines in between.
    pub fn lines(&self) -> impl Iterator<Item = (u32, Line)> + '_ {
        let range = match (self.min_line, self.max_line) {
            (Some(min), Some(max)) => min..=max,
            _ => 1..=0, // empty
        };
        range.map(|n| (n, self.lines.get(&n).cloned().unwrap_or_default()))
    }

    pub fn min_line(&self) -> Option<u32> {
        self.min_line
    }

    pub fn max_line(&self) -> Option<u32> {
        self.max_line
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Fold everything a consumer yields into `report`, stopping at
/// end-of-streams. Protocol faults propagate.
pub fn consume_into(consumer: &mut EventConsumer, report: &mut Report) -> Result<()> {
    loop {
        match consumer.next_event() {
            Ok(event) => report.apply(event),
            Err(ProbeError::NoMoreInput) => return Ok(()),
            Err(fault) => return Err(fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ResultKind;

    fn result(line: u32, text: &str) -> Event {
        Event::LineResult {
            kind: ResultKind::Inspect,
            line,
            text: text.to_string(),
        }
    }

    #[test]
    fn appends_results_in_order_per_line() {
        let mut report = Report::new();
        report.apply(result(2, "1"));
        report.apply(result(2, "2"));
        report.apply(result(4, "x"));
        assert_eq!(report.line(2).unwrap().results(), ["1", "2"]);
        assert_eq!(report.line(4).unwrap().results(), ["x"]);
        assert!(report.line(3).is_none());
    }

    #[test]
    fn unrecorded_results_append_the_placeholder() {
        let mut report = Report::new();
        report.apply(result(1, "a"));
        report.apply(Event::UnrecordedResult {
            kind: ResultKind::Inspect,
            line: 1,
        });
        assert_eq!(report.line(1).unwrap().results(), ["a", UNRECORDED_MARKER]);
    }

    #[test]
    fn iteration_synthesizes_empty_lines_in_range() {
        let mut report = Report::new();
        report.apply(result(2, "a"));
        report.apply(result(5, "b"));
        let collected: Vec<(u32, bool)> = report
            .lines()
            .map(|(n, line)| (n, line.is_empty()))
            .collect();
        assert_eq!(
            collected,
            vec![(2, false), (3, true), (4, true), (5, false)]
        );
    }

    #[test]
    fn empty_report_iterates_nothing() {
        let report = Report::new();
        assert_eq!(report.lines().count(), 0);
        assert_eq!(report.min_line(), None);
    }

    #[test]
    fn exception_marks_its_line_and_sets_the_report() {
        let mut report = Report::new();
        report.apply(Event::Exception(RecordedException {
            line: 3,
            class_name: "RuntimeError".to_string(),
            message: "boom".to_string(),
            backtrace: vec![],
        }));
        assert!(report.line(3).unwrap().has_exception());
        assert_eq!(report.exception.as_ref().unwrap().message, "boom");
        assert_eq!(report.min_line(), Some(3));
    }

    #[test]
    fn buffers_and_scalars_accumulate() {
        let mut report = Report::new();
        report.apply(Event::Stdout(b"ab".to_vec()));
        report.apply(Event::Stdout(b"cd".to_vec()));
        report.apply(Event::Stderr(b"oops".to_vec()));
        report.apply(Event::NumLines(9));
        report.apply(Event::MaxLineCaptures(CaptureCap::Unbounded));
        report.apply(Event::Filename("probe.rs".to_string()));
        report.apply(Event::Exitstatus(3));
        report.apply(Event::Finished);
        assert_eq!(report.stdout_lossy(), "abcd");
        assert_eq!(report.stderr_lossy(), "oops");
        assert_eq!(report.num_lines, Some(9));
        assert_eq!(report.exitstatus, Some(3));
        assert_eq!(report.filename.as_deref(), Some("probe.rs"));
    }
}
