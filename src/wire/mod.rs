//! Line-oriented wire protocol for the event channel.
//!
//! One newline-terminated record per event, tag first, space-separated
//! fields after. Any field that can contain arbitrary bytes (embedded
//! newlines, NUL, non-UTF-8) travels as a single base64 blob token so the
//! record stays exactly one line. `exception` is the one multi-line block:
//! backtrace depth is variable and its fields can be large.
//!
//! Decoding is strict: unrecognized tags raise [`ProbeError::UnknownEvent`]
//! and a stream that ends inside an exception block raises
//! [`ProbeError::MalformedRecord`]. Corruption here signals a bug, not a
//! property of the evaluated program, so nothing is skipped.

use crate::config::types::{CaptureCap, ProbeError, Result, ResultKind};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::fmt::Write as _;
use std::io::BufRead;

/// Closing sentinel for the `exception` multi-line block.
const BLOCK_END: &str = "end";

/// Exception captured in the child, as carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedException {
    /// 1-based program line the exception is attributed to.
    pub line: u32,
    pub class_name: String,
    pub message: String,
    pub backtrace: Vec<String>,
}

/// Closed event vocabulary.
///
/// `NumLines`, `MaxLineCaptures` and `Filename` are the metadata records;
/// everything else is produced while the program runs, except `Exitstatus`
/// and `Finished` which close the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    LineResult {
        kind: ResultKind,
        line: u32,
        text: String,
    },
    UnrecordedResult {
        kind: ResultKind,
        line: u32,
    },
    Exception(RecordedException),
    NumLines(u32),
    MaxLineCaptures(CaptureCap),
    Filename(String),
    Exitstatus(i32),
    Finished,
}

/// Encode an opaque byte sequence as a single text-safe token.
pub fn encode_blob(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_blob(token: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(token)
        .map_err(|e| ProbeError::MalformedRecord(format!("bad blob token: {e}")))
}

/// Encode one event as its newline-terminated wire record(s).
pub fn encode(event: &Event) -> String {
    match event {
        Event::Stdout(bytes) => format!("stdout {}\n", encode_blob(bytes)),
        Event::Stderr(bytes) => format!("stderr {}\n", encode_blob(bytes)),
        Event::LineResult { kind, line, text } => {
            format!(
                "result {} {} {}\n",
                line,
                kind.token(),
                encode_blob(text.as_bytes())
            )
        }
        Event::UnrecordedResult { kind, line } => {
            format!("maxed_result {} {}\n", line, kind.token())
        }
        Event::Exception(exception) => {
            let mut block = String::new();
            let _ = writeln!(block, "exception");
            let _ = writeln!(block, "line {}", exception.line);
            let _ = writeln!(block, "class {}", encode_blob(exception.class_name.as_bytes()));
            let _ = writeln!(block, "message {}", encode_blob(exception.message.as_bytes()));
            for frame in &exception.backtrace {
                let _ = writeln!(block, "backtrace {}", encode_blob(frame.as_bytes()));
            }
            let _ = writeln!(block, "{BLOCK_END}");
            block
        }
        Event::NumLines(count) => format!("num_lines {count}\n"),
        Event::MaxLineCaptures(cap) => format!("max_line_captures {}\n", cap.to_wire()),
        Event::Filename(name) => format!("filename {}\n", encode_blob(name.as_bytes())),
        Event::Exitstatus(code) => format!("exitstatus {code}\n"),
        Event::Finished => "finish\n".to_string(),
    }
}

fn parse_u32(token: &str, what: &str) -> Result<u32> {
    token
        .parse::<u32>()
        .map_err(|_| ProbeError::MalformedRecord(format!("bad {what}: {token}")))
}

fn parse_i32(token: &str, what: &str) -> Result<i32> {
    token
        .parse::<i32>()
        .map_err(|_| ProbeError::MalformedRecord(format!("bad {what}: {token}")))
}

fn decode_text_blob(token: &str, what: &str) -> Result<String> {
    let bytes = decode_blob(token)?;
    String::from_utf8(bytes)
        .map_err(|_| ProbeError::MalformedRecord(format!("{what} is not valid UTF-8")))
}

fn split_record(record: &str) -> (&str, Vec<&str>) {
    let mut tokens = record.split_whitespace();
    let tag = tokens.next().unwrap_or("");
    (tag, tokens.collect())
}

fn expect_arity(tag: &str, fields: &[&str], want: usize) -> Result<()> {
    if fields.len() == want {
        Ok(())
    } else {
        Err(ProbeError::MalformedRecord(format!(
            "{tag} expects {want} field(s), got {}",
            fields.len()
        )))
    }
}

/// Streaming decoder over the event channel.
pub struct Decoder<R> {
    reader: R,
}

impl<R: BufRead> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    fn read_record(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                ProbeError::MalformedRecord("record is not valid UTF-8".to_string())
            } else {
                ProbeError::Io(e)
            }
        })?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Decode the next event. `Ok(None)` means clean end-of-stream.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        let record = loop {
            match self.read_record()? {
                None => return Ok(None),
                // Blank lines are not part of the vocabulary; tolerate them
                // between records but never inside a block.
                Some(record) if record.trim().is_empty() => continue,
                Some(record) => break record,
            }
        };

        let (tag, fields) = split_record(&record);
        let event = match tag {
            "stdout" => {
                expect_arity(tag, &fields, 1)?;
                Event::Stdout(decode_blob(fields[0])?)
            }
            "stderr" => {
                expect_arity(tag, &fields, 1)?;
                Event::Stderr(decode_blob(fields[0])?)
            }
            "result" => {
                expect_arity(tag, &fields, 3)?;
                Event::LineResult {
                    line: parse_u32(fields[0], "line number")?,
                    kind: ResultKind::from_token(fields[1])?,
                    text: decode_text_blob(fields[2], "result text")?,
                }
            }
            "maxed_result" => {
                expect_arity(tag, &fields, 2)?;
                Event::UnrecordedResult {
                    line: parse_u32(fields[0], "line number")?,
                    kind: ResultKind::from_token(fields[1])?,
                }
            }
            "exception" => {
                expect_arity(tag, &fields, 0)?;
                Event::Exception(self.decode_exception_block()?)
            }
            "num_lines" => {
                expect_arity(tag, &fields, 1)?;
                Event::NumLines(parse_u32(fields[0], "line count")?)
            }
            "max_line_captures" => {
                expect_arity(tag, &fields, 1)?;
                Event::MaxLineCaptures(CaptureCap::from_wire(fields[0])?)
            }
            "filename" => {
                expect_arity(tag, &fields, 1)?;
                Event::Filename(decode_text_blob(fields[0], "filename")?)
            }
            "exitstatus" => {
                expect_arity(tag, &fields, 1)?;
                Event::Exitstatus(parse_i32(fields[0], "exit status")?)
            }
            "finish" => {
                expect_arity(tag, &fields, 0)?;
                Event::Finished
            }
            other => return Err(ProbeError::UnknownEvent(other.to_string())),
        };
        Ok(Some(event))
    }

    fn decode_exception_block(&mut self) -> Result<RecordedException> {
        let mut line: Option<u32> = None;
        let mut class_name: Option<String> = None;
        let mut message: Option<String> = None;
        let mut backtrace = Vec::new();

        loop {
            let record = self.read_record()?.ok_or_else(|| {
                ProbeError::MalformedRecord("stream ended inside exception block".to_string())
            })?;
            if record == BLOCK_END {
                break;
            }
            let (field, fields) = split_record(&record);
            match field {
                "line" => {
                    expect_arity(field, &fields, 1)?;
                    line = Some(parse_u32(fields[0], "exception line")?);
                }
                "class" => {
                    expect_arity(field, &fields, 1)?;
                    class_name = Some(decode_text_blob(fields[0], "exception class")?);
                }
                "message" => {
                    expect_arity(field, &fields, 1)?;
                    message = Some(decode_text_blob(fields[0], "exception message")?);
                }
                "backtrace" => {
                    expect_arity(field, &fields, 1)?;
                    backtrace.push(decode_text_blob(fields[0], "backtrace frame")?);
                }
                other => {
                    return Err(ProbeError::MalformedRecord(format!(
                        "unknown exception field: {other}"
                    )))
                }
            }
        }

        Ok(RecordedException {
            line: line.ok_or_else(|| {
                ProbeError::MalformedRecord("exception block missing line".to_string())
            })?,
            class_name: class_name.ok_or_else(|| {
                ProbeError::MalformedRecord("exception block missing class".to_string())
            })?,
            message: message.ok_or_else(|| {
                ProbeError::MalformedRecord("exception block missing message".to_string())
            })?,
            backtrace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(event: Event) {
        let encoded = encode(&event);
        let mut decoder = Decoder::new(Cursor::new(encoded.into_bytes()));
        let decoded = decoder.next_event().unwrap().expect("one event");
        assert_eq!(decoded, event);
        assert!(decoder.next_event().unwrap().is_none());
    }

    #[test]
    fn round_trips_every_event_kind() {
        round_trip(Event::Stdout(b"plain".to_vec()));
        round_trip(Event::Stderr(b"warn: x\n".to_vec()));
        round_trip(Event::LineResult {
            kind: ResultKind::Inspect,
            line: 3,
            text: "\"ab\\ncd\"".to_string(),
        });
        round_trip(Event::UnrecordedResult {
            kind: ResultKind::Pp,
            line: 9,
        });
        round_trip(Event::Exception(RecordedException {
            line: 4,
            class_name: "ZeroDivisionError".to_string(),
            message: "divided by 0\nreally".to_string(),
            backtrace: vec!["probe.rs:4".to_string(), "probe.rs:10".to_string()],
        }));
        round_trip(Event::NumLines(12));
        round_trip(Event::MaxLineCaptures(CaptureCap::Finite(5)));
        round_trip(Event::MaxLineCaptures(CaptureCap::Unbounded));
        round_trip(Event::Filename("spaced name.rs".to_string()));
        round_trip(Event::Exitstatus(0));
        round_trip(Event::Exitstatus(-11));
        round_trip(Event::Finished);
    }

    #[test]
    fn round_trips_hostile_blob_content() {
        round_trip(Event::Stdout(vec![0, 1, 2, 255, b'\n', 0, b'\r']));
        round_trip(Event::Stderr("héllo → wörld\n\n".as_bytes().to_vec()));
        round_trip(Event::LineResult {
            kind: ResultKind::Inspect,
            line: 1,
            text: "line one\nline two\ttabbed".to_string(),
        });
        round_trip(Event::Filename("weird\nname with spaces".to_string()));
    }

    #[test]
    fn blob_records_stay_single_line() {
        let encoded = encode(&Event::Stdout(b"a\nb\nc".to_vec()));
        assert_eq!(encoded.matches('\n').count(), 1);
        assert!(encoded.ends_with('\n'));
    }

    #[test]
    fn unknown_tag_is_a_typed_error() {
        let mut decoder = Decoder::new(Cursor::new(b"frobnicate 1 2\n".to_vec()));
        match decoder.next_event() {
            Err(ProbeError::UnknownEvent(tag)) => assert_eq!(tag, "frobnicate"),
            other => panic!("expected UnknownEvent, got {other:?}"),
        }
    }

    #[test]
    fn truncated_exception_block_is_malformed() {
        let partial = "exception\nline 3\n";
        let mut decoder = Decoder::new(Cursor::new(partial.as_bytes().to_vec()));
        match decoder.next_event() {
            Err(ProbeError::MalformedRecord(msg)) => {
                assert!(msg.contains("exception block"), "got: {msg}")
            }
            other => panic!("expected MalformedRecord, got {other:?}"),
        }
    }

    #[test]
    fn bad_arity_is_malformed() {
        let mut decoder = Decoder::new(Cursor::new(b"exitstatus\n".to_vec()));
        assert!(matches!(
            decoder.next_event(),
            Err(ProbeError::MalformedRecord(_))
        ));
    }

    #[test]
    fn decodes_consecutive_records_in_order() {
        let mut stream = String::new();
        stream.push_str(&encode(&Event::NumLines(2)));
        stream.push_str(&encode(&Event::Stdout(b"x".to_vec())));
        stream.push_str(&encode(&Event::Finished));
        let mut decoder = Decoder::new(Cursor::new(stream.into_bytes()));
        assert_eq!(decoder.next_event().unwrap(), Some(Event::NumLines(2)));
        assert_eq!(
            decoder.next_event().unwrap(),
            Some(Event::Stdout(b"x".to_vec()))
        );
        assert_eq!(decoder.next_event().unwrap(), Some(Event::Finished));
        assert_eq!(decoder.next_event().unwrap(), None);
    }
}
