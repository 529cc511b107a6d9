//! Parent-side event fan-in.
//!
//! Three reader threads (stdout drain, stderr drain, event-channel
//! decode) push onto one shared queue. Each pushes a distinct stream-done
//! marker at end-of-stream instead of terminating silently, so the
//! consumer can tell "quiet" from "over": `next_event` only becomes
//! terminal once all three markers have been observed.
//!
//! Ordering is FIFO within each sub-stream; no cross-stream order is
//! guaranteed. Protocol faults (unknown tag, truncated exception block)
//! are fatal to iteration and surface as typed errors, never skipped.

use crate::config::types::{ProbeError, Result};
use crate::wire::{Decoder, Event};
use crossbeam_channel::{Receiver, Sender};
use log::debug;
use std::io::{BufReader, Read};
use std::thread;

const READ_CHUNK: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamId {
    Stdout,
    Stderr,
    Events,
}

enum QueueItem {
    Event(Event),
    Done(StreamId),
    Fault(ProbeError),
}

fn drain_bytes<R: Read>(
    stream: R,
    id: StreamId,
    wrap: fn(Vec<u8>) -> Event,
    tx: &Sender<QueueItem>,
) {
    let mut reader = BufReader::new(stream);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(QueueItem::Event(wrap(chunk[..n].to_vec()))).is_err() {
                    return;
                }
            }
            // A forced kill closes the pipe under us; that is end of
            // stream, not corruption.
            Err(_) => break,
        }
    }
    debug!("{id:?} drain reached end of stream");
    let _ = tx.send(QueueItem::Done(id));
}

fn drain_events<R: Read>(stream: R, tx: &Sender<QueueItem>) {
    let mut decoder = Decoder::new(BufReader::new(stream));
    loop {
        match decoder.next_event() {
            Ok(Some(event)) => {
                if tx.send(QueueItem::Event(event)).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(fault) => {
                let _ = tx.send(QueueItem::Fault(fault));
                return;
            }
        }
    }
    debug!("event-channel drain reached end of stream");
    let _ = tx.send(QueueItem::Done(StreamId::Events));
}

/// Fans the child's three byte streams into one ordered event sequence.
pub struct EventConsumer {
    rx: Receiver<QueueItem>,
    done: [bool; 3],
    terminal: bool,
}

impl EventConsumer {
    pub fn new<O, E, V>(stdout: O, stderr: E, events: V) -> Self
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
        V: Read + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();

        let out_tx = tx.clone();
        thread::spawn(move || drain_bytes(stdout, StreamId::Stdout, Event::Stdout, &out_tx));
        let err_tx = tx.clone();
        thread::spawn(move || drain_bytes(stderr, StreamId::Stderr, Event::Stderr, &err_tx));
        thread::spawn(move || drain_events(events, &tx));

        Self {
            rx,
            done: [false; 3],
            terminal: false,
        }
    }

    fn all_done(&self) -> bool {
        self.done.iter().all(|d| *d)
    }

    /// Blocks until the next event is available. Stream-done markers are
    /// consumed transparently; once all three have been observed this
    /// returns [`ProbeError::NoMoreInput`] forever.
    pub fn next_event(&mut self) -> Result<Event> {
        if self.terminal {
            return Err(ProbeError::NoMoreInput);
        }
        loop {
            match self.rx.recv() {
                Ok(QueueItem::Event(event)) => return Ok(event),
                Ok(QueueItem::Done(id)) => {
                    self.done[id as usize] = true;
                    if self.all_done() {
                        self.terminal = true;
                        return Err(ProbeError::NoMoreInput);
                    }
                }
                Ok(QueueItem::Fault(fault)) => {
                    self.terminal = true;
                    return Err(fault);
                }
                Err(_) => {
                    self.terminal = true;
                    return Err(ProbeError::BrokenChannel(
                        "reader tasks exited without done markers".to_string(),
                    ));
                }
            }
        }
    }

    /// Lazy, forward-only, single-pass sequence ending exactly at
    /// `NoMoreInput`. Protocol faults are yielded as the final item.
    pub fn events(&mut self) -> Events<'_> {
        Events { consumer: self }
    }
}

pub struct Events<'a> {
    consumer: &'a mut EventConsumer,
}

impl Iterator for Events<'_> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.consumer.next_event() {
            Ok(event) => Some(Ok(event)),
            Err(ProbeError::NoMoreInput) => None,
            Err(fault) => Some(Err(fault)),
        }
    }
}
