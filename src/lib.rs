//! probebox: an out-of-process execution supervisor
//!
//! Runs a supplied, already-instrumented program in an isolated child
//! process, captures a structured stream of per-line results plus
//! stdout/stderr and exceptions, and returns them to the caller, while
//! guaranteeing that any file it temporarily replaced on disk is restored
//! exactly, even under a crash or interrupt.
//!
//! # Architecture
//!
//! ## Crash-safe file swap ([`safety`])
//! - [`safety::backup`]: parks an original file, installs replacement
//!   content, restores on teardown
//! - [`safety::guard`]: guaranteed-once finalizer surviving SIGINT
//!
//! ## Wire protocol ([`wire`])
//! - Line-oriented, binary-safe encode/decode for a closed event vocabulary
//!
//! ## Child side ([`producer`])
//! - [`producer::EventProducer`]: emits recording/exception events with
//!   capture-cap backpressure; a background sender drains onto the event fd
//!
//! ## Parent side ([`consumer`])
//! - [`consumer::EventConsumer`]: fans three byte streams into one ordered
//!   event sequence
//!
//! ## Execution control ([`exec`])
//! - [`exec::supervisor`]: spawns the child in its own process group,
//!   enforces the timeout, reaps status
//! - [`exec::run`]: full install, supervise, restore pipeline
//!
//! ## Aggregation ([`report`])
//! - [`report::Report`]: folds the event stream into addressable per-line
//!   results with bounded memory
//!
//! # Design principles
//!
//! 1. **Exactly-once restoration** - one teardown per install, on every
//!    control path including asynchronous signals
//! 2. **Kernel as truth** - the OS-observed exit status is authoritative;
//!    anything the child reports about itself is advisory
//! 3. **Protocol failures are bugs** - malformed records raise typed
//!    errors, never get skipped
//! 4. **Process outcomes are data** - timeouts and signal deaths are
//!    reported in the result, not thrown

pub mod config;
pub mod consumer;
pub mod exec;
pub mod producer;
pub mod report;
pub mod safety;
pub mod wire;

pub use config::types::{
    CaptureCap, ExecutionRequest, InputSource, ProbeError, Result, ResultKind,
};
pub use report::{Line, Report};
pub use wire::{Event, RecordedException};
