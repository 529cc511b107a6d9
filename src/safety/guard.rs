//! Guaranteed-once finalizer surviving interrupt signals.
//!
//! `run_guarded` wraps an action with a finalizer that runs exactly once
//! no matter how control leaves the action: normal return, `Err`, panic
//! unwind, or SIGINT arriving mid-action. The handler installed for the
//! guarded region only touches atomics (async-signal-safe); the real work
//! happens on the main path after the action, and the interrupt is then
//! re-delivered under the previously-installed disposition so the
//! caller's termination semantics are preserved.

use crate::config::types::{ProbeError, Result};
use log::warn;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

/// Set from the signal handler; consumed exactly once per guarded region.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// The guard owns the SIGINT disposition for its whole region. Nesting is
/// unsupported; a second concurrent guard is refused.
static GUARD_ACTIVE: AtomicBool = AtomicBool::new(false);

extern "C" fn note_interrupt(_signal: libc::c_int) {
    // Atomic store only. No allocation, no locks, no I/O.
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Whether an interrupt has been observed in the current guarded region.
///
/// Long-running work inside the action (the supervisor's wait loop in
/// particular) polls this and bails out promptly so the finalizer and the
/// re-delivered interrupt are not deferred until the work completes on
/// its own.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

struct Teardown<'a, F: FnMut()> {
    finalizer: &'a mut F,
    previous: SigAction,
    ran: bool,
}

impl<F: FnMut()> Teardown<'_, F> {
    fn finish(&mut self) {
        if self.ran {
            return;
        }
        self.ran = true;
        (self.finalizer)();
        if let Err(e) = unsafe { sigaction(Signal::SIGINT, &self.previous) } {
            warn!("failed to restore SIGINT disposition: {e}");
        }
        GUARD_ACTIVE.store(false, Ordering::SeqCst);
        if INTERRUPTED.swap(false, Ordering::SeqCst) {
            // Finalizer has run and the previous handler is back in
            // place; hand the interrupt to it.
            unsafe {
                libc::raise(libc::SIGINT);
            }
        }
    }
}

impl<F: FnMut()> Drop for Teardown<'_, F> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Run `action` with `finalizer` guaranteed to run exactly once.
///
/// The SIGINT disposition is restored unconditionally before returning.
/// An interrupt observed during the action is re-raised after the
/// finalizer, under the restored disposition.
pub fn run_guarded<T, A, F>(mut finalizer: F, action: A) -> Result<T>
where
    A: FnOnce() -> Result<T>,
    F: FnMut(),
{
    if GUARD_ACTIVE.swap(true, Ordering::SeqCst) {
        return Err(ProbeError::Config(
            "nested crash-safe guards are not supported".to_string(),
        ));
    }
    INTERRUPTED.store(false, Ordering::SeqCst);

    let trap = SigAction::new(
        SigHandler::Handler(note_interrupt),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let previous = match unsafe { sigaction(Signal::SIGINT, &trap) } {
        Ok(previous) => previous,
        Err(e) => {
            GUARD_ACTIVE.store(false, Ordering::SeqCst);
            return Err(ProbeError::Process(format!("sigaction(SIGINT): {e}")));
        }
    };

    let mut teardown = Teardown {
        finalizer: &mut finalizer,
        previous,
        ran: false,
    };
    let result = action();
    teardown.finish();
    result
}
