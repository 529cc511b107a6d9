//! Execution control: the supervisor plus the full install → supervise →
//! restore pipeline.

pub mod supervisor;

pub use supervisor::{execute, spawn_child, ChildHandle, RunOutcome};

use crate::config::types::{ExecutionRequest, Result};
use crate::safety::backup::BackupSlot;
use crate::safety::guard::run_guarded;
use log::{info, warn};

/// Install the instrumented text over the target file, run it under
/// supervision, and restore the original exactly once, whether the run
/// completes, errors, or an interrupt arrives mid-flight.
///
/// Fails with `AlreadyPending` before any child spawns when a stale
/// backup marker exists.
pub fn run(request: ExecutionRequest) -> Result<RunOutcome> {
    info!("running {} under supervision", request.path.display());
    let slot = BackupSlot::install(&request.path, &request.program)?;
    run_guarded(
        || {
            if let Err(e) = slot.teardown() {
                warn!("teardown of {} failed: {e}", slot.path().display());
            }
        },
        move || supervisor::execute(request),
    )
}
