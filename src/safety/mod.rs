// Crash-safe file swap: backup slot + guaranteed-once finalizer guard.
pub mod backup;
pub mod guard;
