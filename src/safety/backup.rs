//! Atomic file swap with exactly-once restoration.
//!
//! `install` parks the original file at a sibling backup path and writes
//! replacement content in its place; `teardown` puts the world back. The
//! backup file doubles as the on-disk marker: while it exists, an install
//! is pending (or a previous run crashed before restoring), and a second
//! install against the same path is refused rather than clobbering the
//! evidence.

use crate::config::types::{ProbeError, Result};
use log::{debug, warn};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Suffix appended to the target path to form the backup marker path.
pub const BACKUP_SUFFIX: &str = ".probebox_backup";

/// Backup marker path for a given target path.
pub fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// One pending installation against one target path.
///
/// The target path is a single mutable resource: only one pending
/// installation is allowed per path, enforced by refusing `install` while
/// the marker exists.
#[derive(Debug)]
pub struct BackupSlot {
    path: PathBuf,
    backup_path: PathBuf,
    had_original: bool,
}

impl BackupSlot {
    /// Park any original at `path` and install `content` in its place.
    ///
    /// Fails with [`ProbeError::AlreadyPending`] when a backup marker
    /// already exists, before anything is touched.
    pub fn install(path: &Path, content: &str) -> Result<Self> {
        let backup_path = backup_path_for(path);
        if backup_path.exists() {
            return Err(ProbeError::AlreadyPending(backup_path));
        }

        let had_original = path.exists();
        if had_original {
            fs::rename(path, &backup_path).map_err(|e| {
                ProbeError::Filesystem(format!(
                    "failed to park {} at {}: {e}",
                    path.display(),
                    backup_path.display()
                ))
            })?;
            debug!("parked {} at {}", path.display(), backup_path.display());
        }

        if let Err(e) = fs::write(path, content) {
            // Roll the park back so a failed install leaves no marker.
            if had_original {
                if let Err(restore_err) = fs::rename(&backup_path, path) {
                    warn!(
                        "could not roll back park of {}: {restore_err}",
                        path.display()
                    );
                }
            }
            return Err(ProbeError::Filesystem(format!(
                "failed to install replacement at {}: {e}",
                path.display()
            )));
        }

        debug!("installed replacement content at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            backup_path,
            had_original,
        })
    }

    /// Transiently put original content back in place before final
    /// teardown. Teardown stays idempotent with respect to this.
    pub fn reveal(&self, original_content: &str) -> Result<()> {
        fs::write(&self.path, original_content).map_err(|e| {
            ProbeError::Filesystem(format!(
                "failed to reveal original at {}: {e}",
                self.path.display()
            ))
        })
    }

    /// Restore the original file, or delete the installed one when no
    /// original existed. Idempotent: a second call is a no-op.
    pub fn teardown(&self) -> Result<()> {
        if self.backup_path.exists() {
            fs::rename(&self.backup_path, &self.path).map_err(|e| {
                ProbeError::Filesystem(format!(
                    "failed to restore {} from {}: {e}",
                    self.path.display(),
                    self.backup_path.display()
                ))
            })?;
            debug!("restored original at {}", self.path.display());
        } else if !self.had_original && self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| {
                ProbeError::Filesystem(format!(
                    "failed to remove installed file {}: {e}",
                    self.path.display()
                ))
            })?;
            debug!("removed installed file {}", self.path.display());
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn had_original(&self) -> bool {
        self.had_original
    }
}
