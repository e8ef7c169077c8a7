//! Single-instance lock on the node data directory.
//!
//! The lock is an exclusive advisory file lock held for as long as the
//! [`LockFile`] value lives. A second node pointed at the same directory
//! fails to start with [`ProtocolError::DirectoryLocked`].

use crate::error::{constants, ProtocolError, Result};
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the lock file inside the data directory
pub const LOCK_FILE_NAME: &str = "lock";

/// Held exclusive lock on a file, normally `<data_dir>/lock`
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Create the parent directory if needed and take the lock on `path`
    /// without blocking
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock() {
            Ok(()) => {
                debug!(path = %path.display(), "Acquired data directory lock");
                Ok(Self { file, path })
            }
            Err(TryLockError::WouldBlock) => {
                warn!(path = %path.display(), "{}", constants::ERR_DIRECTORY_LOCKED);
                Err(ProtocolError::DirectoryLocked(path))
            }
            Err(TryLockError::Error(e)) => Err(ProtocolError::Io(e)),
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "Failed to release directory lock");
        }
    }
}
