// # Advisory Locks
//
// Host-wide named mutual exclusion for external tool-chain steps.
//
// A lock is a file; holding it means holding an exclusive `File::try_lock`
// (`flock(LOCK_EX | LOCK_NB)` on Linux) on an open descriptor of that file.
// Acquisition never waits: if another process (or another descriptor in this
// process) holds the lock, acquisition fails with `Error::Lock`. The lock is released when the guard is dropped, and by the
// kernel if the holder dies.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Held advisory lock; released on drop
#[derive(Debug)]
pub struct AdvisoryLock {
    file: File,
    path: PathBuf,
}

impl AdvisoryLock {
    /// Try to take the lock at `path` without blocking
    ///
    /// The lock file is created if missing and never deleted.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::lock_exclusive(&file, &path)?;

        Ok(Self { file, path })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_exclusive(file: &File, path: &Path) -> Result<()> {
        match file.try_lock() {
            Ok(()) => Ok(()),
            Err(TryLockError::WouldBlock) => Err(Error::lock(path.display().to_string())),
            Err(TryLockError::Error(e)) => Err(Error::Io(e)),
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well; unlocking first
        // keeps release ordered before the guard's drop returns.
        if let Err(e) = self.file.unlock() {
            tracing::debug!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpn_confgen_lock_file");

        let held = AdvisoryLock::try_acquire(&path).unwrap();
        assert_eq!(held.path(), path.as_path());

        let second = AdvisoryLock::try_acquire(&path);
        assert!(matches!(second, Err(Error::Lock { .. })));
    }

    #[test]
    fn test_release_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpn_install2_lock_file");

        drop(AdvisoryLock::try_acquire(&path).unwrap());

        assert!(AdvisoryLock::try_acquire(&path).is_ok());
    }

    #[test]
    fn test_distinct_paths_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();

        let _install = AdvisoryLock::try_acquire(dir.path().join("install")).unwrap();
        let confgen = AdvisoryLock::try_acquire(dir.path().join("confgen"));
        assert!(confgen.is_ok());
    }
}
