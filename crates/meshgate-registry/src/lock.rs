//! Cross-process lock over the store.
//!
//! The store itself is replaced by rename on every commit, so the lock is
//! held on a sibling `<store>.lock` file that is never replaced. Locks are
//! per open file, which makes them work between threads of one process as
//! well as between processes.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{RegistryError, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Readers; any number may hold it at once.
    Shared,
    /// A single writer.
    Exclusive,
}

/// A held lock on the store. Released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl StoreLock {
    /// Returns the lock file path for a store path.
    #[must_use]
    pub fn path_for(store: &Path) -> PathBuf {
        let mut name = store.file_name().map(ToOwned::to_owned).unwrap_or_default();
        name.push(".lock");
        store.with_file_name(name)
    }

    /// Acquires the exclusive lock, waiting at most `timeout` if given.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LockTimeout`] when the deadline passes, or a
    /// storage error if the lock file cannot be opened.
    pub fn exclusive(path: &Path, timeout: Option<Duration>) -> Result<Self> {
        let file = open(path)?;

        let Some(timeout) = timeout else {
            file.lock().map_err(|e| RegistryError::storage(path, e))?;
            return Ok(Self::held(file, path, LockMode::Exclusive));
        };

        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match file.try_lock() {
                Ok(()) => {
                    trace!(path = %path.display(), waited = ?started.elapsed(), "exclusive lock acquired");
                    return Ok(Self::held(file, path, LockMode::Exclusive));
                }
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(e)) => return Err(RegistryError::storage(path, e)),
            }

            let waited = started.elapsed();
            if waited >= timeout {
                debug!(path = %path.display(), ?waited, "lock wait timed out");
                return Err(RegistryError::LockTimeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            thread::sleep(backoff.min(timeout - waited));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Acquires a shared lock, blocking while a writer holds the lock.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lock file cannot be opened or locked.
    pub fn shared(path: &Path) -> Result<Self> {
        let file = open(path)?;
        file.lock_shared().map_err(|e| RegistryError::storage(path, e))?;
        Ok(Self::held(file, path, LockMode::Shared))
    }

    fn held(file: File, path: &Path, mode: LockMode) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            mode,
        }
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the held mode.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // Closing the file releases the lock as well.
        let _ = self.file.unlock();
        trace!(path = %self.path.display(), mode = ?self.mode, "lock released");
    }
}

fn open(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| RegistryError::storage(path, e))
}
