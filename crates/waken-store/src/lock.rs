//! Exclusive locks serialising writers of shared state.
//!
//! A `StoreLock` pairs an in-process mutex (so threads of one process queue
//! up instead of contending on the file) with an advisory `flock`-style lock
//! on a lock file (so a second process waits too).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs2::FileExt;
use tracing::debug;

use crate::StoreError;

/// A named exclusive lock backed by a lock file.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    local: Mutex<()>,
}

/// Held lock; released on drop.
pub struct LockGuard<'a> {
    file: File,
    _local: MutexGuard<'a, ()>,
}

impl StoreLock {
    /// Create a lock using `path` as the lock file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            local: Mutex::new(()),
        }
    }

    /// The lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held by this thread.
    pub fn acquire(&self) -> Result<LockGuard<'_>, StoreError> {
        // A poisoned mutex only means another thread panicked while holding
        // it; the on-disk state is still protected by rename discipline.
        let local = self.local.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        FileExt::lock_exclusive(&file).map_err(|source| StoreError::Lock {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "acquired lock");

        Ok(LockGuard {
            file,
            _local: local,
        })
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_lock_is_reacquirable_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = StoreLock::new(dir.path().join("a.lock"));

        drop(lock.acquire().unwrap());
        drop(lock.acquire().unwrap());
        assert!(lock.path().exists());
    }

    #[test]
    fn test_lock_serialises_threads() {
        let dir = tempfile::tempdir().unwrap();
        let lock = Arc::new(StoreLock::new(dir.path().join("b.lock")));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let _guard = lock.acquire().unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
