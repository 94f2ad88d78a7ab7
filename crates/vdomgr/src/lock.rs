//! Scoped advisory file locks.
//!
//! Serializes independent manager invocations against the same
//! configuration file. Acquisition with a timeout is a non-blocking
//! `flock` retried in a short-sleep deadline loop; the guard releases the
//! lock on every exit path when it is dropped.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::{Result, VdoError};

/// Timeout for configuration-file access.
pub const LOCK_TIMEOUT_SECS: u64 = 20;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An advisory lock on a path, created with mode 0644 if absent.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    exclusive: bool,
    timeout: Option<Duration>,
}

/// Holds the lock; dropping it releases the lock and closes the file.
#[derive(Debug)]
pub struct LockGuard {
    _lock: Flock<File>,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!("released lock {}", self.path.display());
    }
}

impl FileLock {
    pub fn shared(path: impl AsRef<Path>) -> Self {
        FileLock {
            path: path.as_ref().to_path_buf(),
            exclusive: false,
            timeout: None,
        }
    }

    pub fn exclusive(path: impl AsRef<Path>) -> Self {
        FileLock {
            path: path.as_ref().to_path_buf(),
            exclusive: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(Duration::from_secs(seconds));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(&self) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mode = if self.exclusive { "exclusive" } else { "shared" };
        debug!("attempting to lock {} mode {mode}", self.path.display());

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut file = self.open()?;
        loop {
            let arg = match (self.exclusive, deadline.is_some()) {
                (true, true) => FlockArg::LockExclusiveNonblock,
                (true, false) => FlockArg::LockExclusive,
                (false, true) => FlockArg::LockSharedNonblock,
                (false, false) => FlockArg::LockShared,
            };
            match Flock::lock(file, arg) {
                Ok(lock) => {
                    return Ok(LockGuard {
                        _lock: lock,
                        path: self.path.clone(),
                    });
                }
                Err((returned, Errno::EWOULDBLOCK)) => {
                    match deadline {
                        Some(deadline) if Instant::now() < deadline => {
                            file = returned;
                            sleep(POLL_INTERVAL);
                        }
                        _ => {
                            return Err(VdoError::LockTimeout {
                                path: self.path.clone(),
                                seconds: self
                                    .timeout
                                    .unwrap_or_default()
                                    .as_secs(),
                            });
                        }
                    }
                }
                Err((_, errno)) => {
                    return Err(VdoError::System(format!(
                        "could not lock {}: {errno}",
                        self.path.display()
                    )));
                }
            }
        }
    }

    fn open(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&self.path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let lock = FileLock::exclusive(&path).with_timeout(1);
        let guard = lock.acquire().unwrap();
        drop(guard);
        lock.acquire().unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let first = FileLock::shared(&path).with_timeout(1).acquire().unwrap();
        let _second = FileLock::shared(&path).with_timeout(1).acquire().unwrap();
        drop(first);
    }

    #[test]
    fn exclusive_lock_times_out_when_contended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let _held = FileLock::exclusive(&path).acquire().unwrap();
        let err = FileLock::exclusive(&path)
            .with_timeout(1)
            .acquire()
            .unwrap_err();
        match err {
            VdoError::LockTimeout { seconds, .. } => assert_eq!(seconds, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/test.lock");
        FileLock::exclusive(&path).with_timeout(1).acquire().unwrap();
        assert!(path.exists());
    }
}
