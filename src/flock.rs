use std::{
    fs::File,
    path::Path,
    time::{Duration, Instant},
};

use fs4::fs_std::FileExt;
use log::debug;
use thiserror::Error;

const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Exclusive advisory lock on a file, held until dropped.
pub struct FileLock {
    _file: File,
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out after {0:?} waiting for the lock")]
    Timeout(Duration),
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

impl FileLock {
    /// Blocks the current thread until the lock is acquired or `timeout`
    /// elapses.
    pub fn new(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let file = File::create(path)?;
        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(outcome) if outcome.acquired() => {
                    return Ok(Self { _file: file });
                }
                Ok(_) => {}
                Err(error)
                    if error.raw_os_error() == fs4::lock_contended_error().raw_os_error() => {}
                Err(error) => return Err(error.into()),
            }
            if start.elapsed() >= timeout {
                return Err(LockError::Timeout(timeout));
            }
            debug!("Failed to acquire a lock on {}, retrying", path.display());
            std::thread::sleep(RETRY_INTERVAL.min(timeout));
        }
    }
}

// fs4 releases disagree on reporting contention as an error or as `Ok(false)`.
trait LockOutcome {
    fn acquired(self) -> bool;
}

impl LockOutcome for () {
    fn acquired(self) -> bool {
        true
    }
}

impl LockOutcome for bool {
    fn acquired(self) -> bool {
        self
    }
}
