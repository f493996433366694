//! Advisory whole-file locking.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use tracing::{debug, warn};

use crate::config::LockingConfig;
use crate::error::{MboxError, Result};

/// Lock primitive used by a mailbox handle.
///
/// `lock` returns `Ok(false)` when someone else holds a conflicting lock;
/// only real system errors are reported as `Err`.
pub trait Locker {
    fn lock(&self, file: &File, path: &Path, exclusive: bool, blocking: bool) -> Result<bool>;
    fn unlock(&self, file: &File, path: &Path) -> Result<()>;
}

/// `flock(2)` locking with a bounded retry for blocking requests.
#[derive(Debug, Clone)]
pub struct FlockLocker {
    retries: u32,
    retry_delay: Duration,
}

impl FlockLocker {
    pub fn new(retries: u32, retry_delay: Duration) -> Self {
        Self {
            retries,
            retry_delay,
        }
    }

    pub fn from_config(config: &LockingConfig) -> Self {
        Self::new(config.retries, Duration::from_millis(config.retry_delay_ms))
    }
}

impl Default for FlockLocker {
    fn default() -> Self {
        Self::from_config(&LockingConfig::default())
    }
}

impl Locker for FlockLocker {
    fn lock(&self, file: &File, path: &Path, exclusive: bool, blocking: bool) -> Result<bool> {
        let arg = if exclusive {
            FlockArg::LockExclusiveNonblock
        } else {
            FlockArg::LockSharedNonblock
        };
        let attempts = if blocking { self.retries.max(1) } else { 1 };

        for attempt in 1..=attempts {
            match flock(file.as_raw_fd(), arg) {
                Ok(()) => return Ok(true),
                Err(e) if e == Errno::EWOULDBLOCK || e == Errno::EINTR => {
                    if attempt < attempts {
                        debug!(path = %path.display(), attempt, "Waiting for mailbox lock");
                        std::thread::sleep(self.retry_delay);
                    }
                }
                Err(e) => return Err(MboxError::io(path, std::io::Error::from(e))),
            }
        }

        if blocking {
            warn!(path = %path.display(), "Could not acquire mailbox lock");
        }
        Ok(false)
    }

    fn unlock(&self, file: &File, path: &Path) -> Result<()> {
        flock(file.as_raw_fd(), FlockArg::Unlock)
            .map_err(|e| MboxError::io(path, std::io::Error::from(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> FlockLocker {
        FlockLocker::new(2, Duration::from_millis(10))
    }

    #[test]
    fn test_exclusive_lock_conflicts_between_open_files() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let a = File::open(tmp.path()).unwrap();
        let b = File::open(tmp.path()).unwrap();
        let locker = quick();

        assert!(locker.lock(&a, tmp.path(), true, false).unwrap());
        assert!(!locker.lock(&b, tmp.path(), false, false).unwrap());
        assert!(!locker.lock(&b, tmp.path(), true, true).unwrap());

        locker.unlock(&a, tmp.path()).unwrap();
        assert!(locker.lock(&b, tmp.path(), true, false).unwrap());
    }

    #[test]
    fn test_shared_locks_coexist() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let a = File::open(tmp.path()).unwrap();
        let b = File::open(tmp.path()).unwrap();
        let locker = quick();

        assert!(locker.lock(&a, tmp.path(), false, false).unwrap());
        assert!(locker.lock(&b, tmp.path(), false, false).unwrap());
        assert!(!locker.lock(&b, tmp.path(), true, false).unwrap());
    }
}
