//! Cross-process exclusion for commands that change the network plane.
//!
//! The reconciler's mutation lock only covers one process. Every mutating
//! command also holds an exclusive `flock` on `<store>/netplane.lock`, so a
//! one-off `sync-bridge` or `cleanup` cannot interleave with a running
//! `start`.

use netplane_common::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "netplane.lock";

/// Held advisory lock; released on drop
pub struct StoreLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl StoreLock {
    /// Take the lock without waiting. Fails when another process holds it.
    pub fn acquire(store_path: &Path) -> Result<Self> {
        Self::try_acquire(store_path)?.ok_or_else(|| {
            Error::InvalidConfig(format!(
                "another netplaned process holds {}",
                store_path.join(LOCK_FILE).display()
            ))
        })
    }

    /// Take the lock without waiting; None when another process holds it
    pub fn try_acquire(store_path: &Path) -> Result<Option<Self>> {
        let path = store_path.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(Self { _lock: lock, path })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(Error::Io(errno.into())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
