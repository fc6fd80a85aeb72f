//! Host-wide advisory lock serializing cache maintenance

use crate::error::{Result, TiticacaError};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = "titicaca-cache.lock";

/// Held `flock` on `<lock_dir>/titicaca-cache.lock`; released on drop
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

fn open_lock_file(lock_dir: &Path) -> Result<(File, PathBuf)> {
    std::fs::create_dir_all(lock_dir)?;
    let path = lock_dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;
    Ok((file, path))
}

impl CacheLock {
    /// Block until the lock is free
    pub async fn acquire(lock_dir: &Path) -> Result<Self> {
        let lock_dir = lock_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let (file, path) = open_lock_file(&lock_dir)?;
            // SAFETY: the descriptor stays open for the lifetime of `file`
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            debug!(path = %path.display(), "Acquired cache lock");
            Ok(Self { file, path })
        })
        .await
        .map_err(|e| TiticacaError::Other(format!("cache lock task failed: {}", e)))?
    }

    /// Take the lock only if nobody holds it
    pub fn try_acquire(lock_dir: &Path) -> Result<Option<Self>> {
        let (file, path) = open_lock_file(lock_dir)?;
        // SAFETY: as above
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }
        Ok(Some(Self { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        // SAFETY: as above
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!(path = %self.path.display(), "Released cache lock");
    }
}
