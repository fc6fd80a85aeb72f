//! Cleans up invalid and stalled cache entries

use super::{CacheLock, ImageCache};
use crate::error::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct Cleaner {
    cache: Arc<ImageCache>,
    lock_dir: PathBuf,
    stall_time: Duration,
}

impl Cleaner {
    pub fn new(cache: Arc<ImageCache>, lock_dir: impl Into<PathBuf>, stall_time: Duration) -> Self {
        Self {
            cache,
            lock_dir: lock_dir.into(),
            stall_time,
        }
    }

    /// Number of entries removed
    pub async fn run(&self) -> Result<usize> {
        let _lock = CacheLock::acquire(&self.lock_dir).await?;
        self.cache.clean(self.stall_time).await
    }
}
