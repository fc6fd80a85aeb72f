//! Evicts least recently used entries once the cache outgrows its limit

use super::{CacheLock, ImageCache};
use crate::error::Result;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Pruner {
    cache: Arc<ImageCache>,
    lock_dir: PathBuf,
}

impl Pruner {
    pub fn new(cache: Arc<ImageCache>, lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache,
            lock_dir: lock_dir.into(),
        }
    }

    /// Entries and bytes evicted
    pub async fn run(&self) -> Result<(usize, u64)> {
        let _lock = CacheLock::acquire(&self.lock_dir).await?;
        self.cache.prune().await
    }
}
