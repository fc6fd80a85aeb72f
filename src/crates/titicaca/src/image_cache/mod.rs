//! Local image cache
//!
//! Layout under the cache directory:
//!
//! ```text
//! <dir>/<image_id>             complete, verified cache entries
//! <dir>/incomplete/<image_id>  entries being written
//! <dir>/invalid/<image_id>     entries that failed verification
//! <dir>/queue/<image_id>       empty markers for images to prefetch
//! ```
//!
//! Entry modification times double as last-access times for pruning.

mod cleaner;
mod lock;
mod prefetcher;
mod pruner;

pub use cleaner::Cleaner;
pub use lock::CacheLock;
pub use prefetcher::Prefetcher;
pub use pruner::Pruner;

use crate::config::ImageCacheConfig;
use crate::error::{Result, TiticacaError};
use crate::store::{file_stream, ImageData};
use futures::StreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// A complete cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedImage {
    pub image_id: String,
    pub size: u64,
    /// Unix seconds
    pub last_accessed: i64,
}

#[derive(Debug, Clone)]
pub struct ImageCache {
    dir: PathBuf,
    max_size: u64,
}

fn unix_secs(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Image ids become file names
fn check_id(image_id: &str) -> Result<()> {
    if image_id.is_empty()
        || image_id.contains('/')
        || image_id.contains('\\')
        || image_id.starts_with('.')
    {
        return Err(TiticacaError::Other(format!(
            "invalid image id for cache: {:?}",
            image_id
        )));
    }
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Regular files in `dir` with their metadata
async fn list_files(dir: &Path) -> Result<Vec<(String, std::fs::Metadata)>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() {
            files.push((entry.file_name().to_string_lossy().into_owned(), meta));
        }
    }
    Ok(files)
}

fn modified_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified().map(unix_secs).unwrap_or(0)
}

impl ImageCache {
    /// Open (and lay out) a cache directory
    pub async fn new(dir: impl Into<PathBuf>, max_size: u64) -> Result<Self> {
        let cache = Self {
            dir: dir.into(),
            max_size,
        };
        for sub in ["incomplete", "invalid", "queue"] {
            fs::create_dir_all(cache.dir.join(sub)).await?;
        }
        Ok(cache)
    }

    pub async fn from_config(config: &ImageCacheConfig) -> Result<Self> {
        Self::new(&config.image_cache_dir, config.image_cache_max_size).await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    fn cached_path(&self, image_id: &str) -> PathBuf {
        self.dir.join(image_id)
    }

    fn incomplete_path(&self, image_id: &str) -> PathBuf {
        self.dir.join("incomplete").join(image_id)
    }

    fn invalid_path(&self, image_id: &str) -> PathBuf {
        self.dir.join("invalid").join(image_id)
    }

    fn queue_path(&self, image_id: &str) -> PathBuf {
        self.dir.join("queue").join(image_id)
    }

    pub async fn is_cached(&self, image_id: &str) -> bool {
        check_id(image_id).is_ok() && fs::try_exists(self.cached_path(image_id)).await.unwrap_or(false)
    }

    pub async fn is_queued(&self, image_id: &str) -> bool {
        check_id(image_id).is_ok() && fs::try_exists(self.queue_path(image_id)).await.unwrap_or(false)
    }

    /// Queue an image for prefetching. Returns false when it is already
    /// cached or queued.
    pub async fn queue_image(&self, image_id: &str) -> Result<bool> {
        check_id(image_id)?;
        if self.is_cached(image_id).await {
            debug!(image_id = %image_id, "Not queueing, already cached");
            return Ok(false);
        }
        if self.is_queued(image_id).await {
            debug!(image_id = %image_id, "Not queueing, already queued");
            return Ok(false);
        }
        fs::File::create(self.queue_path(image_id)).await?;
        info!(image_id = %image_id, "Queued image for caching");
        Ok(true)
    }

    /// Oldest first
    pub async fn get_queued_images(&self) -> Result<Vec<String>> {
        let mut files = list_files(&self.dir.join("queue")).await?;
        files.sort_by(|(a_id, a), (b_id, b)| {
            modified_secs(a)
                .cmp(&modified_secs(b))
                .then_with(|| a_id.cmp(b_id))
        });
        Ok(files.into_iter().map(|(id, _)| id).collect())
    }

    /// Least recently accessed first
    pub async fn get_cached_images(&self) -> Result<Vec<CachedImage>> {
        let mut images: Vec<CachedImage> = list_files(&self.dir)
            .await?
            .into_iter()
            .map(|(image_id, meta)| CachedImage {
                image_id,
                size: meta.len(),
                last_accessed: modified_secs(&meta),
            })
            .collect();
        images.sort_by(|a, b| {
            a.last_accessed
                .cmp(&b.last_accessed)
                .then_with(|| a.image_id.cmp(&b.image_id))
        });
        Ok(images)
    }

    /// Bytes held by complete entries
    pub async fn total_size(&self) -> Result<u64> {
        Ok(self.get_cached_images().await?.iter().map(|i| i.size).sum())
    }

    pub async fn delete_cached_image(&self, image_id: &str) -> Result<()> {
        check_id(image_id)?;
        if !remove_if_present(&self.cached_path(image_id)).await? {
            return Err(TiticacaError::NotFound(format!(
                "image {} is not cached",
                image_id
            )));
        }
        debug!(image_id = %image_id, "Deleted cached image");
        Ok(())
    }

    pub async fn delete_all_cached_images(&self) -> Result<usize> {
        let mut deleted = 0;
        for image in self.get_cached_images().await? {
            if remove_if_present(&self.cached_path(&image.image_id)).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub async fn delete_queued_image(&self, image_id: &str) -> Result<()> {
        check_id(image_id)?;
        if !remove_if_present(&self.queue_path(image_id)).await? {
            return Err(TiticacaError::NotFound(format!(
                "image {} is not queued",
                image_id
            )));
        }
        Ok(())
    }

    pub async fn delete_all_queued_images(&self) -> Result<usize> {
        let mut deleted = 0;
        for image_id in self.get_queued_images().await? {
            if remove_if_present(&self.queue_path(&image_id)).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Read a cached entry, marking it as recently used
    pub async fn open_cached_image(&self, image_id: &str) -> Result<(ImageData, u64)> {
        check_id(image_id)?;
        let path = self.cached_path(image_id);
        let file = match fs::OpenOptions::new().read(true).append(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TiticacaError::NotFound(format!(
                    "image {} is not cached",
                    image_id
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let file = file.into_std().await;
        file.set_modified(SystemTime::now())?;
        let size = file.metadata()?.len();
        Ok((file_stream(fs::File::from_std(file)), size))
    }

    /// Write `data` into the cache, verifying it against `expected_checksum`
    /// as it streams. A mismatching entry is moved to `invalid/`.
    pub async fn cache_image_stream(
        &self,
        image_id: &str,
        mut data: ImageData,
        expected_checksum: Option<&str>,
    ) -> Result<u64> {
        check_id(image_id)?;
        let cached = self.cached_path(image_id);
        if fs::try_exists(&cached).await? {
            debug!(image_id = %image_id, "Already cached");
            remove_if_present(&self.queue_path(image_id)).await?;
            return Ok(fs::metadata(&cached).await?.len());
        }

        let incomplete = self.incomplete_path(image_id);
        let mut file = fs::File::create(&incomplete).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;

        let streamed: Result<()> = async {
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(e) = streamed {
            warn!(image_id = %image_id, error = %e, "Caching interrupted, discarding partial entry");
            remove_if_present(&incomplete).await?;
            return Err(e);
        }

        let actual = format!("{:x}", hasher.finalize());
        if let Some(expected) = expected_checksum {
            if expected != actual {
                warn!(
                    image_id = %image_id,
                    expected = %expected,
                    actual = %actual,
                    "Checksum mismatch, moving entry to invalid"
                );
                fs::rename(&incomplete, self.invalid_path(image_id)).await?;
                return Err(TiticacaError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        fs::rename(&incomplete, &cached).await?;
        remove_if_present(&self.queue_path(image_id)).await?;
        info!(image_id = %image_id, bytes = written, "Cached image");
        Ok(written)
    }

    /// Remove invalid entries and incomplete ones untouched for `stall_time`
    pub async fn clean(&self, stall_time: Duration) -> Result<usize> {
        let mut removed = 0;
        for (image_id, _) in list_files(&self.dir.join("invalid")).await? {
            if remove_if_present(&self.invalid_path(&image_id)).await? {
                debug!(image_id = %image_id, "Removed invalid cache entry");
                removed += 1;
            }
        }

        let cutoff = unix_secs(SystemTime::now()) - stall_time.as_secs() as i64;
        for (image_id, meta) in list_files(&self.dir.join("incomplete")).await? {
            if modified_secs(&meta) <= cutoff
                && remove_if_present(&self.incomplete_path(&image_id)).await?
            {
                debug!(image_id = %image_id, "Removed stalled cache entry");
                removed += 1;
            }
        }

        info!(removed, "Cleaned image cache");
        Ok(removed)
    }

    /// Evict least recently accessed entries until the cache fits in
    /// `max_size`. Returns the number of entries and bytes evicted.
    pub async fn prune(&self) -> Result<(usize, u64)> {
        let images = self.get_cached_images().await?;
        let mut total: u64 = images.iter().map(|i| i.size).sum();
        if total <= self.max_size {
            debug!(total, max_size = self.max_size, "Cache within size limit, nothing to prune");
            return Ok((0, 0));
        }

        let mut evicted = 0;
        let mut freed = 0;
        for image in images {
            if total <= self.max_size {
                break;
            }
            if remove_if_present(&self.cached_path(&image.image_id)).await? {
                debug!(image_id = %image.image_id, size = image.size, "Pruned cache entry");
                total -= image.size;
                freed += image.size;
                evicted += 1;
            }
        }

        info!(evicted, freed, "Pruned image cache");
        Ok((evicted, freed))
    }
}
