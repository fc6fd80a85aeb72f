//! Prefetches queued images into the image cache

use super::{CacheLock, ImageCache};
use crate::error::Result;
use crate::models::ImageStatus;
use crate::repositories::ImageRepository;
use crate::store::StoreRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Prefetcher {
    cache: Arc<ImageCache>,
    images: Arc<dyn ImageRepository>,
    stores: Arc<StoreRegistry>,
    lock_dir: PathBuf,
}

impl Prefetcher {
    pub fn new(
        cache: Arc<ImageCache>,
        images: Arc<dyn ImageRepository>,
        stores: Arc<StoreRegistry>,
        lock_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            images,
            stores,
            lock_dir: lock_dir.into(),
        }
    }

    /// Cache one image from the first of its locations that verifies.
    /// Returns false, after logging, when nothing could be cached.
    pub async fn fetch_image_into_cache(&self, image_id: &str) -> bool {
        let image = match self.images.get(image_id).await {
            Ok(image) => image,
            Err(e) => {
                warn!(image_id = %image_id, error = %e, "Image not found");
                return false;
            }
        };

        if image.status != ImageStatus::Active {
            warn!(image_id = %image_id, status = %image.status, "Image is not active. Not caching.");
            return false;
        }

        for location in &image.locations {
            let store = match self.stores.for_location(location) {
                Ok(store) => store,
                Err(e) => {
                    warn!(image_id = %image_id, store = %location.store, error = %e, "Skipping location");
                    continue;
                }
            };
            let (data, size) = match store.get(&location.url).await {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(image_id = %image_id, location = %location.url, error = %e, "Could not read location");
                    continue;
                }
            };

            debug!(image_id = %image_id, size, "Caching image");
            match self
                .cache
                .cache_image_stream(image_id, data, image.checksum.as_deref())
                .await
            {
                Ok(_) => return true,
                Err(e) => {
                    warn!(image_id = %image_id, location = %location.url, error = %e, "Failed to cache image");
                }
            }
        }

        warn!(image_id = %image_id, "No location of the image could be cached");
        false
    }

    /// Fetch every queued image concurrently. True only if all succeeded.
    pub async fn run(&self) -> Result<bool> {
        let _lock = CacheLock::acquire(&self.lock_dir).await?;

        let images = self.cache.get_queued_images().await?;
        if images.is_empty() {
            debug!("Nothing to prefetch.");
            return Ok(true);
        }

        let num_images = images.len();
        debug!(num_images, "Found images to prefetch");

        let mut fetches = JoinSet::new();
        for image_id in images {
            let prefetcher = self.clone();
            fetches.spawn(async move { prefetcher.fetch_image_into_cache(&image_id).await });
        }

        let mut successes = 0;
        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok(true) => successes += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Prefetch worker failed"),
            }
        }

        if successes != num_images {
            warn!(successes, num_images, "Failed to successfully cache all images in queue.");
            return Ok(false);
        }

        info!(num_images, "Successfully cached all images");
        Ok(true)
    }
}
