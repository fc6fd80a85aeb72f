//! Image cache command handlers

use super::App;
use crate::context::RequestContext;
use crate::error::{Result, TiticacaError};
use crate::image_cache::{Cleaner, Prefetcher, Pruner};
use chrono::{TimeZone, Utc};
use colored::Colorize;
use std::time::Duration;

/// Handle cache prefetch command
pub async fn handle_prefetch(app: &App) -> Result<()> {
    let cache = app.image_cache().await?;
    let prefetcher = Prefetcher::new(
        cache,
        app.gateway.image_repo(&RequestContext::admin(), false),
        app.stores.clone(),
        app.config.image_cache.lock_path.clone(),
    );

    if prefetcher.run().await? {
        println!("{}", "✓ All queued images cached".green().bold());
        Ok(())
    } else {
        Err(TiticacaError::Other(
            "failed to cache all images in queue".to_string(),
        ))
    }
}

/// Handle cache clean command
pub async fn handle_clean(app: &App) -> Result<()> {
    let cleaner = Cleaner::new(
        app.image_cache().await?,
        app.config.image_cache.lock_path.clone(),
        Duration::from_secs(app.config.image_cache.image_cache_stall_time),
    );
    let removed = cleaner.run().await?;
    println!("{} Removed {} cache entries", "✓".green(), removed);
    Ok(())
}

/// Handle cache prune command
pub async fn handle_prune(app: &App) -> Result<()> {
    let pruner = Pruner::new(
        app.image_cache().await?,
        app.config.image_cache.lock_path.clone(),
    );
    let (evicted, freed) = pruner.run().await?;
    println!("{} Evicted {} images ({} bytes)", "✓".green(), evicted, freed);
    Ok(())
}

/// Handle cache list-cached command
pub async fn handle_list_cached(app: &App) -> Result<()> {
    let cache = app.image_cache().await?;
    let images = cache.get_cached_images().await?;
    if images.is_empty() {
        println!("{}", "No cached images".yellow());
        return Ok(());
    }

    println!("Cached images:");
    println!("{:<38} {:>14} {:<25}", "ID", "Size", "Last accessed");
    println!("{}", "-".repeat(79));
    for image in images {
        let accessed = Utc
            .timestamp_opt(image.last_accessed, 0)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<38} {:>14} {:<25}", image.image_id, image.size, accessed);
    }
    println!();
    println!("Total: {} bytes of {}", cache.total_size().await?, cache.max_size());
    Ok(())
}

/// Handle cache list-queued command
pub async fn handle_list_queued(app: &App) -> Result<()> {
    let queued = app.image_cache().await?.get_queued_images().await?;
    if queued.is_empty() {
        println!("{}", "No queued images".yellow());
        return Ok(());
    }
    println!("Queued images:");
    for image_id in queued {
        println!("  {}", image_id);
    }
    Ok(())
}

/// Handle cache queue-image command
pub async fn handle_queue_image(app: &App, image_id: String) -> Result<()> {
    // Only images that exist may be queued
    app.gateway
        .image_repo(&RequestContext::admin(), false)
        .get(&image_id)
        .await?;

    if app.image_cache().await?.queue_image(&image_id).await? {
        println!("{} Queued image {}", "✓".green(), image_id);
    } else {
        println!("{}", format!("Image {} is already cached or queued", image_id).yellow());
    }
    Ok(())
}

/// Handle cache delete-cached-image command
pub async fn handle_delete_cached_image(app: &App, image_id: String) -> Result<()> {
    app.image_cache().await?.delete_cached_image(&image_id).await?;
    println!("{} Deleted cached image {}", "✓".green(), image_id);
    Ok(())
}

/// Handle cache delete-queued-image command
pub async fn handle_delete_queued_image(app: &App, image_id: String) -> Result<()> {
    app.image_cache().await?.delete_queued_image(&image_id).await?;
    println!("{} Removed image {} from the queue", "✓".green(), image_id);
    Ok(())
}

/// Handle cache delete-all-cached-images command
pub async fn handle_delete_all_cached_images(app: &App) -> Result<()> {
    let deleted = app.image_cache().await?.delete_all_cached_images().await?;
    println!("{} Deleted {} cached images", "✓".green(), deleted);
    Ok(())
}

/// Handle cache delete-all-queued-images command
pub async fn handle_delete_all_queued_images(app: &App) -> Result<()> {
    let deleted = app.image_cache().await?.delete_all_queued_images().await?;
    println!("{} Removed {} images from the queue", "✓".green(), deleted);
    Ok(())
}
