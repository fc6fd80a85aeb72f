//! Copy an active image's data from one of its stores into staging, so it
//! can be imported into additional stores

use super::{FlowContext, FlowStep, ImportActionWrapper, StepOutcome, STAGED_PATH};
use crate::error::{Result, TiticacaError};
use crate::store::{path_to_file_uri, Store, StoreRegistry, STAGING_STORE_ID};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do with whatever is already at the staging path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    /// A complete copy is already staged
    Reuse,
    /// A stale partial copy was discarded
    Restart,
    /// Nothing staged yet
    Fresh,
}

pub struct CopyImage {
    name: String,
    wrapper: Arc<ImportActionWrapper>,
    registry: Arc<StoreRegistry>,
    staging: Arc<dyn Store>,
    staging_path: PathBuf,
    stores: Vec<String>,
}

impl CopyImage {
    pub fn new(
        name: String,
        wrapper: Arc<ImportActionWrapper>,
        registry: Arc<StoreRegistry>,
        staging: Arc<dyn Store>,
        staging_path: PathBuf,
        stores: Vec<String>,
    ) -> Self {
        Self {
            name,
            wrapper,
            registry,
            staging,
            staging_path,
            stores,
        }
    }

    /// Compare any staged file against the image size; discard it unless
    /// it is complete
    pub async fn resume_check(&self, expected_size: Option<u64>) -> Result<ResumeDecision> {
        let meta = match tokio::fs::metadata(&self.staging_path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ResumeDecision::Fresh)
            }
            Err(e) => return Err(e.into()),
        };

        if Some(meta.len()) == expected_size {
            return Ok(ResumeDecision::Reuse);
        }

        warn!(
            path = %self.staging_path.display(),
            staged = meta.len(),
            expected = ?expected_size,
            "Discarding partial staged copy"
        );
        tokio::fs::remove_file(&self.staging_path).await?;
        Ok(ResumeDecision::Restart)
    }
}

#[async_trait]
impl FlowStep for CopyImage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &FlowContext) -> Result<Option<Value>> {
        let image = self.wrapper.image().await?;

        match self.resume_check(image.size).await? {
            ResumeDecision::Reuse => {
                info!(image_id = %image.id, "Reusing staged copy");
            }
            ResumeDecision::Restart | ResumeDecision::Fresh => {
                let location = image
                    .locations
                    .iter()
                    .find(|l| l.store != STAGING_STORE_ID && !self.stores.contains(&l.store))
                    .ok_or_else(|| {
                        TiticacaError::ImportTask(format!(
                            "image {} has no existing location to copy from",
                            image.id
                        ))
                    })?;

                let source = self.registry.for_location(location)?;
                let (data, size) = source.get(&location.url).await?;
                let stored = self.staging.add(&image.id, data, size).await?;

                if let Some(expected) = image.size {
                    if stored.bytes_written != expected {
                        return Err(TiticacaError::ImportTask(format!(
                            "copied {} bytes from {} but the image is {} bytes",
                            stored.bytes_written, location.store, expected
                        )));
                    }
                }
                info!(
                    image_id = %image.id,
                    from = %location.store,
                    bytes = stored.bytes_written,
                    "Copied image data to staging"
                );
            }
        }

        let path = self.staging_path.to_string_lossy().into_owned();
        ctx.provide(STAGED_PATH, json!(path));
        Ok(Some(json!(path)))
    }

    async fn revert(&self, _ctx: &FlowContext, outcome: &StepOutcome) -> Result<()> {
        debug!(step = %self.name, failed = outcome.is_failure(), "Reverting copy");
        match self.staging.delete(&path_to_file_uri(&self.staging_path)).await {
            Ok(()) | Err(TiticacaError::NotFound(_)) => Ok(()),
            Err(e) => {
                warn!(path = %self.staging_path.display(), error = %e, "Failed to remove staged copy");
                Ok(())
            }
        }
    }
}
