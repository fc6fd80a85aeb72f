//! Download image data from a URL into the staging store

use super::{FlowContext, FlowStep, ImportActionWrapper, StepOutcome, STAGED_PATH};
use crate::error::{Result, TiticacaError};
use crate::models::ImageStatus;
use crate::store::{file_uri_path, path_to_file_uri, ImageData, Store};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Somewhere image data can be fetched from
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Open `uri`, returning the data and the length the source announced
    async fn open(&self, uri: &str) -> Result<(ImageData, Option<u64>)>;
}

/// Fetches `http://` and `https://` URIs
#[derive(Debug, Clone, Default)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataSource for HttpSource {
    async fn open(&self, uri: &str) -> Result<(ImageData, Option<u64>)> {
        if !(uri.starts_with("http://") || uri.starts_with("https://")) {
            return Err(TiticacaError::BadTaskConfiguration(format!(
                "unsupported download URI {}",
                uri
            )));
        }

        let response = self.client.get(uri).send().await?.error_for_status()?;
        let content_length = response.content_length();

        let data = futures::stream::unfold(Some(response), |state| async move {
            let mut response = state?;
            match response.chunk().await {
                Ok(Some(bytes)) => Some((Ok(bytes.to_vec()), Some(response))),
                Ok(None) => None,
                Err(e) => Some((Err(TiticacaError::Http(e)), None)),
            }
        })
        .boxed();

        Ok((data, content_length))
    }
}

pub struct WebDownload {
    name: String,
    wrapper: Arc<ImportActionWrapper>,
    source: Arc<dyn DataSource>,
    staging: Arc<dyn Store>,
    staging_path: PathBuf,
    uri: String,
    stores: Vec<String>,
}

impl WebDownload {
    pub fn new(
        name: String,
        wrapper: Arc<ImportActionWrapper>,
        source: Arc<dyn DataSource>,
        staging: Arc<dyn Store>,
        staging_path: PathBuf,
        uri: impl Into<String>,
        stores: Vec<String>,
    ) -> Self {
        Self {
            name,
            wrapper,
            source,
            staging,
            staging_path,
            uri: uri.into(),
            stores,
        }
    }

    async fn fail_stores(&self) -> Result<()> {
        let stores = self.stores.clone();
        self.wrapper
            .apply(move |action| {
                let still_importing: Vec<String> = stores
                    .into_iter()
                    .filter(|s| action.importing_stores().contains(s))
                    .collect();
                action.remove_importing_stores(&still_importing)?;
                action.add_failed_stores(&still_importing)?;
                if action.image_status() == ImageStatus::Importing {
                    action.set_image_status(ImageStatus::Queued)?;
                }
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl FlowStep for WebDownload {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &FlowContext) -> Result<Option<Value>> {
        let image_id = self.wrapper.image_id();
        let (data, content_length) = self.source.open(&self.uri).await?;
        let stored = self.staging.add(image_id, data, 0).await?;

        if let Some(expected) = content_length {
            if expected != stored.bytes_written {
                return Err(TiticacaError::ImportTask(format!(
                    "The image size ({}) does not match the expected size ({})",
                    stored.bytes_written, expected
                )));
            }
        }

        let path = file_uri_path(&stored.location)?;
        info!(
            image_id = %image_id,
            bytes = stored.bytes_written,
            path = %path.display(),
            "Downloaded image data to staging"
        );
        ctx.provide(STAGED_PATH, json!(path.to_string_lossy()));
        Ok(Some(json!(path.to_string_lossy())))
    }

    async fn revert(&self, _ctx: &FlowContext, outcome: &StepOutcome) -> Result<()> {
        if let StepOutcome::Failed(message) = outcome {
            error!(step = %self.name, error = %message, "Web download failed");
            if let Err(e) = self.fail_stores().await {
                warn!(step = %self.name, error = %e, "Could not mark stores as failed");
            }
        }

        match self.staging.delete(&path_to_file_uri(&self.staging_path)).await {
            Ok(()) => debug!(path = %self.staging_path.display(), "Removed staged data"),
            Err(TiticacaError::NotFound(_)) => {}
            Err(e) => error!(
                path = %self.staging_path.display(),
                error = %e,
                "Failed to remove staged data"
            ),
        }
        Ok(())
    }
}
