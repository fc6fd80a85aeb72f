//! The `api_image_import` flow
//!
//! ```text
//! ImageLock → stage (direct | web-download | copy-image) → plugins…
//!   → ImportToStore × N → VerifyImageState → DeleteFromStaging → CompleteTask
//! ```

use super::copy_image::CopyImage;
use super::plugins::get_import_plugins;
use super::web_download::WebDownload;
use super::{
    step_name, Flow, FlowContext, FlowRequest, FlowStep, ImportActionWrapper, StepOutcome,
    STAGED_PATH,
};
use crate::error::{Result, TiticacaError};
use crate::executor::retry::RetryConfig;
use crate::models::{ImageLocation, ImageStatus};
use crate::store::{open_file, path_to_file_uri, Store};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How the image data reaches staging
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum ImportMethod {
    /// Data was uploaded to staging before the task was created
    TiticacaDirect,
    WebDownload { uri: String },
    CopyImage,
}

impl ImportMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportMethod::TiticacaDirect => "titicaca-direct",
            ImportMethod::WebDownload { .. } => "web-download",
            ImportMethod::CopyImage => "copy-image",
        }
    }

    pub fn is_copy(&self) -> bool {
        matches!(self, ImportMethod::CopyImage)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportRequest {
    pub method: ImportMethod,
    #[serde(default)]
    pub stores: Vec<String>,
    pub all_stores_must_succeed: Option<bool>,
}

/// Task input of an `api_image_import` task
#[derive(Debug, Clone, Deserialize)]
pub struct ApiImportInput {
    pub image_id: Option<String>,
    pub import_req: ImportRequest,
    #[serde(default)]
    pub backend: Vec<String>,
}

/// Take the import lock and mark the target stores as importing
pub struct ImageLock {
    name: String,
    wrapper: Arc<ImportActionWrapper>,
    stores: Vec<String>,
    is_copy: bool,
}

#[async_trait]
impl FlowStep for ImageLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &FlowContext) -> Result<Option<Value>> {
        self.wrapper.take_lock().await?;
        let stores = self.stores.clone();
        let is_copy = self.is_copy;
        self.wrapper
            .apply(move |action| {
                action.add_importing_stores(&stores)?;
                if !is_copy {
                    action.set_image_status(ImageStatus::Importing)?;
                }
                Ok(())
            })
            .await?;
        Ok(None)
    }

    /// Whatever is still importing failed; give the image back
    async fn revert(&self, _ctx: &FlowContext, _outcome: &StepOutcome) -> Result<()> {
        let image = self.wrapper.image().await?;
        if image.import_lock() != Some(self.wrapper.task_id()) {
            warn!(
                image_id = %image.id,
                task_id = %self.wrapper.task_id(),
                "Image lock is not ours, leaving it alone"
            );
            return Ok(());
        }

        let stores = self.stores.clone();
        let is_copy = self.is_copy;
        self.wrapper
            .apply(move |action| {
                let still_importing: Vec<String> = stores
                    .into_iter()
                    .filter(|s| action.importing_stores().contains(s))
                    .collect();
                action.remove_importing_stores(&still_importing)?;
                action.add_failed_stores(&still_importing)?;
                if !is_copy && action.image_status() == ImageStatus::Importing {
                    action.set_image_status(ImageStatus::Queued)?;
                }
                action.drop_lock_for_task()
            })
            .await?;
        info!(image_id = %image.id, task_id = %self.wrapper.task_id(), "Released image lock after failure");
        Ok(())
    }
}

/// Use data the caller already uploaded to staging
pub struct StageDirect {
    name: String,
    staging_path: PathBuf,
}

#[async_trait]
impl FlowStep for StageDirect {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &FlowContext) -> Result<Option<Value>> {
        if !tokio::fs::try_exists(&self.staging_path).await? {
            return Err(TiticacaError::ImportTask(format!(
                "no staged data at {}",
                self.staging_path.display()
            )));
        }
        let path = self.staging_path.to_string_lossy().into_owned();
        ctx.provide(STAGED_PATH, json!(path));
        Ok(Some(json!(path)))
    }
}

/// Commit the staged data to one store
pub struct ImportToStore {
    name: String,
    wrapper: Arc<ImportActionWrapper>,
    store: Arc<dyn Store>,
    all_stores_must_succeed: bool,
}

impl ImportToStore {
    pub fn new(
        name: String,
        wrapper: Arc<ImportActionWrapper>,
        store: Arc<dyn Store>,
        all_stores_must_succeed: bool,
    ) -> Self {
        Self {
            name,
            wrapper,
            store,
            all_stores_must_succeed,
        }
    }

    fn store_id(&self) -> String {
        self.store.id().to_string()
    }

    async fn import(&self, ctx: &FlowContext) -> Result<()> {
        let path = ctx.staged_path()?;
        let (data, size) = open_file(&path).await?;
        let image_id = self.wrapper.image_id().to_string();
        let stored = self.store.add(&image_id, data, size).await?;

        let store_id = self.store_id();
        let location = ImageLocation {
            url: stored.location.clone(),
            store: store_id.clone(),
            metadata: stored.metadata.clone(),
        };
        let checksum = stored.checksum.clone();
        let bytes = stored.bytes_written;

        let committed = self
            .wrapper
            .apply(move |action| {
                if let Some(expected) = action.image().checksum.clone() {
                    if expected != checksum {
                        return Err(TiticacaError::ChecksumMismatch {
                            expected,
                            actual: checksum,
                        });
                    }
                }
                action.add_location(location)?;
                action.set_size(bytes)?;
                action.set_checksum(checksum)?;
                action.add_complete_stores(&[store_id])
            })
            .await;

        if let Err(e) = committed {
            if let Err(cleanup) = self.store.delete(&stored.location).await {
                warn!(location = %stored.location, error = %cleanup, "Failed to remove uncommitted data");
            }
            return Err(e);
        }

        info!(image_id = %image_id, store = %self.store.id(), bytes, "Imported image to store");
        Ok(())
    }
}

#[async_trait]
impl FlowStep for ImportToStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &FlowContext) -> Result<Option<Value>> {
        match self.import(ctx).await {
            Ok(()) => Ok(None),
            Err(e) if !self.all_stores_must_succeed => {
                warn!(
                    image_id = %self.wrapper.image_id(),
                    store = %self.store.id(),
                    error = %e,
                    "Import to store failed, continuing with remaining stores"
                );
                let store_id = self.store_id();
                self.wrapper
                    .apply(move |action| {
                        let store = [store_id];
                        if action.importing_stores().contains(&store[0]) {
                            action.remove_importing_stores(&store)?;
                        }
                        action.add_failed_stores(&store)
                    })
                    .await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Undo a committed store
    async fn revert(&self, _ctx: &FlowContext, outcome: &StepOutcome) -> Result<()> {
        if outcome.is_failure() {
            return Ok(());
        }
        let image = self.wrapper.image().await?;
        let store_id = self.store_id();
        if !image.completed_stores.contains(&store_id) {
            return Ok(());
        }

        if let Some(location) = image.location_for_store(&store_id) {
            match self.store.delete(&location.url).await {
                Ok(()) | Err(TiticacaError::NotFound(_)) => {}
                Err(e) => error!(location = %location.url, error = %e, "Failed to delete imported data"),
            }
        }

        self.wrapper
            .apply(move |action| {
                action.remove_location_for_store(store_id.clone())?;
                action.add_failed_stores(&[store_id])
            })
            .await
    }
}

/// Activate the image once every store has run; fail if none took the data
pub struct VerifyImageState {
    name: String,
    wrapper: Arc<ImportActionWrapper>,
    is_copy: bool,
}

impl VerifyImageState {
    pub fn new(name: String, wrapper: Arc<ImportActionWrapper>, is_copy: bool) -> Self {
        Self {
            name,
            wrapper,
            is_copy,
        }
    }
}

#[async_trait]
impl FlowStep for VerifyImageState {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &FlowContext) -> Result<Option<Value>> {
        let kind = if self.is_copy { "copy" } else { "data" };
        let is_copy = self.is_copy;
        let status = self
            .wrapper
            .apply(move |action| {
                if !is_copy
                    && action.image_status() == ImageStatus::Importing
                    && !action.completed_stores().is_empty()
                {
                    action.set_image_status(ImageStatus::Active)?;
                }
                Ok(action.image_status())
            })
            .await?;

        if status != ImageStatus::Active {
            return Err(TiticacaError::ImportTask(format!(
                "{} import of image {} failed: image is {}",
                kind,
                self.wrapper.image_id(),
                status
            )));
        }
        info!(image_id = %self.wrapper.image_id(), "Image is active");
        Ok(None)
    }

    async fn revert(&self, _ctx: &FlowContext, _outcome: &StepOutcome) -> Result<()> {
        if self.is_copy {
            return Ok(());
        }
        self.wrapper
            .apply(|action| {
                if action.image_status() == ImageStatus::Importing {
                    action.set_image_status(ImageStatus::Queued)?;
                }
                Ok(())
            })
            .await
    }
}

/// Remove the staged data; never fails the flow
pub struct DeleteFromStaging {
    name: String,
    staging: Arc<dyn Store>,
    staging_path: PathBuf,
}

impl DeleteFromStaging {
    pub fn new(name: String, staging: Arc<dyn Store>, staging_path: PathBuf) -> Self {
        Self {
            name,
            staging,
            staging_path,
        }
    }
}

#[async_trait]
impl FlowStep for DeleteFromStaging {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &FlowContext) -> Result<Option<Value>> {
        match self.staging.delete(&path_to_file_uri(&self.staging_path)).await {
            Ok(()) => debug!(path = %self.staging_path.display(), "Deleted staged data"),
            Err(TiticacaError::NotFound(_)) => {
                debug!(path = %self.staging_path.display(), "Staged data already gone")
            }
            Err(e) => error!(
                path = %self.staging_path.display(),
                error = %e,
                "Failed to delete staged data"
            ),
        }
        Ok(None)
    }
}

/// Release the lock and hand back the task result
pub struct CompleteTask {
    name: String,
    wrapper: Arc<ImportActionWrapper>,
}

impl CompleteTask {
    pub fn new(name: String, wrapper: Arc<ImportActionWrapper>) -> Self {
        Self { name, wrapper }
    }
}

#[async_trait]
impl FlowStep for CompleteTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &FlowContext) -> Result<Option<Value>> {
        if let Err(e) = self.wrapper.apply(|action| action.drop_lock_for_task()).await {
            warn!(
                image_id = %self.wrapper.image_id(),
                task_id = %self.wrapper.task_id(),
                error = %e,
                "Image import task lost its lock"
            );
        }
        info!(
            task_id = %self.wrapper.task_id(),
            image_id = %self.wrapper.image_id(),
            "Import task completed"
        );
        Ok(Some(json!({ "image_id": self.wrapper.image_id() })))
    }
}

/// Target stores: the request's, then the task's, then the default one
fn resolve_stores(input: &ApiImportInput, req: &FlowRequest<'_>) -> Result<Vec<String>> {
    let stores = if !input.import_req.stores.is_empty() {
        input.import_req.stores.clone()
    } else if !input.backend.is_empty() {
        input.backend.clone()
    } else if let Some(default) = req.services.stores.default_store() {
        vec![default.to_string()]
    } else {
        return Err(TiticacaError::BadTaskConfiguration(
            "no target store requested and no default store configured".to_string(),
        ));
    };

    for store in &stores {
        if req.services.stores.get(store).is_err() {
            return Err(TiticacaError::BadTaskConfiguration(format!(
                "unknown store {}",
                store
            )));
        }
    }
    Ok(stores)
}

pub fn get_flow(req: &FlowRequest<'_>) -> Result<Flow> {
    let task = req.task;
    let services = req.services;
    let task_type = task.task_type.as_str();

    let input: ApiImportInput = serde_json::from_value(task.input.clone()).map_err(|e| {
        TiticacaError::BadTaskConfiguration(format!("invalid import input: {}", e))
    })?;
    let image_id = task
        .image_id
        .clone()
        .or_else(|| input.image_id.clone())
        .ok_or_else(|| {
            TiticacaError::BadTaskConfiguration("import task has no image id".to_string())
        })?;
    let stores = resolve_stores(&input, req)?;
    let method = input.import_req.method.clone();
    let is_copy = method.is_copy();
    let all_stores_must_succeed = input
        .import_req
        .all_stores_must_succeed
        .unwrap_or(services.config.image_import.all_stores_must_succeed);

    let staging = services.stores.staging()?;
    let staging_path = services.staging_path(&image_id)?;
    let wrapper = Arc::new(ImportActionWrapper::new(
        services.images.clone(),
        image_id.clone(),
        task.id.clone(),
        RetryConfig::from(&services.config.action_wrapper),
    ));

    debug!(
        task_id = %task.id,
        image_id = %image_id,
        method = method.as_str(),
        ?stores,
        all_stores_must_succeed,
        "Building import flow"
    );

    let stage: Arc<dyn FlowStep> = match method {
        ImportMethod::TiticacaDirect => Arc::new(StageDirect {
            name: step_name(task_type, "StageDirect", &task.id),
            staging_path: staging_path.clone(),
        }),
        ImportMethod::WebDownload { uri } => Arc::new(WebDownload::new(
            step_name(task_type, "WebDownload", &task.id),
            wrapper.clone(),
            services.source.clone(),
            staging.clone(),
            staging_path.clone(),
            uri,
            stores.clone(),
        )),
        ImportMethod::CopyImage => Arc::new(CopyImage::new(
            step_name(task_type, "CopyImage", &task.id),
            wrapper.clone(),
            services.stores.clone(),
            staging.clone(),
            staging_path.clone(),
            stores.clone(),
        )),
    };

    // Copying moves bytes that were already inspected and converted
    let plugins = if is_copy {
        Vec::new()
    } else {
        get_import_plugins(
            &services.config.image_import.image_import_plugins,
            task,
            req.context,
            &wrapper,
            services,
        )?
    };

    let mut imports: Vec<Arc<dyn FlowStep>> = Vec::with_capacity(stores.len());
    for store in &stores {
        imports.push(Arc::new(ImportToStore {
            name: step_name(task_type, &format!("ImportToStore-{}", store), &task.id),
            wrapper: wrapper.clone(),
            store: services.stores.get(store)?,
            all_stores_must_succeed,
        }));
    }

    Ok(Flow::new(task_type)
        .add(Arc::new(ImageLock {
            name: step_name(task_type, "ImageLock", &task.id),
            wrapper: wrapper.clone(),
            stores,
            is_copy,
        }))
        .add(stage)
        .add_all(plugins)
        .add_all(imports)
        .add(Arc::new(VerifyImageState {
            name: step_name(task_type, "VerifyImageState", &task.id),
            wrapper: wrapper.clone(),
            is_copy,
        }))
        .add(Arc::new(DeleteFromStaging::new(
            step_name(task_type, "DeleteFromStaging", &task.id),
            staging,
            staging_path,
        )))
        .add(Arc::new(CompleteTask::new(
            step_name(task_type, "CompleteTask", &task.id),
            wrapper,
        ))))
}
