//! The legacy `import` flow: create an image and fill it from a URL
//!
//! ```text
//! CreateImage → WebDownload → plugins… → ImportToStore(default)
//!   → VerifyImageState → DeleteFromStaging → CompleteTask
//! ```

use super::api_import::{CompleteTask, DeleteFromStaging, ImportToStore, VerifyImageState};
use super::plugins::get_import_plugins;
use super::web_download::WebDownload;
use super::{step_name, Flow, FlowContext, FlowRequest, FlowStep, ImportActionWrapper, StepOutcome};
use crate::error::{Result, TiticacaError};
use crate::executor::retry::RetryConfig;
use crate::models::{Image, ImageStatus, IMPORT_LOCK_PROPERTY};
use crate::repositories::ImageRepository;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageProperties {
    pub name: Option<String>,
    pub disk_format: Option<String>,
    pub container_format: Option<String>,
}

/// Task input of an `import` task
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyImportInput {
    pub import_from: String,
    pub import_from_format: Option<String>,
    #[serde(default)]
    pub image_properties: ImageProperties,
}

impl LegacyImportInput {
    /// Properties of the image to create; the source format fills in a missing disk format
    pub fn properties(&self) -> ImageProperties {
        let mut properties = self.image_properties.clone();
        if properties.disk_format.is_none() {
            properties.disk_format = self.import_from_format.clone();
        }
        properties
    }
}

/// Create the image the import fills, already locked and importing
pub struct CreateImage {
    name: String,
    images: Arc<dyn ImageRepository>,
    image_id: String,
    owner: String,
    task_id: String,
    store: String,
    properties: ImageProperties,
}

#[async_trait]
impl FlowStep for CreateImage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &FlowContext) -> Result<Option<Value>> {
        let mut image = Image::new(self.owner.clone())
            .with_id(self.image_id.clone())
            .with_status(ImageStatus::Importing);
        image.name = self.properties.name.clone();
        image.disk_format = self.properties.disk_format.clone();
        image.container_format = self.properties.container_format.clone();
        image
            .extra_properties
            .insert(IMPORT_LOCK_PROPERTY.to_string(), self.task_id.clone());
        image.importing_stores.insert(self.store.clone());

        let image = self.images.add(&image).await?;
        info!(image_id = %image.id, task_id = %self.task_id, "Created image for import");
        Ok(Some(json!({ "image_id": image.id })))
    }

    async fn revert(&self, _ctx: &FlowContext, outcome: &StepOutcome) -> Result<()> {
        if outcome.is_failure() {
            return Ok(());
        }
        match self.images.remove(&self.image_id).await {
            Ok(()) | Err(TiticacaError::ImageNotFound { .. }) => Ok(()),
            Err(e) => {
                warn!(image_id = %self.image_id, error = %e, "Failed to delete image after import failure");
                Err(e)
            }
        }
    }
}

pub fn get_flow(req: &FlowRequest<'_>) -> Result<Flow> {
    let task = req.task;
    let services = req.services;
    let task_type = task.task_type.as_str();

    let input: LegacyImportInput = serde_json::from_value(task.input.clone()).map_err(|e| {
        TiticacaError::BadTaskConfiguration(format!("invalid import input: {}", e))
    })?;
    let store = services
        .stores
        .default_store()
        .ok_or_else(|| {
            TiticacaError::BadTaskConfiguration("no default store is configured".to_string())
        })?
        .to_string();

    let image_id = task
        .image_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let staging = services.stores.staging()?;
    let staging_path = services.staging_path(&image_id)?;
    let wrapper = Arc::new(ImportActionWrapper::new(
        services.images.clone(),
        image_id.clone(),
        task.id.clone(),
        RetryConfig::from(&services.config.action_wrapper),
    ));

    let properties = input.properties();
    let plugins = get_import_plugins(
        &services.config.image_import.image_import_plugins,
        task,
        req.context,
        &wrapper,
        services,
    )?;

    Ok(Flow::new(task_type)
        .add(Arc::new(CreateImage {
            name: step_name(task_type, "CreateImage", &task.id),
            images: services.images.clone(),
            image_id,
            owner: task.owner.clone(),
            task_id: task.id.clone(),
            store: store.clone(),
            properties,
        }))
        .add(Arc::new(WebDownload::new(
            step_name(task_type, "WebDownload", &task.id),
            wrapper.clone(),
            services.source.clone(),
            staging.clone(),
            staging_path.clone(),
            input.import_from,
            vec![store.clone()],
        )))
        .add_all(plugins)
        .add(Arc::new(ImportToStore::new(
            step_name(task_type, &format!("ImportToStore-{}", store), &task.id),
            wrapper.clone(),
            services.stores.get(&store)?,
            true,
        )))
        .add(Arc::new(VerifyImageState::new(
            step_name(task_type, "VerifyImageState", &task.id),
            wrapper.clone(),
            false,
        )))
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
