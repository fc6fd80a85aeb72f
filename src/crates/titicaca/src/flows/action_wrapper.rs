//! Optimistic, merge-on-conflict access to an image's import state
//!
//! A session starts with [`ImportActionWrapper::begin`], which loads the
//! image and hands out an [`ImportAction`]. Mutations on the action are
//! applied to a working copy and recorded. [`ImportActionWrapper::commit`]
//! re-reads the image, replays the recorded operations onto whatever is
//! stored now, and writes the result conditionally on the version it read.
//! A lost race is retried with backoff; running out of retries aborts the
//! task.
//!
//! Store ids move `importing → failed | completed`. Removing a store from
//! `importing_stores` without placing it in one of the other two sets is
//! rejected at commit, and a store that has left `importing_stores` during
//! this task run cannot be put back.

use crate::error::{Result, TiticacaError};
use crate::executor::retry::{with_retry, RetryConfig};
use crate::models::{Image, ImageLocation, ImageStatus, IMPORT_LOCK_PROPERTY};
use crate::repositories::ImageRepository;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A recorded mutation
#[derive(Debug, Clone, PartialEq)]
enum ImportOp {
    SetStatus(ImageStatus),
    SetSize(u64),
    SetVirtualSize(u64),
    SetChecksum(String),
    SetDiskFormat(String),
    SetContainerFormat(String),
    SetExtraProperties(BTreeMap<String, String>),
    AddLocation(ImageLocation),
    RemoveLocationForStore(String),
    AddImportingStores(Vec<String>),
    RemoveImportingStores(Vec<String>),
    AddFailedStores(Vec<String>),
    AddCompleteStores(Vec<String>),
    DropLock(String),
}

fn apply(image: &mut Image, op: &ImportOp) -> Result<()> {
    match op {
        ImportOp::SetStatus(status) => image.set_status(*status)?,
        ImportOp::SetSize(size) => image.size = Some(*size),
        ImportOp::SetVirtualSize(size) => image.virtual_size = Some(*size),
        ImportOp::SetChecksum(checksum) => image.checksum = Some(checksum.clone()),
        ImportOp::SetDiskFormat(format) => image.disk_format = Some(format.clone()),
        ImportOp::SetContainerFormat(format) => image.container_format = Some(format.clone()),
        ImportOp::SetExtraProperties(props) => {
            for (key, value) in props {
                image.extra_properties.insert(key.clone(), value.clone());
            }
        }
        ImportOp::AddLocation(location) => {
            image.locations.retain(|l| l.store != location.store);
            image.locations.push(location.clone());
        }
        ImportOp::RemoveLocationForStore(store) => image.locations.retain(|l| &l.store != store),
        ImportOp::AddImportingStores(stores) => {
            for store in stores {
                image.failed_stores.remove(store);
                image.completed_stores.remove(store);
                image.importing_stores.insert(store.clone());
            }
        }
        ImportOp::RemoveImportingStores(stores) => {
            for store in stores {
                image.importing_stores.remove(store);
            }
        }
        ImportOp::AddFailedStores(stores) => {
            for store in stores {
                image.importing_stores.remove(store);
                image.completed_stores.remove(store);
                image.failed_stores.insert(store.clone());
            }
        }
        ImportOp::AddCompleteStores(stores) => {
            for store in stores {
                image.importing_stores.remove(store);
                image.failed_stores.remove(store);
                image.completed_stores.insert(store.clone());
            }
        }
        ImportOp::DropLock(task_id) => {
            if image.import_lock() == Some(task_id.as_str()) {
                image.extra_properties.remove(IMPORT_LOCK_PROPERTY);
            }
        }
    }
    Ok(())
}

/// Mutable view of one image for the length of a session
#[derive(Debug)]
pub struct ImportAction {
    image: Image,
    ops: Vec<ImportOp>,
    retired: HashSet<String>,
    task_id: String,
}

impl ImportAction {
    fn record(&mut self, op: ImportOp) -> Result<()> {
        apply(&mut self.image, &op)?;
        self.ops.push(op);
        Ok(())
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn image_id(&self) -> &str {
        &self.image.id
    }

    pub fn image_status(&self) -> ImageStatus {
        self.image.status
    }

    pub fn image_size(&self) -> Option<u64> {
        self.image.size
    }

    pub fn importing_stores(&self) -> &BTreeSet<String> {
        &self.image.importing_stores
    }

    pub fn failed_stores(&self) -> &BTreeSet<String> {
        &self.image.failed_stores
    }

    pub fn completed_stores(&self) -> &BTreeSet<String> {
        &self.image.completed_stores
    }

    pub fn set_image_status(&mut self, status: ImageStatus) -> Result<()> {
        self.record(ImportOp::SetStatus(status))
    }

    pub fn set_size(&mut self, size: u64) -> Result<()> {
        self.record(ImportOp::SetSize(size))
    }

    pub fn set_virtual_size(&mut self, size: u64) -> Result<()> {
        self.record(ImportOp::SetVirtualSize(size))
    }

    pub fn set_checksum(&mut self, checksum: impl Into<String>) -> Result<()> {
        self.record(ImportOp::SetChecksum(checksum.into()))
    }

    pub fn set_disk_format(&mut self, format: impl Into<String>) -> Result<()> {
        self.record(ImportOp::SetDiskFormat(format.into()))
    }

    pub fn set_container_format(&mut self, format: impl Into<String>) -> Result<()> {
        self.record(ImportOp::SetContainerFormat(format.into()))
    }

    pub fn set_image_extra_properties(&mut self, props: BTreeMap<String, String>) -> Result<()> {
        if props.contains_key(IMPORT_LOCK_PROPERTY) {
            return Err(TiticacaError::Forbidden(format!(
                "{} cannot be set directly",
                IMPORT_LOCK_PROPERTY
            )));
        }
        self.record(ImportOp::SetExtraProperties(props))
    }

    pub fn add_location(&mut self, location: ImageLocation) -> Result<()> {
        self.record(ImportOp::AddLocation(location))
    }

    pub fn remove_location_for_store(&mut self, store: impl Into<String>) -> Result<()> {
        self.record(ImportOp::RemoveLocationForStore(store.into()))
    }

    pub fn add_importing_stores(&mut self, stores: &[String]) -> Result<()> {
        if let Some(store) = stores.iter().find(|s| self.retired.contains(*s)) {
            return Err(TiticacaError::InvalidStoreTransition {
                store: store.clone(),
                target: "importing".to_string(),
                reason: format!("it already finished importing in task {}", self.task_id),
            });
        }
        self.record(ImportOp::AddImportingStores(stores.to_vec()))
    }

    pub fn remove_importing_stores(&mut self, stores: &[String]) -> Result<()> {
        self.record(ImportOp::RemoveImportingStores(stores.to_vec()))
    }

    pub fn add_failed_stores(&mut self, stores: &[String]) -> Result<()> {
        self.record(ImportOp::AddFailedStores(stores.to_vec()))
    }

    pub fn add_complete_stores(&mut self, stores: &[String]) -> Result<()> {
        self.record(ImportOp::AddCompleteStores(stores.to_vec()))
    }

    /// Release the import lock if this task holds it
    pub fn drop_lock_for_task(&mut self) -> Result<()> {
        let task_id = self.task_id.clone();
        self.record(ImportOp::DropLock(task_id))
    }

    fn stores_leaving_importing(&self) -> BTreeSet<&String> {
        self.ops
            .iter()
            .flat_map(|op| match op {
                ImportOp::RemoveImportingStores(stores)
                | ImportOp::AddFailedStores(stores)
                | ImportOp::AddCompleteStores(stores) => stores.iter().collect::<Vec<_>>(),
                _ => Vec::new(),
            })
            .collect()
    }
}

/// Per-task handle on one image's import state
pub struct ImportActionWrapper {
    image_repo: Arc<dyn ImageRepository>,
    image_id: String,
    task_id: String,
    retry: RetryConfig,
    retired: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for ImportActionWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportActionWrapper")
            .field("image_id", &self.image_id)
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl ImportActionWrapper {
    pub fn new(
        image_repo: Arc<dyn ImageRepository>,
        image_id: impl Into<String>,
        task_id: impl Into<String>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            image_repo,
            image_id: image_id.into(),
            task_id: task_id.into(),
            retry,
            retired: Mutex::new(HashSet::new()),
        }
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn assert_task_lock(&self, image: &Image) -> Result<()> {
        match image.import_lock() {
            Some(holder) if holder == self.task_id => Ok(()),
            Some(holder) => Err(TiticacaError::TaskAborted(format!(
                "image {} is being imported by task {}",
                image.id, holder
            ))),
            None => Err(TiticacaError::TaskAborted(format!(
                "image {} is not locked for task {}",
                image.id, self.task_id
            ))),
        }
    }

    /// Current image, without opening a session
    pub async fn image(&self) -> Result<Image> {
        self.image_repo.get(&self.image_id).await
    }

    /// Claim the image for this task; a lock held by another task aborts
    pub async fn take_lock(&self) -> Result<()> {
        let task_id = self.task_id.clone();
        let saved = with_retry(&self.retry, &self.task_id, TiticacaError::is_conflict, || async {
            let mut image = self.image_repo.get(&self.image_id).await?;
            match image.import_lock().map(str::to_string) {
                Some(holder) if holder == task_id => return Ok(image),
                Some(holder) => {
                    return Err(TiticacaError::TaskAborted(format!(
                        "image {} is being imported by task {}",
                        image.id, holder
                    )))
                }
                None => {}
            }
            image
                .extra_properties
                .insert(IMPORT_LOCK_PROPERTY.to_string(), task_id.clone());
            self.image_repo.save(&image).await
        })
        .await
        .map_err(|e| self.exhausted(e))?;

        info!(task_id = %self.task_id, image_id = %saved.id, "Took image import lock");
        Ok(())
    }

    /// Open a session on the image
    pub async fn begin(&self) -> Result<ImportAction> {
        let image = self.image_repo.get(&self.image_id).await?;
        self.assert_task_lock(&image)?;
        debug!(
            task_id = %self.task_id,
            image_id = %self.image_id,
            version = image.version,
            "Opened import session"
        );
        Ok(ImportAction {
            image,
            ops: Vec::new(),
            retired: self.retired.lock().clone(),
            task_id: self.task_id.clone(),
        })
    }

    /// Persist a session, merging with concurrent writers
    pub async fn commit(&self, action: ImportAction) -> Result<Image> {
        if action.ops.is_empty() {
            return Ok(action.image);
        }

        let saved = with_retry(&self.retry, &self.task_id, TiticacaError::is_conflict, || async {
            let base = self.image_repo.get(&self.image_id).await?;
            self.assert_task_lock(&base)?;
            let merged = Self::replay(base, &action)?;
            self.image_repo.save(&merged).await
        })
        .await
        .map_err(|e| self.exhausted(e))?;

        let mut retired = self.retired.lock();
        for store in action.stores_leaving_importing() {
            retired.insert(store.clone());
        }
        Ok(saved)
    }

    /// Run `f` inside a session and commit what it recorded
    pub async fn apply<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ImportAction) -> Result<T>,
    {
        let mut action = self.begin().await?;
        let value = f(&mut action)?;
        self.commit(action).await?;
        Ok(value)
    }

    fn replay(mut base: Image, action: &ImportAction) -> Result<Image> {
        for op in &action.ops {
            apply(&mut base, op)?;
        }
        for store in action.stores_leaving_importing() {
            if !base.failed_stores.contains(store) && !base.completed_stores.contains(store) {
                return Err(TiticacaError::InvalidStoreTransition {
                    store: store.clone(),
                    target: "none".to_string(),
                    reason: "removed from importing without an outcome".to_string(),
                });
            }
        }
        Ok(base)
    }

    /// Turn a conflict that outlived the retry budget into an abort
    fn exhausted(&self, err: TiticacaError) -> TiticacaError {
        if err.is_conflict() {
            warn!(
                task_id = %self.task_id,
                image_id = %self.image_id,
                retries = self.retry.max_retries,
                "Gave up merging concurrent image updates"
            );
            TiticacaError::TaskAborted(format!(
                "could not update image {} after {} retries: {}",
                self.image_id, self.retry.max_retries, err
            ))
        } else {
            err
        }
    }
}
