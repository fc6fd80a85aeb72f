//! In-memory rows keyed by id
//!
//! Implements the same repository traits as the SQLite repositories,
//! including the version check on image saves. Each instance is its own
//! world; share it by `Arc`.

use crate::error::{Result, TiticacaError};
use crate::models::{Image, Task};
use crate::repositories::{ImageRepository, TaskRepository};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tasks: RwLock<HashMap<String, Task>>,
    images: RwLock<HashMap<String, Image>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every row
    pub fn reset(&self) {
        self.tasks.write().clear();
        self.images.write().clear();
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn image_count(&self) -> usize {
        self.images.read().len()
    }
}

#[async_trait]
impl TaskRepository for MemoryDatabase {
    async fn add(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.id) {
            return Err(TiticacaError::Database(format!(
                "Task {} already exists",
                task.id
            )));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .read()
            .get(task_id)
            .cloned()
            .ok_or_else(|| TiticacaError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    async fn save(&self, task: &Task) -> Result<()> {
        match self.tasks.write().get_mut(&task.id) {
            Some(row) => {
                *row = task.clone();
                Ok(())
            }
            None => Err(TiticacaError::TaskNotFound {
                task_id: task.id.clone(),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        self.tasks
            .write()
            .remove(task_id)
            .map(|_| ())
            .ok_or_else(|| TiticacaError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }
}

#[async_trait]
impl ImageRepository for MemoryDatabase {
    async fn add(&self, image: &Image) -> Result<Image> {
        let mut images = self.images.write();
        if images.contains_key(&image.id) {
            return Err(TiticacaError::Database(format!(
                "Image {} already exists",
                image.id
            )));
        }
        images.insert(image.id.clone(), image.clone());
        Ok(image.clone())
    }

    async fn get(&self, image_id: &str) -> Result<Image> {
        self.images
            .read()
            .get(image_id)
            .cloned()
            .ok_or_else(|| TiticacaError::ImageNotFound {
                image_id: image_id.to_string(),
            })
    }

    async fn list(&self) -> Result<Vec<Image>> {
        let mut images: Vec<Image> = self.images.read().values().cloned().collect();
        images.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(images)
    }

    async fn save(&self, image: &Image) -> Result<Image> {
        let mut images = self.images.write();
        let row = images
            .get_mut(&image.id)
            .ok_or_else(|| TiticacaError::ImageNotFound {
                image_id: image.id.clone(),
            })?;

        if row.version != image.version {
            return Err(TiticacaError::Conflict(format!(
                "image {} changed since version {}",
                image.id, image.version
            )));
        }

        let mut saved = image.clone();
        saved.version += 1;
        saved.updated_at = Utc::now().timestamp();
        *row = saved.clone();
        Ok(saved)
    }

    async fn remove(&self, image_id: &str) -> Result<()> {
        self.images
            .write()
            .remove(image_id)
            .map(|_| ())
            .ok_or_else(|| TiticacaError::ImageNotFound {
                image_id: image_id.to_string(),
            })
    }
}
