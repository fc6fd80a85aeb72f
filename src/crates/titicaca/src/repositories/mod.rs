//! Repository traits and their SQLite implementations
//!
//! Flows, the executor and the cache workers only see the traits; which
//! backend sits underneath (and which gateway layers wrap it) is decided
//! by the composition root.

pub mod image_repository;
pub mod task_repository;

pub use image_repository::SqlImageRepository;
pub use task_repository::SqlTaskRepository;

use crate::error::Result;
use crate::models::{Image, Task};
use async_trait::async_trait;

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn add(&self, task: &Task) -> Result<()>;

    /// Fails with `TaskNotFound`
    async fn get(&self, task_id: &str) -> Result<Task>;

    /// Persist the in-memory state of a task that already exists
    async fn save(&self, task: &Task) -> Result<()>;

    /// Newest first
    async fn list(&self) -> Result<Vec<Task>>;

    async fn remove(&self, task_id: &str) -> Result<()>;
}

#[async_trait]
pub trait ImageRepository: Send + Sync {
    async fn add(&self, image: &Image) -> Result<Image>;

    /// Fails with `ImageNotFound`
    async fn get(&self, image_id: &str) -> Result<Image>;

    async fn list(&self) -> Result<Vec<Image>>;

    /// Conditional write: succeeds only while the stored version still
    /// equals `image.version`, and returns the image at its new version.
    /// A stale version yields `Conflict`.
    async fn save(&self, image: &Image) -> Result<Image>;

    async fn remove(&self, image_id: &str) -> Result<()>;
}
