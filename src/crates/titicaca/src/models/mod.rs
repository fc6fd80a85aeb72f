//! Domain models

pub mod image;
pub mod task;

pub use image::{Image, ImageLocation, ImageStatus, IMPORT_LOCK_PROPERTY};
pub use task::{Task, TaskFactory, TaskStatus, TaskType};
