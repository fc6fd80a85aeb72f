//! Notifications for task and image state changes
//!
//! Emission is fire-and-forget: a sink that fails is logged and the state
//! change that triggered it stands.

use crate::error::Result;
use crate::models::{Image, Task};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    ImageCreated {
        image_id: String,
        status: String,
        timestamp: i64,
    },
    ImageUpdated {
        image_id: String,
        status: String,
        importing_stores: BTreeSet<String>,
        failed_stores: BTreeSet<String>,
        completed_stores: BTreeSet<String>,
        timestamp: i64,
    },
    ImageDeleted {
        image_id: String,
        timestamp: i64,
    },
    TaskCreated {
        task_id: String,
        task_type: String,
        timestamp: i64,
    },
    TaskStatusChanged {
        task_id: String,
        status: String,
        message: String,
        timestamp: i64,
    },
}

impl Notification {
    /// Dotted event name, e.g. `image.update` or `task.failure`
    pub fn event_type(&self) -> String {
        match self {
            Notification::ImageCreated { .. } => "image.create".to_string(),
            Notification::ImageUpdated { .. } => "image.update".to_string(),
            Notification::ImageDeleted { .. } => "image.delete".to_string(),
            Notification::TaskCreated { .. } => "task.create".to_string(),
            Notification::TaskStatusChanged { status, .. } => format!("task.{}", status),
        }
    }

    pub fn image_created(image: &Image) -> Self {
        Notification::ImageCreated {
            image_id: image.id.clone(),
            status: image.status.to_string(),
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn image_updated(image: &Image) -> Self {
        Notification::ImageUpdated {
            image_id: image.id.clone(),
            status: image.status.to_string(),
            importing_stores: image.importing_stores.clone(),
            failed_stores: image.failed_stores.clone(),
            completed_stores: image.completed_stores.clone(),
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn image_deleted(image_id: impl Into<String>) -> Self {
        Notification::ImageDeleted {
            image_id: image_id.into(),
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn task_created(task: &Task) -> Self {
        Notification::TaskCreated {
            task_id: task.id.clone(),
            task_type: task.task_type.to_string(),
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn task_status_changed(task: &Task) -> Self {
        Notification::TaskStatusChanged {
            task_id: task.id.clone(),
            status: task.status.to_string(),
            message: task.message.clone(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Destination for notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Send a notification, logging instead of propagating failures
pub fn emit(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.notify(&notification) {
        warn!(
            event_type = %notification.event_type(),
            error = %e,
            "Failed to send notification"
        );
    }
}

/// Writes notifications to the log
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify(&self, notification: &Notification) -> Result<()> {
        let payload = serde_json::to_string(notification)?;
        info!(event_type = %notification.event_type(), payload = %payload, "notification");
        Ok(())
    }
}

/// Keeps notifications in memory for later inspection
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events.lock().iter().map(Notification::event_type).collect()
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, notification: &Notification) -> Result<()> {
        self.events.lock().push(notification.clone());
        Ok(())
    }
}
