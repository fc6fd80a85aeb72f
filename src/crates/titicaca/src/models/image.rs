//! Image aggregate and its import bookkeeping

use crate::error::{Result, TiticacaError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Extra property naming the task that currently owns an image's import
pub const IMPORT_LOCK_PROPERTY: &str = "os_titicaca_import_task";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Queued,
    Saving,
    Uploading,
    Importing,
    Active,
    Deactivated,
    Killed,
    PendingDelete,
    Deleted,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Queued => "queued",
            ImageStatus::Saving => "saving",
            ImageStatus::Uploading => "uploading",
            ImageStatus::Importing => "importing",
            ImageStatus::Active => "active",
            ImageStatus::Deactivated => "deactivated",
            ImageStatus::Killed => "killed",
            ImageStatus::PendingDelete => "pending_delete",
            ImageStatus::Deleted => "deleted",
        }
    }

    /// Whether `self → next` is a legal move; staying put always is
    pub fn can_transition_to(&self, next: ImageStatus) -> bool {
        use ImageStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Queued => matches!(next, Saving | Uploading | Importing | Active | Deleted),
            Saving => matches!(next, Active | Killed | Deleted | Queued),
            Uploading => matches!(next, Importing | Queued | Deleted),
            Importing => matches!(next, Active | Deactivated | Killed | Deleted | Queued),
            Active => matches!(next, PendingDelete | Deleted | Deactivated),
            Deactivated => matches!(next, Active | Deleted),
            Killed | PendingDelete => matches!(next, Deleted),
            Deleted => false,
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ImageStatus {
    type Err = TiticacaError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "queued" => ImageStatus::Queued,
            "saving" => ImageStatus::Saving,
            "uploading" => ImageStatus::Uploading,
            "importing" => ImageStatus::Importing,
            "active" => ImageStatus::Active,
            "deactivated" => ImageStatus::Deactivated,
            "killed" => ImageStatus::Killed,
            "pending_delete" => ImageStatus::PendingDelete,
            "deleted" => ImageStatus::Deleted,
            other => {
                return Err(TiticacaError::Database(format!(
                    "Unknown image status: {}",
                    other
                )))
            }
        })
    }
}

/// Where a copy of the image data lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLocation {
    pub url: String,
    pub store: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: Option<String>,
    pub owner: String,
    pub status: ImageStatus,
    pub size: Option<u64>,
    pub virtual_size: Option<u64>,
    /// Hex sha256 of the image data
    pub checksum: Option<String>,
    pub disk_format: Option<String>,
    pub container_format: Option<String>,
    pub locations: Vec<ImageLocation>,
    pub extra_properties: BTreeMap<String, String>,
    pub importing_stores: BTreeSet<String>,
    pub failed_stores: BTreeSet<String>,
    pub completed_stores: BTreeSet<String>,
    /// Bumped by every successful save
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Image {
    pub fn new(owner: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            name: None,
            owner: owner.into(),
            status: ImageStatus::Queued,
            size: None,
            virtual_size: None,
            checksum: None,
            disk_format: None,
            container_format: None,
            locations: Vec::new(),
            extra_properties: BTreeMap::new(),
            importing_stores: BTreeSet::new(),
            failed_stores: BTreeSet::new(),
            completed_stores: BTreeSet::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_status(mut self, status: ImageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_formats(mut self, disk_format: &str, container_format: &str) -> Self {
        self.disk_format = Some(disk_format.to_string());
        self.container_format = Some(container_format.to_string());
        self
    }

    pub fn set_status(&mut self, next: ImageStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TiticacaError::InvalidImageStatusTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Task id holding the import lock, if any
    pub fn import_lock(&self) -> Option<&str> {
        self.extra_properties
            .get(IMPORT_LOCK_PROPERTY)
            .map(String::as_str)
    }

    pub fn location_for_store(&self, store: &str) -> Option<&ImageLocation> {
        self.locations.iter().find(|l| l.store == store)
    }

    /// The three store sets never share a member
    pub fn store_sets_disjoint(&self) -> bool {
        self.importing_stores.is_disjoint(&self.failed_stores)
            && self.importing_stores.is_disjoint(&self.completed_stores)
            && self.failed_stores.is_disjoint(&self.completed_stores)
    }
}
