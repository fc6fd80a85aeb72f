//! Task entity: the durable record of one asynchronous unit of work

use crate::error::{Result, TiticacaError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Pending, TaskStatus::Failure)
                | (TaskStatus::Processing, TaskStatus::Success)
                | (TaskStatus::Processing, TaskStatus::Failure)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = TiticacaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "success" => Ok(TaskStatus::Success),
            "failure" => Ok(TaskStatus::Failure),
            other => Err(TiticacaError::Database(format!("Unknown task status: {}", other))),
        }
    }
}

/// Kinds of task the executor knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Legacy import: create an image and pull its data from a URL
    Import,
    /// Interoperable import into one or more stores of an existing image
    ApiImageImport,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Import => "import",
            TaskType::ApiImageImport => "api_image_import",
        }
    }

    /// Both types stage data before committing it
    pub fn needs_staging(&self) -> bool {
        true
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = TiticacaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "import" => Ok(TaskType::Import),
            "api_image_import" => Ok(TaskType::ApiImageImport),
            other => Err(TiticacaError::InvalidTaskType(other.to_string())),
        }
    }
}

/// An asynchronous unit of work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub owner: String,
    pub image_id: Option<String>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub message: String,
    /// Hours to keep the task once it is finished
    pub task_time_to_live: i64,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn new(task_type: TaskType, owner: impl Into<String>, input: serde_json::Value) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            task_type,
            status: TaskStatus::Pending,
            owner: owner.into(),
            image_id: None,
            user_id: None,
            request_id: None,
            input,
            result: None,
            message: String::new(),
            task_time_to_live: 48,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_image_id(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_time_to_live(mut self, hours: i64) -> Self {
        self.task_time_to_live = hours;
        self
    }

    /// pending → processing
    pub fn begin(&mut self) -> Result<()> {
        self.set_status(TaskStatus::Processing)
    }

    /// processing → success
    pub fn succeed(&mut self, result: serde_json::Value) -> Result<()> {
        self.set_status(TaskStatus::Success)?;
        self.result = Some(result);
        self.expire_later();
        Ok(())
    }

    /// → failure, recording why
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.set_status(TaskStatus::Failure)?;
        self.message = message.into();
        self.expire_later();
        Ok(())
    }

    fn set_status(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TiticacaError::InvalidTaskStatusTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now().timestamp();
        Ok(())
    }

    fn expire_later(&mut self) {
        self.expires_at = Some(Utc::now().timestamp() + self.task_time_to_live * 3600);
    }
}

/// Creates tasks, refusing ones the executor could never run
#[derive(Debug, Clone)]
pub struct TaskFactory {
    task_time_to_live: i64,
    staging_dir: Option<PathBuf>,
}

impl TaskFactory {
    pub fn new(task_time_to_live: i64, staging_dir: Option<PathBuf>) -> Self {
        Self {
            task_time_to_live,
            staging_dir,
        }
    }

    pub fn new_task(
        &self,
        task_type: &str,
        owner: impl Into<String>,
        input: serde_json::Value,
    ) -> Result<Task> {
        let task_type: TaskType = task_type.parse()?;

        if task_type.needs_staging() {
            match &self.staging_dir {
                Some(dir) if dir.is_dir() => {}
                Some(dir) => {
                    return Err(TiticacaError::BadTaskConfiguration(format!(
                        "staging directory {} does not exist",
                        dir.display()
                    )))
                }
                None => {
                    return Err(TiticacaError::BadTaskConfiguration(
                        "no staging directory is configured".to_string(),
                    ))
                }
            }
        }

        Ok(Task::new(task_type, owner, input).with_time_to_live(self.task_time_to_live))
    }
}
