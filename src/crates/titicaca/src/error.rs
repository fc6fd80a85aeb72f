//! Error types for titicaca
//!
//! Every failure the pipeline can surface is a [`TiticacaError`]. Callers that
//! need to react to the category of a failure (retry, report, exit code) use
//! [`TiticacaError::kind`] instead of matching on individual variants.

use thiserror::Error;

/// Result type alias for titicaca operations
pub type Result<T> = std::result::Result<T, TiticacaError>;

/// Main error type for titicaca
#[derive(Error, Debug)]
pub enum TiticacaError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No image found with ID {image_id}")]
    ImageNotFound { image_id: String },

    #[error("Task with the given ID {task_id} could not be found")]
    TaskNotFound { task_id: String },

    #[error("Task type {0} is not supported")]
    InvalidTaskType(String),

    #[error("Status transition from {from} to {to} is not allowed")]
    InvalidTaskStatusTransition { from: String, to: String },

    #[error("Image status transition from {from} to {to} is not allowed")]
    InvalidImageStatusTransition { from: String, to: String },

    #[error("Store {store} cannot move to {target}: {reason}")]
    InvalidStoreTransition {
        store: String,
        target: String,
        reason: String,
    },

    #[error("Bad task configuration: {0}")]
    BadTaskConfiguration(String),

    #[error("Import task failed: {0}")]
    ImportTask(String),

    #[error("Task was aborted externally: {0}")]
    TaskAborted(String),

    #[error("Conflicting update: {0}")]
    Conflict(String),

    #[error("Unsafe image: {0}")]
    UnsafeImage(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("External tool not installed: {0}")]
    ToolNotInstalled(String),

    #[error("External tool failed: {0}")]
    ToolFailed(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse error category used for reporting and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal at task start, never retried
    Configuration,
    /// Network or store trouble; the operator resubmits
    Transient,
    /// The data itself is bad
    DataIntegrity,
    /// Another actor won a race on the same image
    Concurrency,
    /// Optional feature unavailable; callers may continue
    Optional,
    NotFound,
    Forbidden,
    Internal,
}

impl TiticacaError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TiticacaError::BadTaskConfiguration(_)
            | TiticacaError::InvalidTaskType(_)
            | TiticacaError::Config(_) => ErrorKind::Configuration,
            TiticacaError::Http(_) | TiticacaError::Store(_) | TiticacaError::Io(_) => {
                ErrorKind::Transient
            }
            TiticacaError::ImportTask(_)
            | TiticacaError::UnsafeImage(_)
            | TiticacaError::ChecksumMismatch { .. }
            | TiticacaError::ToolFailed(_) => ErrorKind::DataIntegrity,
            TiticacaError::TaskAborted(_) | TiticacaError::Conflict(_) => ErrorKind::Concurrency,
            TiticacaError::ToolNotInstalled(_) => ErrorKind::Optional,
            TiticacaError::NotFound(_)
            | TiticacaError::ImageNotFound { .. }
            | TiticacaError::TaskNotFound { .. } => ErrorKind::NotFound,
            TiticacaError::Forbidden(_) | TiticacaError::LimitExceeded(_) => ErrorKind::Forbidden,
            TiticacaError::InvalidTaskStatusTransition { .. }
            | TiticacaError::InvalidImageStatusTransition { .. }
            | TiticacaError::InvalidStoreTransition { .. }
            | TiticacaError::Database(_)
            | TiticacaError::Serialization(_)
            | TiticacaError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Configuration => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::Forbidden => 4,
            ErrorKind::DataIntegrity => 5,
            ErrorKind::Concurrency => 6,
            ErrorKind::Transient | ErrorKind::Optional | ErrorKind::Internal => 1,
        }
    }

    /// True when the error only means an optimistic write lost a race
    pub fn is_conflict(&self) -> bool {
        matches!(self, TiticacaError::Conflict(_))
    }
}

impl From<sqlx::Error> for TiticacaError {
    fn from(err: sqlx::Error) -> Self {
        TiticacaError::Database(err.to_string())
    }
}

impl From<toml::de::Error> for TiticacaError {
    fn from(err: toml::de::Error) -> Self {
        TiticacaError::Config(err.to_string())
    }
}

impl From<anyhow::Error> for TiticacaError {
    fn from(err: anyhow::Error) -> Self {
        TiticacaError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_transition_message() {
        let err = TiticacaError::InvalidTaskStatusTransition {
            from: "success".to_string(),
            to: "processing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Status transition from success to processing is not allowed"
        );
    }

    #[test]
    fn test_concurrency_is_distinct_from_integrity() {
        let aborted = TiticacaError::TaskAborted("lost".to_string());
        let bad = TiticacaError::ImportTask("short read".to_string());

        assert_eq!(aborted.kind(), ErrorKind::Concurrency);
        assert_eq!(bad.kind(), ErrorKind::DataIntegrity);
        assert_ne!(aborted.exit_code(), bad.exit_code());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TiticacaError::BadTaskConfiguration("x".into()).exit_code(), 2);
        assert_eq!(
            TiticacaError::ImageNotFound { image_id: "i".into() }.exit_code(),
            3
        );
        assert_eq!(TiticacaError::Forbidden("x".into()).exit_code(), 4);
        assert_eq!(TiticacaError::Other("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_anyhow_errors_become_other() {
        let err: TiticacaError = anyhow::anyhow!("plugin blew up").into();
        assert!(matches!(err, TiticacaError::Other(ref m) if m == "plugin blew up"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_tool_not_installed_is_optional() {
        let err = TiticacaError::ToolNotInstalled("qemu-img".into());
        assert_eq!(err.kind(), ErrorKind::Optional);
    }
}
