//! Configuration schema definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TiticacaConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub task: TaskConfig,

    #[serde(default)]
    pub taskflow_executor: ExecutorConfig,

    #[serde(default)]
    pub staging: StagingConfig,

    #[serde(default)]
    pub stores: StoresConfig,

    #[serde(default)]
    pub image_import: ImageImportConfig,

    #[serde(default)]
    pub image_conversion: ImageConversionConfig,

    #[serde(default)]
    pub image_format: ImageFormatConfig,

    #[serde(default)]
    pub inject_metadata_properties: InjectMetadataConfig,

    #[serde(default)]
    pub image_cache: ImageCacheConfig,

    #[serde(default)]
    pub action_wrapper: ActionRetryConfig,

    #[serde(default)]
    pub quota: QuotaConfig,

    #[serde(default)]
    pub qemu_img: QemuImgConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to SQLite database file, relative paths resolve under ~/.titicaca
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "titicaca.db".to_string(),
        }
    }
}

/// Task lifetime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Hours a finished task is kept before it may be reaped
    pub task_time_to_live: i64,

    /// Scratch directory for flows that need one
    pub work_dir: Option<PathBuf>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            task_time_to_live: 48,
            work_dir: None,
        }
    }
}

/// Flow engine selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Serial,
    #[default]
    Parallel,
}

/// Task executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub engine_mode: EngineMode,

    /// Worker pool size for the parallel engine
    pub max_workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            engine_mode: EngineMode::Parallel,
            max_workers: 10,
        }
    }
}

/// Staging area used for in-flight image data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Must be a `file://` URI
    pub node_staging_uri: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            node_staging_uri: "file:///tmp/staging/".to_string(),
        }
    }
}

impl StagingConfig {
    /// Local directory behind `node_staging_uri`, if it is a file URI
    pub fn staging_dir(&self) -> Option<PathBuf> {
        self.node_staging_uri
            .strip_prefix("file://")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}

/// A single filesystem backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub datadir: PathBuf,
}

/// Storage backends
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoresConfig {
    pub default_backend: Option<String>,
    pub backends: BTreeMap<String, BackendConfig>,
}

/// Interoperable image import settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageImportConfig {
    /// Plugins run between staging and committing, in order
    pub image_import_plugins: Vec<String>,

    /// Default for requests that do not say
    pub all_stores_must_succeed: bool,
}

impl Default for ImageImportConfig {
    fn default() -> Self {
        Self {
            image_import_plugins: Vec::new(),
            all_stores_must_succeed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConversionConfig {
    pub output_format: String,
}

impl Default for ImageConversionConfig {
    fn default() -> Self {
        Self {
            output_format: "raw".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageFormatConfig {
    /// VMDK create-types that may be imported
    pub vmdk_allowed_types: Vec<String>,
}

impl Default for ImageFormatConfig {
    fn default() -> Self {
        Self {
            vmdk_allowed_types: vec![
                "streamOptimized".to_string(),
                "monolithicSparse".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectMetadataConfig {
    /// Callers holding any of these roles are left alone
    pub ignore_user_roles: Vec<String>,

    /// Properties merged into every imported image
    pub inject: BTreeMap<String, String>,
}

impl Default for InjectMetadataConfig {
    fn default() -> Self {
        Self {
            ignore_user_roles: vec!["admin".to_string()],
            inject: BTreeMap::new(),
        }
    }
}

/// Local image cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCacheConfig {
    pub image_cache_dir: PathBuf,

    /// Bytes the pruner lets the cache grow to
    pub image_cache_max_size: u64,

    /// Seconds before an incomplete file is considered stalled
    pub image_cache_stall_time: u64,

    /// Directory holding the cache lock file
    pub lock_path: PathBuf,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            image_cache_dir: PathBuf::from("/var/lib/titicaca/image-cache"),
            image_cache_max_size: 10 * 1024 * 1024 * 1024,
            image_cache_stall_time: 86400,
            lock_path: PathBuf::from("/var/lock/titicaca"),
        }
    }
}

/// Retry policy for optimistic image updates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionRetryConfig {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for ActionRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 10,
            max_delay_ms: 500,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub image_property_quota: usize,
    pub image_location_quota: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            image_property_quota: 128,
            image_location_quota: 10,
        }
    }
}

/// Limits applied to qemu-img when it inspects untrusted input
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QemuImgConfig {
    pub binary: String,
    pub cpu_time_limit_secs: u64,
    pub address_space_limit_bytes: u64,
}

impl Default for QemuImgConfig {
    fn default() -> Self {
        Self {
            binary: "qemu-img".to_string(),
            cpu_time_limit_secs: 30,
            address_space_limit_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log format: pretty, json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl TiticacaConfig {
    /// Expand `${VAR_NAME}` references in path-like settings
    pub fn resolve_env_vars(&mut self) {
        self.database.path = Self::expand_env_var(&self.database.path);
        self.staging.node_staging_uri = Self::expand_env_var(&self.staging.node_staging_uri);
        for backend in self.stores.backends.values_mut() {
            let expanded = Self::expand_env_var(&backend.datadir.to_string_lossy());
            backend.datadir = PathBuf::from(expanded);
        }
    }

    fn expand_env_var(value: &str) -> String {
        if value.starts_with("${") && value.ends_with('}') {
            let var_name = &value[2..value.len() - 1];
            std::env::var(var_name).unwrap_or_else(|_| value.to_string())
        } else {
            value.to_string()
        }
    }

    /// Resolved database path
    pub fn database_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.database.path);
        if path.is_absolute() {
            return path;
        }
        match dirs::home_dir() {
            Some(home) => home.join(".titicaca").join(path),
            None => path,
        }
    }
}
