//! Configuration management for titicaca
//!
//! Supports layered configuration:
//! - User-level: ~/.titicaca/titicaca.toml
//! - Project-level: ./.titicaca/titicaca.toml
//! - Explicit: `--config <path>`

mod loader;
mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    ActionRetryConfig, BackendConfig, DatabaseConfig, EngineMode, ExecutorConfig,
    ImageCacheConfig, ImageConversionConfig, ImageFormatConfig, ImageImportConfig,
    InjectMetadataConfig, LoggingConfig, QemuImgConfig, QuotaConfig, StagingConfig,
    StoresConfig, TaskConfig, TiticacaConfig,
};

use crate::Result;
use std::path::PathBuf;

/// Load configuration, optionally topped by an explicit file
pub async fn load_config(explicit: Option<PathBuf>) -> Result<TiticacaConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = explicit {
        loader = loader.with_explicit(path);
    }
    loader.load().await
}
