//! Layered configuration loader
//!
//! Loads configuration from:
//! 1. Default values
//! 2. User-level config: ~/.titicaca/titicaca.toml
//! 3. Project-level config: ./.titicaca/titicaca.toml
//! 4. An explicit file passed on the command line
//!
//! Layers are merged table by table, so a file that sets one key of a
//! section leaves the rest of that section to the lower layers.

use crate::config::schema::TiticacaConfig;
use crate::error::{Result, TiticacaError};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration loader that stacks user, project and explicit files
pub struct ConfigLoader {
    user_config_path: Option<PathBuf>,
    project_config_path: Option<PathBuf>,
    explicit_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            user_config_path: dirs::home_dir().map(|h| h.join(".titicaca").join("titicaca.toml")),
            project_config_path: std::env::current_dir()
                .ok()
                .map(|d| d.join(".titicaca").join("titicaca.toml")),
            explicit_path: None,
        }
    }

    /// Add a file that overrides every other layer; it must exist
    pub fn with_explicit(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    /// Replace the user and project locations
    pub fn with_paths(mut self, user: Option<PathBuf>, project: Option<PathBuf>) -> Self {
        self.user_config_path = user;
        self.project_config_path = project;
        self
    }

    pub async fn load(&self) -> Result<TiticacaConfig> {
        info!("Loading configuration with defaults");
        let mut merged = toml::Value::Table(toml::map::Map::new());

        for path in [&self.user_config_path, &self.project_config_path]
            .into_iter()
            .flatten()
        {
            if !path.exists() {
                debug!(path = %path.display(), "Config layer not present");
                continue;
            }
            let layer = Self::read_layer(path).await?;
            debug!(path = %path.display(), "Loaded config layer");
            merge_values(&mut merged, layer);
        }

        if let Some(path) = &self.explicit_path {
            if !path.exists() {
                return Err(TiticacaError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            let layer = Self::read_layer(path).await?;
            debug!(path = %path.display(), "Loaded explicit config");
            merge_values(&mut merged, layer);
        }

        let mut config: TiticacaConfig = merged.try_into().map_err(|e: toml::de::Error| {
            TiticacaError::Config(format!("Failed to parse config: {}", e))
        })?;
        config.resolve_env_vars();

        info!("Configuration loaded successfully");
        Ok(config)
    }

    async fn read_layer(path: &Path) -> Result<toml::Value> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| TiticacaError::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content).map_err(|e| {
            TiticacaError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursively overlay `layer` onto `base`; non-table values replace
fn merge_values(base: &mut toml::Value, layer: toml::Value) {
    match (base, layer) {
        (toml::Value::Table(base_table), toml::Value::Table(layer_table)) => {
            for (key, value) in layer_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}
