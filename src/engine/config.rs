//! Hybrid Model Configuration Module
//! Handles loading and validating hybrid.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "hybrid.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    pub version: String,
    #[serde(default)]
    pub relational: RelationalConfig,
    #[serde(default)]
    pub key_value: KeyValueConfig,
    #[serde(default)]
    pub pivot: PivotConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    /// SQLite file; `None` opens an in-memory database
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueConfig {
    /// COUNT hint used by `chunk` when the caller does not pass one
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
    /// COUNT hint used while counting keys by pattern
    #[serde(default = "default_count_batch_size")]
    pub count_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PivotConfig {
    #[serde(default = "default_pivot_accessor")]
    pub accessor: String,
    #[serde(default = "default_created_at")]
    pub created_at: String,
    #[serde(default = "default_updated_at")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_pool_size() -> u32 {
    1
}

fn default_scan_batch_size() -> usize {
    100
}

fn default_count_batch_size() -> usize {
    1000
}

fn default_pivot_accessor() -> String {
    "pivot".to_string()
}

fn default_created_at() -> String {
    "created_at".to_string()
}

fn default_updated_at() -> String {
    "updated_at".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            path: None,
            pool_size: default_pool_size(),
        }
    }
}

impl Default for KeyValueConfig {
    fn default() -> Self {
        Self {
            scan_batch_size: default_scan_batch_size(),
            count_batch_size: default_count_batch_size(),
        }
    }
}

impl Default for PivotConfig {
    fn default() -> Self {
        Self {
            accessor: default_pivot_accessor(),
            created_at: default_created_at(),
            updated_at: default_updated_at(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            relational: RelationalConfig::default(),
            key_value: KeyValueConfig::default(),
            pivot: PivotConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl HybridConfig {
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: HybridConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Configuration backed by a SQLite file instead of memory
    pub fn with_database(path: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.relational.path = Some(path.into());
        config.relational.pool_size = 4;
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relational.pool_size == 0 {
            return Err(ConfigError::Invalid("relational.pool_size must be at least 1".into()));
        }
        if self.key_value.scan_batch_size == 0 {
            return Err(ConfigError::Invalid("key_value.scan_batch_size must be at least 1".into()));
        }
        if self.key_value.count_batch_size == 0 {
            return Err(ConfigError::Invalid("key_value.count_batch_size must be at least 1".into()));
        }
        if self.pivot.accessor.is_empty() {
            return Err(ConfigError::Invalid("pivot.accessor must not be empty".into()));
        }
        Ok(())
    }
}
