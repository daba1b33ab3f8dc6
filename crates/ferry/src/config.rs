//! Configuration for the ferry binary

use ferry_pipeline::{FileMapping, PipelineConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{FerryError, Result};

/// Main configuration, read from `<ferry home>/config.toml` by default
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FerryConfig {
    /// Mapping rules, one `pattern|sourcePath|targetPath` per line
    #[serde(default = "default_mapping_file")]
    pub mapping_file: PathBuf,

    /// Snapshot file of the processed-file ledger
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Watcher cadence in milliseconds
    #[serde(default = "default_polling_interval")]
    pub polling_interval_ms: u64,

    /// Root directory that remote paths are written under
    #[serde(default = "default_destination_root")]
    pub destination_root: PathBuf,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_mapping_file() -> PathBuf {
    ferry_logging::ferry_home().join("mappings.conf")
}

fn default_ledger_path() -> PathBuf {
    ferry_logging::ferry_home().join("processed_files.json")
}

fn default_polling_interval() -> u64 {
    1000
}

fn default_destination_root() -> PathBuf {
    ferry_logging::ferry_home().join("outbox")
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            mapping_file: default_mapping_file(),
            ledger_path: default_ledger_path(),
            polling_interval_ms: default_polling_interval(),
            destination_root: default_destination_root(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl FerryConfig {
    /// Default config location: `<ferry home>/config.toml`
    pub fn default_path() -> PathBuf {
        ferry_logging::ferry_home().join("config.toml")
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FerryConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        info!(path = %path.display(), "No config file, using defaults");
        Ok(Self::default())
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| FerryError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling_interval_ms == 0 {
            return Err(FerryError::Config(
                "polling_interval_ms must be at least 1".to_string(),
            ));
        }
        self.pipeline.validate()?;
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Parse the mapping file.
    pub fn load_mappings(&self) -> Result<Vec<Arc<FileMapping>>> {
        let content = std::fs::read_to_string(&self.mapping_file).map_err(|e| {
            FerryError::Config(format!(
                "cannot read mapping file {}: {}",
                self.mapping_file.display(),
                e
            ))
        })?;
        let mappings = FileMapping::parse_all(&content)?;
        Ok(mappings.into_iter().map(Arc::new).collect())
    }
}
