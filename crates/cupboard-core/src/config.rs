//! Resolved configuration consumed by the storage layer.
//!
//! The CLI decides where the data directory is; this module only describes
//! what lives there and how `config.toml` inside it is read.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::str_enum;
use crate::{Error, Result};

/// File name of the optional per-cupboard configuration.
pub const CONFIG_FILE: &str = "config.toml";

/// File name of the cache database inside the data directory.
pub const CACHE_FILE: &str = "cupboard.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Sqlite,
}

str_enum!(Backend, "backend" {
    Sqlite => "sqlite",
});

/// When cache mutations are mirrored into the JSONL files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Rewrite affected files before every mutation returns.
    #[default]
    Immediate,
    /// Rewrite once `batch_size` mutations are pending, and on detach.
    Batch,
    /// Rewrite only on detach.
    OnClose,
}

str_enum!(SyncStrategy, "sync strategy" {
    Immediate => "immediate",
    Batch => "batch",
    OnClose => "on_close",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CupboardConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Directory holding the JSONL files and the cache database.
    pub data_dir: PathBuf,

    #[serde(default)]
    pub sync_strategy: SyncStrategy,

    /// Pending mutations that trigger a flush under the batch strategy.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Shape of `config.toml`: everything but the data directory, which is
/// implied by the file's location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    backend: Option<Backend>,
    #[serde(default)]
    sync_strategy: Option<SyncStrategy>,
    #[serde(default)]
    batch_size: Option<usize>,
}

fn default_batch_size() -> usize {
    100
}

impl CupboardConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::default(),
            data_dir: data_dir.into(),
            sync_strategy: SyncStrategy::default(),
            batch_size: default_batch_size(),
        }
    }

    pub fn with_sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.sync_strategy = strategy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Load `{data_dir}/config.toml` or fall back to defaults.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let mut config = Self::new(data_dir);
        let config_path = data_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let file: ConfigFile = toml::from_str(&content).map_err(|e| {
                Error::Config(format!("failed to parse {}: {}", config_path.display(), e))
            })?;
            if let Some(backend) = file.backend {
                config.backend = backend;
            }
            if let Some(strategy) = file.sync_strategy {
                config.sync_strategy = strategy;
            }
            if let Some(batch_size) = file.batch_size {
                config.batch_size = batch_size;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Write this configuration (minus the data directory) to
    /// `{data_dir}/config.toml`.
    pub fn write(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let file = ConfigFile {
            backend: Some(self.backend),
            sync_strategy: Some(self.sync_strategy),
            batch_size: Some(self.batch_size),
        };
        let content = toml::to_string_pretty(&file)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(self.data_dir.join(CONFIG_FILE), content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("data_dir is required".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join(CACHE_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = CupboardConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.backend, Backend::Sqlite);
        assert_eq!(config.sync_strategy, SyncStrategy::Immediate);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.cache_path(), dir.path().join("cupboard.db"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "sync_strategy = \"batch\"\nbatch_size = 5\n",
        )
        .unwrap();

        let config = CupboardConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.sync_strategy, SyncStrategy::Batch);
        assert_eq!(config.batch_size, 5);
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        CupboardConfig::new(dir.path())
            .with_sync_strategy(SyncStrategy::OnClose)
            .write()
            .unwrap();

        let config = CupboardConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.sync_strategy, SyncStrategy::OnClose);
    }

    #[test]
    fn test_rejects_bad_values() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "backend = \"postgres\"\n").unwrap();
        assert!(matches!(
            CupboardConfig::load_or_default(dir.path()),
            Err(Error::Config(_))
        ));

        let config = CupboardConfig::new(dir.path()).with_batch_size(0);
        assert!(config.validate().is_err());
        assert_eq!("on_close".parse::<SyncStrategy>().unwrap(), SyncStrategy::OnClose);
    }
}
