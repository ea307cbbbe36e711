//! Engine configuration.
//!
//! Defaults for pipe buffering, filter parallelism and worker thread naming,
//! persisted as TOML:
//!
//! ```toml
//! pipe_buffer = 16
//! parallel = 1
//! worker_name_prefix = "pipfil"
//! ```
//!
//! Every key is optional; missing keys take their defaults.

use crate::error::{PipfilError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default capacity of each per-consumer pipe queue
pub const DEFAULT_PIPE_BUFFER: usize = 16;

/// Default number of in-flight invocations per filter
pub const DEFAULT_PARALLEL: usize = 1;

/// Default prefix of worker thread names
pub const DEFAULT_WORKER_NAME_PREFIX: &str = "pipfil";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of each per-consumer queue of pipes built with
    /// [`Pipe::with_config`](crate::pipeline::Pipe::with_config)
    #[serde(default = "default_pipe_buffer")]
    pub pipe_buffer: usize,

    /// Parallelism applied to every filter by
    /// [`Model::apply_config`](crate::pipeline::Model::apply_config)
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    /// Worker threads are named `<prefix>-<filter>`
    #[serde(default = "default_worker_name_prefix")]
    pub worker_name_prefix: String,
}

fn default_pipe_buffer() -> usize {
    DEFAULT_PIPE_BUFFER
}

fn default_parallel() -> usize {
    DEFAULT_PARALLEL
}

fn default_worker_name_prefix() -> String {
    DEFAULT_WORKER_NAME_PREFIX.to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipe_buffer: DEFAULT_PIPE_BUFFER,
            parallel: DEFAULT_PARALLEL,
            worker_name_prefix: default_worker_name_prefix(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(PipfilError::from)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to load config file {}", path.display()))
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load engine config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config, creating parent directories as needed
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PipfilError::Config(format!(
                        "Failed to create config directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PipfilError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            PipfilError::Config(format!(
                "Failed to write config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pipe_buffer == 0 {
            return Err(PipfilError::Config(
                "pipe_buffer must be at least 1".to_string(),
            ));
        }
        if self.parallel == 0 {
            return Err(PipfilError::Config("parallel must be at least 1".to_string()));
        }
        if self.worker_name_prefix.is_empty() {
            return Err(PipfilError::Config(
                "worker_name_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.pipe_buffer, 16);
        assert_eq!(config.parallel, 1);
        assert_eq!(config.worker_name_prefix, "pipfil");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("parallel = 4\n").unwrap();
        assert_eq!(config.parallel, 4);
        assert_eq!(config.pipe_buffer, DEFAULT_PIPE_BUFFER);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            EngineConfig::from_toml_str("pipe_buffer = 0"),
            Err(PipfilError::Config(_))
        ));
        assert!(EngineConfig::from_toml_str("parallel = 0").is_err());
        assert!(matches!(
            EngineConfig::from_toml_str("parallel = \"many\""),
            Err(PipfilError::Toml(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.toml");
        let config = EngineConfig {
            pipe_buffer: 64,
            parallel: 3,
            worker_name_prefix: "etl".to_string(),
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
        assert_eq!(EngineConfig::load_or_default(&path), EngineConfig::default());
    }
}
