//! Configuration structures for tabscore
//!
//! Configurations are loaded from YAML files, or assembled from environment
//! variables when no file is given.

use crate::error::{Result, ScoringError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the scoring worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Model artifact configuration
    pub model: ModelConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Model artifact configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Directory holding the model and its sidecar files.
    /// Defaults to the directory of the running executable.
    #[serde(default)]
    pub model_dir: Option<PathBuf>,

    /// Model file name inside `model_dir`
    pub model_file: String,

    /// Input schema file name inside `model_dir`
    #[serde(default = "default_schema_file")]
    pub schema_file: String,

    /// Transformer sidecar file name inside `model_dir`
    #[serde(default = "default_transformer_file")]
    pub transformer_file: String,

    /// Fixed input shape for ONNX models (e.g. [1, 6]); inferred when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_shape: Option<Vec<usize>>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,

    /// Emit JSON log lines instead of plain text
    #[serde(default)]
    pub structured_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
            structured_logging: false,
        }
    }
}

/// Default value functions
fn default_schema_file() -> String {
    "input_schema.json".to_string()
}

fn default_transformer_file() -> String {
    "onnx_data_transformer.json".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl ScoringConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ScoringError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: ScoringConfig = serde_yaml::from_str(&content).map_err(|e| {
            ScoringError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let model_file = std::env::var("TABSCORE_MODEL_FILE")
            .map_err(|_| ScoringError::config("TABSCORE_MODEL_FILE is not set"))?;

        let config = ScoringConfig {
            model: ModelConfig {
                model_dir: std::env::var("TABSCORE_MODEL_DIR").ok().map(PathBuf::from),
                model_file,
                schema_file: default_schema_file(),
                transformer_file: default_transformer_file(),
                input_shape: None,
            },
            observability: ObservabilityConfig {
                log_level: std::env::var("TABSCORE_LOG_LEVEL")
                    .unwrap_or_else(|_| default_log_level()),
                ..ObservabilityConfig::default()
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.model_file.trim().is_empty() {
            return Err(ScoringError::config("model_file must not be empty"));
        }

        if !LOG_LEVELS.contains(&self.observability.log_level.as_str()) {
            return Err(ScoringError::config(format!(
                "Invalid log level: {}",
                self.observability.log_level
            )));
        }

        if let Some(shape) = &self.model.input_shape {
            if shape.is_empty() || shape.contains(&0) {
                return Err(ScoringError::config(format!(
                    "Invalid input shape: {:?}",
                    shape
                )));
            }
        }

        Ok(())
    }

    /// Resolve the model directory, falling back to the executable's directory
    pub fn model_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.model.model_dir {
            return Ok(dir.clone());
        }

        let exe = std::env::current_exe()?;
        exe.parent()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| ScoringError::config("Cannot resolve executable directory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn base_config() -> ScoringConfig {
        ScoringConfig {
            model: ModelConfig {
                model_dir: Some(PathBuf::from("/models")),
                model_file: "model.onnx".to_string(),
                schema_file: default_schema_file(),
                transformer_file: default_transformer_file(),
                input_shape: None,
            },
            observability: ObservabilityConfig::default(),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_config_validation_empty_model_file() {
        let mut config = base_config();
        config.model.model_file = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_log_level() {
        let mut config = base_config();
        config.observability.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_yaml_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "model:\n  model_dir: /srv/model\n  model_file: model.onnx").unwrap();

        let config = ScoringConfig::from_file(file.path()).unwrap();
        assert_eq!(config.model.schema_file, "input_schema.json");
        assert_eq!(config.model.transformer_file, "onnx_data_transformer.json");
        assert_eq!(config.observability.log_level, "info");
        assert!(config.observability.enable_metrics);
        assert_eq!(config.model_dir().unwrap(), PathBuf::from("/srv/model"));
    }
}
