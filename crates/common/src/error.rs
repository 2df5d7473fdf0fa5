//! Common error types for tabscore
//!
//! This module defines all error types used across the tabscore crates.
//! All errors map to an HTTP-style status code so a scoring front end can
//! report them without inspecting messages.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for tabscore
#[derive(Error, Debug)]
pub enum ScoringError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A requested model or schema file is absent
    #[error("File {file} not found in directory {}", dir.display())]
    NotFound { file: String, dir: PathBuf },

    /// Transformer used before it was fitted
    #[error("Transformer is not fitted: call fit first")]
    NotFitted,

    /// Precondition violated by the caller
    #[error("Usage error: {0}")]
    Usage(String),

    /// Input shape the operation does not handle
    #[error("Unsupported input: {0}")]
    Unsupported(String),

    /// A persisted transformer attribute could not be restored
    #[error("Failed to restore attribute `{attribute}` from {}: {reason}", path.display())]
    Reload {
        attribute: String,
        path: PathBuf,
        reason: String,
    },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Model loading or execution errors
    #[error("Model error: {0}")]
    Model(String),

    /// Tensor decoding errors
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// Binary payload decoding errors
    #[error("Decode error: {0}")]
    Decode(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScoringError {
    /// Map the error to an HTTP-style status code
    pub fn status_code(&self) -> u16 {
        match self {
            ScoringError::NotFound { .. } => 404,
            ScoringError::NotFitted
            | ScoringError::Usage(_)
            | ScoringError::InvalidInput(_)
            | ScoringError::Decode(_)
            | ScoringError::Serialization(_) => 400,
            ScoringError::Unsupported(_) => 415,
            ScoringError::Config(_)
            | ScoringError::Reload { .. }
            | ScoringError::Model(_)
            | ScoringError::Tensor(_)
            | ScoringError::Yaml(_)
            | ScoringError::Io(_)
            | ScoringError::Internal(_) => 500,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ScoringError::Config(msg.into())
    }

    /// Create a not-found error naming the file and the directory searched
    pub fn not_found(file: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        ScoringError::NotFound {
            file: file.into(),
            dir: dir.into(),
        }
    }

    /// Create a usage error
    pub fn usage(msg: impl Into<String>) -> Self {
        ScoringError::Usage(msg.into())
    }

    /// Create an unsupported-input error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        ScoringError::Unsupported(msg.into())
    }

    /// Create a reload error for one persisted attribute
    pub fn reload(
        attribute: impl Into<String>,
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        ScoringError::Reload {
            attribute: attribute.into(),
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ScoringError::InvalidInput(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        ScoringError::Model(msg.into())
    }

    /// Create a tensor error
    pub fn tensor(msg: impl Into<String>) -> Self {
        ScoringError::Tensor(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        ScoringError::Decode(msg.into())
    }
}

/// Result type alias for tabscore operations
pub type Result<T> = std::result::Result<T, ScoringError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_names_file_and_dir() {
        let err = ScoringError::not_found("missing.pkl", "/opt/models");
        let msg = err.to_string();
        assert!(msg.contains("missing.pkl"));
        assert!(msg.contains("/opt/models"));
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ScoringError::NotFitted.status_code(), 400);
        assert_eq!(ScoringError::usage("X has only one dim").status_code(), 400);
        assert_eq!(ScoringError::unsupported("ndarray").status_code(), 415);
        assert_eq!(
            ScoringError::reload("dtypes", "/tmp/t.json", "bad").status_code(),
            500
        );
    }
}
