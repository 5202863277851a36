//! Configuration Error Types

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors with detailed context
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Explicitly requested configuration file does not exist
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    /// A source could not be read or merged
    #[error("Failed to load configuration: {error}")]
    Load { error: String },

    /// Merged values do not fit the configuration structure
    #[error("Invalid value for '{field}': {context}")]
    InvalidValue { field: String, context: String },

    /// Declarative validation rules failed
    #[error("Configuration validation failed: {error}")]
    ValidationError { error: String },
}

impl ConfigurationError {
    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    pub fn invalid_value(field: impl Into<String>, context: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            context: context.into(),
        }
    }

    pub fn validation_error<E: std::fmt::Display>(error: E) -> Self {
        Self::ValidationError {
            error: error.to_string(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        Self::Load {
            error: err.to_string(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
