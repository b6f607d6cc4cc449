/// Structured error types for dashboard-core.
///
/// Uses `thiserror` so library consumers get composable errors.
/// The binary (dashboard-cli) wraps these in `anyhow` for reporting.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building the configuration snapshot
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A setting was present but malformed. `field` is the env variable name.
    #[error("Invalid value for {field}: {reason}")]
    Validation { field: String, reason: String },

    /// The env file exists but could not be read or parsed
    #[error("Failed to read env file {path:?}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
}

/// Result type alias for configuration loading
pub type Result<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    /// Create a validation error for a named field
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an env file error
    pub fn env_file(path: impl Into<PathBuf>, source: dotenvy::Error) -> Self {
        Self::EnvFile {
            path: path.into(),
            source,
        }
    }

    /// Name of the offending field, if this is a validation failure
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            Self::EnvFile { .. } => None,
        }
    }
}
