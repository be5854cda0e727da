//! Error types for plan loading and validation.

use std::path::PathBuf;

use thiserror::Error;

use crate::validation::ValidationErrors;

/// Result type alias using [`ConfigError`] as the error type.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading or validating a deployment plan.
///
/// Every variant is a configuration error: it is raised before any
/// server is touched and aborts the run.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The plan file could not be read.
    #[error("failed to read plan file {path}: {source}")]
    Io {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The plan file could not be parsed.
    #[error("failed to parse plan file {path}: {reason}")]
    Parse {
        /// Path of the plan file.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// The plan file extension is not one of `json`, `yaml`, `yml`.
    #[error("unsupported plan file format: {path}")]
    UnsupportedFormat {
        /// Path of the plan file.
        path: PathBuf,
    },

    /// No plan file exists for the environment.
    #[error("no plan file found for environment '{environment}' in {dir}")]
    PlanNotFound {
        /// Environment name.
        environment: String,
        /// Directory that was searched.
        dir: PathBuf,
    },

    /// The plan failed validation.
    #[error("invalid deployment plan: {0}")]
    Invalid(#[from] ValidationErrors),
}
