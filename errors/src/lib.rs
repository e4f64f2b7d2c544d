//! # Configuration Errors
//!
//! Error taxonomy for the layered configuration loader.
//!
//! - [`ConfigFileError`] describes why a single YAML file could not be used.
//! - [`ConfigError`] is returned from the loader's public entry points and
//!   names the stage that failed.
//!
//! Soft failures (an optional overlay that does not parse) and reload
//! failures are never returned; they are logged by the loader.

use thiserror::Error;

/// Failure to read or parse a single configuration file.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML in {path}: {reason}")]
    YamlParse { path: String, reason: String },

    #[error("Top-level YAML document in {path} is not a mapping")]
    NotAMapping { path: String },
}

impl ConfigFileError {
    /// Path of the file this error refers to.
    pub fn path(&self) -> &str {
        match self {
            Self::NotFound { path }
            | Self::Io { path, .. }
            | Self::YamlParse { path, .. }
            | Self::NotAMapping { path } => path,
        }
    }
}

/// Fatal-to-load errors returned by the loader.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration name: {name:?}")]
    InvalidName { name: String },

    #[error("Failed to read configuration file for {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: ConfigFileError,
    },

    #[error("Failed to parse configuration {name}: {reason}")]
    Parse { name: String, reason: String },

    #[error("Configuration {name} failed validation: {reason}")]
    Validation { name: String, reason: String },
}

impl ConfigError {
    /// Name of the configuration the error belongs to.
    pub fn name(&self) -> &str {
        match self {
            Self::InvalidName { name }
            | Self::Read { name, .. }
            | Self::Parse { name, .. }
            | Self::Validation { name, .. } => name,
        }
    }
}
