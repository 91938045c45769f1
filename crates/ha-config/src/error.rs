//! Errors raised while loading `configuration.yaml` and its includes

use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur while loading or interpreting the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A YAML file could not be read
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A YAML file is not valid YAML
    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `!secret` named a key missing from `secrets.yaml`
    #[error("secret '{key}' not found in secrets.yaml")]
    SecretNotFound { key: String },

    /// Directory given to one of the `!include_dir_*` tags does not exist
    #[error("directory not found: {path}")]
    DirectoryNotFound { path: PathBuf },

    /// A file includes itself, directly or through other files
    #[error("circular include detected: {path}")]
    CircularInclude { path: PathBuf },

    /// `!env_var` without a default named an unset variable
    #[error("environment variable '{var}' not set")]
    EnvVarNotFound { var: String },

    /// A section or option has the wrong shape or value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}
