//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A `KILN_*` override could not be applied
    #[error("Environment variable error: {0}")]
    EnvError(String),

    /// A section parsed but holds unusable values
    #[error("Domain configuration error in {domain}: {message}")]
    DomainError { domain: String, message: String },
}
