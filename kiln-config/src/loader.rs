//! Configuration loading and environment variable handling

use crate::domains::utils::parse_duration;
use crate::domains::KilnConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "KILN".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<KilnConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: KilnConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<KilnConfig> {
        let mut config = KilnConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<KilnConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut KilnConfig) -> ConfigResult<()> {
        self.apply_worker_overrides(&mut config.workers)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply worker pool config overrides
    fn apply_worker_overrides(
        &self,
        config: &mut crate::domains::workers::WorkerPoolConfig,
    ) -> ConfigResult<()> {
        if let Ok(max_workers) = self.get_env_var("MAX_WORKERS") {
            config.max_workers = max_workers
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid MAX_WORKERS: {}", e)))?;
        }

        if let Some(timeout) = self.get_env_seconds("IDLE_TIMEOUT_SECONDS")? {
            config.idle_timeout = timeout;
        }

        if let Some(timeout) = self.get_env_seconds("STARTUP_TIMEOUT_SECONDS")? {
            config.startup_timeout = timeout;
        }

        if let Some(timeout) = self.get_env_seconds("CALL_TIMEOUT_SECONDS")? {
            config.call_timeout = Some(timeout);
        }

        if let Ok(program) = self.get_env_var("WORKER_PROGRAM") {
            config.worker_program = Some(PathBuf::from(program));
        }

        if let Ok(isolation) = self.get_env_var("ISOLATION") {
            config.isolation = crate::domains::workers::IsolationMode::from_str(&isolation)
                .map_err(|e| ConfigError::EnvError(format!("Invalid ISOLATION: {}", e)))?;
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = crate::domains::logging::LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    fn get_env_seconds(&self, name: &str) -> ConfigResult<Option<Duration>> {
        match self.get_env_var(name) {
            Ok(value) => {
                let timeout = parse_duration(&value)
                    .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e)))?;
                Ok(Some(timeout))
            }
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
