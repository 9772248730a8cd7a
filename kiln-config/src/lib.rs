//! Domain-driven configuration management for Kiln
//!
//! Configuration is split by functional domain (worker pool, logging), each
//! with its own defaults and validation, and can be loaded from YAML with
//! `KILN_*` environment variable overrides.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    workers::{IsolationMode, WorkerPoolConfig},
    KilnConfig,
};

// Re-export utilities
pub use domains::utils::{serde_duration, serde_duration_option};
