//! Daemon worker pool configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How worker execution contexts are isolated from the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Each worker is a separate operating system process
    #[default]
    Process,
    /// Each worker is a task inside the coordinator with a virtual process directory
    InProcess,
}

impl FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "process" => Ok(IsolationMode::Process),
            "in_process" => Ok(IsolationMode::InProcess),
            _ => Err(format!("Invalid isolation mode: {}", s)),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Maximum number of live workers, busy or idle
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Idle workers older than this are retired
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_idle_timeout")]
    pub idle_timeout: Duration,

    /// How long a new worker may take to report ready
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_startup_timeout")]
    pub startup_timeout: Duration,

    /// Deadline for one boundary call; unbounded when absent
    #[serde(
        with = "crate::domains::utils::serde_duration_option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub call_timeout: Option<Duration>,

    /// How often the reaper looks for expired idle workers
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_reaper_interval")]
    pub reaper_interval: Duration,

    /// Executable launched for process workers; the current executable when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,

    #[serde(default)]
    pub isolation: IsolationMode,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            idle_timeout: default_idle_timeout(),
            startup_timeout: default_startup_timeout(),
            call_timeout: None,
            reaper_interval: default_reaper_interval(),
            worker_program: None,
            isolation: IsolationMode::default(),
        }
    }
}

impl Validatable for WorkerPoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.max_workers, "max_workers", self.domain_name())?;
        validate_positive(self.idle_timeout.as_secs(), "idle_timeout", self.domain_name())?;
        validate_positive(self.startup_timeout.as_secs(), "startup_timeout", self.domain_name())?;
        validate_positive(self.reaper_interval.as_secs(), "reaper_interval", self.domain_name())?;

        if let Some(timeout) = self.call_timeout {
            validate_positive(timeout.as_secs(), "call_timeout", self.domain_name())?;
        }

        if let Some(ref program) = self.worker_program {
            if program.as_os_str().is_empty() {
                return Err(self.validation_error("worker_program cannot be empty"));
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "workers"
    }
}

// Default value functions
fn default_max_workers() -> usize {
    num_cpus::get()
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(3600) // 1 hour
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(60)
}
