//! Error types for daemon execution

use kiln_ipc::{FailureDescriptor, IpcError, WorkerError};
use std::time::Duration;
use thiserror::Error;

/// Daemon execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// No worker could be started or handshaken for the request
    #[error("Failed to provision worker: {message}")]
    Provisioning { message: String },

    /// The compiler ran inside the worker and failed
    #[error("{display_name} failed: {cause}")]
    WorkFailed {
        display_name: String,
        #[source]
        cause: FailureDescriptor,
    },

    /// The worker could not be reached or the pipe broke mid-call
    #[error("Worker {worker_id} unreachable: {source}")]
    Transport {
        worker_id: String,
        #[source]
        source: IpcError,
    },

    #[error("Worker {worker_id} did not respond within {timeout:?}")]
    Timeout { worker_id: String, timeout: Duration },

    /// The worker rejected the request at the protocol level
    #[error("Worker {worker_id} reported an error: {error}")]
    Worker { worker_id: String, error: WorkerError },

    #[error("Unexpected response from worker {worker_id}: {message}")]
    UnexpectedResponse { worker_id: String, message: String },

    #[error("Invalid compile spec: {0}")]
    InvalidSpec(String),

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl ExecutionError {
    /// Whether the worker, rather than the work, is what failed
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ExecutionError::Transport { .. } | ExecutionError::Timeout { .. }
        )
    }

    /// The failure raised by the compiler, if this error wraps one
    pub fn failure(&self) -> Option<&FailureDescriptor> {
        match self {
            ExecutionError::WorkFailed { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

// Convert from config errors
impl From<kiln_config::ConfigError> for ExecutionError {
    fn from(err: kiln_config::ConfigError) -> Self {
        Self::ConfigurationError(err.to_string())
    }
}
