//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Request protocols a worker process can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum WorkerProtocol {
    /// Runs compiler work items through the daemon protocol handler
    CompilerDaemon,
}

impl fmt::Display for WorkerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerProtocol::CompilerDaemon => write!(f, "compiler_daemon"),
        }
    }
}

/// Serializable description of a failure raised inside a worker.
///
/// Errors cannot cross a process boundary by reference, so the worker flattens
/// them into a chain of descriptors. The chain is exposed again through
/// [`std::error::Error::source`] on the coordinator side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDescriptor {
    pub type_tag: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<FailureDescriptor>>,
}

impl FailureDescriptor {
    /// Create a descriptor without a cause
    pub fn new(type_tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attach a nested cause
    pub fn with_cause(mut self, cause: FailureDescriptor) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Describe an error and its whole `source()` chain.
    ///
    /// The outermost descriptor is tagged with the short type name of `E`.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let mut descriptor = Self::new(short_type_name(std::any::type_name::<E>()), error.to_string());
        descriptor.cause = error.source().map(|source| Box::new(Self::from_dyn_error(source)));
        descriptor
    }

    /// Describe a panic payload caught with `catch_unwind`
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "panic with a non-string payload".to_string()
        };
        Self::new("panic", message)
    }

    /// Describe a type-erased error and its `source()` chain.
    ///
    /// Only descriptors and I/O errors keep a precise type tag; anything else
    /// is tagged `error`.
    pub fn from_dyn_error(error: &(dyn std::error::Error + 'static)) -> Self {
        if let Some(descriptor) = error.downcast_ref::<FailureDescriptor>() {
            return descriptor.clone();
        }

        let type_tag = match error.downcast_ref::<std::io::Error>() {
            Some(io) => format!("io::{:?}", io.kind()),
            None => "error".to_string(),
        };

        let mut descriptor = Self::new(type_tag, error.to_string());
        descriptor.cause = error.source().map(|source| Box::new(Self::from_dyn_error(source)));
        descriptor
    }

    /// Innermost descriptor of the chain
    pub fn root_cause(&self) -> &FailureDescriptor {
        let mut current = self;
        while let Some(cause) = current.cause.as_deref() {
            current = cause;
        }
        current
    }
}

impl fmt::Display for FailureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_tag, self.message)
    }
}

impl std::error::Error for FailureDescriptor {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

fn short_type_name(full: &str) -> &str {
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics.rsplit("::").next().unwrap_or(without_generics)
}

/// Outcome of one executed work item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResult {
    pub did_work: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDescriptor>,
}

impl WorkResult {
    /// Create a successful result
    pub fn success(did_work: bool) -> Self {
        Self {
            did_work,
            failure: None,
        }
    }

    /// Create a failed result. Failed work is reported as having done work,
    /// since outputs may have been partially written.
    pub fn failed(failure: FailureDescriptor) -> Self {
        Self {
            did_work: true,
            failure: Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// A unit of work sent to a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Name used in diagnostics
    pub display_name: String,
    /// Compiler to resolve in the worker's registry
    pub compiler: String,
    /// Compiler-specific specification, opaque to the protocol
    pub spec: JsonValue,
    /// Process directory required while the compiler runs
    pub execution_working_dir: PathBuf,
    /// Process directory the worker is parked at between items
    pub idle_working_dir: PathBuf,
}

impl WorkItem {
    /// Create a work item whose display name is the compiler name
    pub fn new(
        compiler: impl Into<String>,
        spec: JsonValue,
        execution_working_dir: impl Into<PathBuf>,
        idle_working_dir: impl Into<PathBuf>,
    ) -> Self {
        let compiler = compiler.into();
        Self {
            display_name: compiler.clone(),
            compiler,
            spec,
            execution_working_dir: execution_working_dir.into(),
            idle_working_dir: idle_working_dir.into(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }
}

/// Messages sent from coordinator to worker processes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Execute a work item under the given protocol
    Execute {
        correlation_id: Uuid,
        protocol: WorkerProtocol,
        item: WorkItem,
    },

    /// Health check ping
    Ping { correlation_id: Uuid },

    /// Shutdown signal
    Shutdown,
}

/// Messages sent from worker processes to coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    /// Worker ready for work
    Ready {
        worker_id: String,
        pid: u32,
        protocols: Vec<WorkerProtocol>,
    },

    /// Outcome of an `Execute` request
    WorkResult {
        correlation_id: Uuid,
        result: WorkResult,
    },

    /// Health check response
    Pong {
        correlation_id: Uuid,
        worker_id: String,
        status: WorkerStatus,
    },

    /// Worker error
    Error {
        correlation_id: Option<Uuid>,
        error: WorkerError,
    },
}

/// Worker status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub items_executed: u64,
    pub items_failed: u64,
    /// Process directory at the time of the report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_dir: Option<PathBuf>,
}

impl WorkerStatus {
    /// Create a new worker status
    pub fn new(worker_id: String, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            pid,
            started_at: now,
            last_activity: now,
            items_executed: 0,
            items_failed: 0,
            process_dir: None,
        }
    }

    /// Update activity timestamp
    pub fn update_activity(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Record a work item execution
    pub fn record_execution(&mut self, success: bool) {
        self.items_executed += 1;
        if !success {
            self.items_failed += 1;
        }
        self.update_activity();
    }
}

/// Protocol-level errors reported by a worker.
///
/// Failures of the work itself never use this type; they travel inside a
/// failed [`WorkResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum WorkerError {
    /// The worker does not serve the requested protocol
    UnsupportedProtocol { protocol: WorkerProtocol },

    /// A request line could not be parsed
    MessageParseError { error: String },

    /// The request envelope carried another protocol version
    ProtocolVersionMismatch { expected: u32, actual: u32 },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::UnsupportedProtocol { protocol } => {
                write!(f, "Unsupported worker protocol: {}", protocol)
            }
            WorkerError::MessageParseError { error } => {
                write!(f, "Message parse error: {}", error)
            }
            WorkerError::ProtocolVersionMismatch { expected, actual } => {
                write!(f, "Protocol version mismatch: expected {}, got {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for WorkerError {}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}
