//! Inter-process communication for Kiln daemon workers
//!
//! This crate defines the messages exchanged between the coordinator (the
//! process driving a build) and its worker processes, together with the
//! newline-delimited JSON transport that carries them over pipes.

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    CoordinatorMessage, FailureDescriptor, MessageEnvelope, WorkItem, WorkResult, WorkerError,
    WorkerMessage, WorkerProtocol, WorkerStatus, IPC_PROTOCOL_VERSION,
};
pub use transport::{BoxedTransport, ChildProcessTransport, IpcTransport, JsonLinesTransport, StdioTransport};
