//! Errors raised while moving envelopes over a worker pipe

use crate::protocol::WorkerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    /// A message could not be turned into a line
    #[error("Failed to encode message: {0}")]
    Encode(String),

    /// A line could not be read as the expected message
    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Pipe I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed its end of the pipe
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    /// The transport was already closed on this side
    #[error("Transport not connected")]
    NotConnected,
}

impl IpcError {
    /// Whether the pipe is unusable, so nothing more can travel over it
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            IpcError::Io(_) | IpcError::ConnectionClosed | IpcError::NotConnected
        )
    }

    /// The protocol error a worker answers with when it cannot accept a
    /// request line. `None` when the pipe itself failed.
    pub fn rejection(&self) -> Option<WorkerError> {
        match self {
            IpcError::ProtocolVersionMismatch { expected, actual } => Some(WorkerError::ProtocolVersionMismatch {
                expected: *expected,
                actual: *actual,
            }),
            IpcError::Decode(error) => Some(WorkerError::MessageParseError { error: error.clone() }),
            _ => None,
        }
    }
}
