//! IPC transport implementations
//!
//! Every message travels as one JSON-encoded [`MessageEnvelope`] per line.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// IPC transport trait for different communication mechanisms
#[async_trait]
pub trait IpcTransport: Send {
    /// Send a message to the other end
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError>;

    /// Receive a message from the other end
    async fn receive<T: for<'de> Deserialize<'de> + Send>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), IpcError>;
}

/// Newline-delimited JSON transport over any async byte stream pair
pub struct JsonLinesTransport<R, W> {
    reader: Option<BufReader<R>>,
    writer: Option<W>,
}

/// Transport used by a worker process to talk to its coordinator
pub type StdioTransport = JsonLinesTransport<tokio::io::Stdin, tokio::io::Stdout>;

/// Transport used by the coordinator to talk to a spawned child process
pub type ChildProcessTransport =
    JsonLinesTransport<tokio::process::ChildStdout, tokio::process::ChildStdin>;

/// Type-erased transport, so workers backed by different pipes share one type
pub type BoxedTransport = JsonLinesTransport<
    Box<dyn AsyncRead + Send + Unpin>,
    Box<dyn AsyncWrite + Send + Unpin>,
>;

impl<R, W> JsonLinesTransport<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// Create a transport reading from `reader` and writing to `writer`
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Some(BufReader::new(reader)),
            writer: Some(writer),
        }
    }

    /// Erase the stream types
    pub fn boxed(self) -> BoxedTransport {
        JsonLinesTransport {
            reader: self.reader.map(|reader| {
                BufReader::new(Box::new(reader.into_inner()) as Box<dyn AsyncRead + Send + Unpin>)
            }),
            writer: self
                .writer
                .map(|writer| Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>),
        }
    }
}

impl StdioTransport {
    /// Create a transport over this process's stdin/stdout
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl ChildProcessTransport {
    /// Create a transport over the pipes of a spawned child
    pub fn for_child(stdin: tokio::process::ChildStdin, stdout: tokio::process::ChildStdout) -> Self {
        Self::new(stdout, stdin)
    }
}

#[async_trait]
impl<R, W> IpcTransport for JsonLinesTransport<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError> {
        let writer = self.writer.as_mut().ok_or(IpcError::NotConnected)?;

        let json = serde_json::to_string(message).map_err(|e| IpcError::Encode(e.to_string()))?;

        // Send with newline delimiter
        let message_with_newline = format!("{}\n", json);
        writer.write_all(message_with_newline.as_bytes()).await?;
        writer.flush().await?;

        trace!(bytes = message_with_newline.len(), "Sent IPC message");
        Ok(())
    }

    async fn receive<T: for<'de> Deserialize<'de> + Send>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError> {
        let reader = self.reader.as_mut().ok_or(IpcError::NotConnected)?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).await?;

            if read == 0 {
                return Err(IpcError::ConnectionClosed);
            }

            if !line.trim().is_empty() {
                break;
            }
        }

        // Check the version before interpreting the payload, so a peer on another
        // protocol version reports a mismatch rather than a parse error
        let envelope: MessageEnvelope<JsonValue> =
            serde_json::from_str(line.trim()).map_err(|e| IpcError::Decode(e.to_string()))?;

        if envelope.protocol_version != IPC_PROTOCOL_VERSION {
            return Err(IpcError::ProtocolVersionMismatch {
                expected: IPC_PROTOCOL_VERSION,
                actual: envelope.protocol_version,
            });
        }

        let message = serde_json::from_value(envelope.message).map_err(|e| IpcError::Decode(e.to_string()))?;

        Ok(MessageEnvelope {
            protocol_version: envelope.protocol_version,
            timestamp: envelope.timestamp,
            message,
        })
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        // Dropping the writer closes our end of the pipe, which the peer sees as EOF
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        self.reader.take();
        Ok(())
    }
}
