//! Error types for the external tool connection.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for transport-level operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for verb calls.
pub type CallResult<T> = Result<T, CallError>;

/// Errors raised while talking to the tool process over stdio.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to spawn the tool process.
    #[error("failed to spawn tool process: {0}")]
    SpawnFailed(#[source] io::Error),

    /// Failed to write to the tool's stdin.
    #[error("failed to write to tool: {0}")]
    WriteFailed(#[source] io::Error),

    /// Failed to read from the tool's stdout.
    #[error("failed to read from tool: {0}")]
    ReadFailed(#[source] io::Error),

    /// Failed to serialize a request to JSON.
    #[error("failed to serialize request: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// Failed to deserialize a result from JSON.
    #[error("failed to deserialize response: {0}")]
    DeserializeFailed(#[source] serde_json::Error),

    /// The tool process closed its stdout.
    #[error("tool process exited unexpectedly")]
    ProcessExited,

    /// Response channel was closed (internal error).
    #[error("response channel closed unexpectedly")]
    ChannelClosed,

    /// The tool answered with a JSON-RPC error object.
    #[error("{message} (code: {code})")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message from the tool.
        message: String,
    },
}

impl TransportError {
    /// Create an RPC error from an error object.
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Check if this error means the tool process is gone.
    pub fn is_process_exited(&self) -> bool {
        matches!(
            self,
            Self::ProcessExited | Self::ChannelClosed | Self::WriteFailed(_) | Self::ReadFailed(_)
        )
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for TransportError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}

/// Errors from a connect attempt.
///
/// Cloneable because every caller that joined the same attempt receives
/// the same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The handshake did not complete before the deadline.
    #[error("handshake with the semantic-layer tool timed out after {0} seconds")]
    Timeout(u64),

    /// The process could not be started or rejected the handshake.
    #[error("failed to connect to the semantic-layer tool: {0}")]
    Failed(String),
}

impl ConnectError {
    /// Build a timeout error from the configured deadline.
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout(after.as_secs())
    }

    /// Wrap any displayable failure.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<TransportError> for ConnectError {
    fn from(err: TransportError) -> Self {
        Self::failed(err)
    }
}

/// Errors from forwarding a verb.
#[derive(Error, Debug)]
pub enum CallError {
    /// A call was attempted while the connection was not ready.
    #[error("not connected to the semantic-layer tool")]
    NotConnected,

    /// The tool reported an error for this verb.
    #[error("{verb} failed: {message}")]
    Failed {
        /// Verb name as sent to the tool.
        verb: String,
        /// Error message, unchanged.
        message: String,
    },

    /// The transport broke while the call was in flight.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CallError {
    /// Create a tool-reported failure.
    pub fn failed(verb: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            verb: verb.into(),
            message: message.into(),
        }
    }

    /// Whether the underlying connection should be considered dead.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_process_exited())
    }
}

/// Any error raised by the client, for call sites that do both.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Call(#[from] CallError),
}
