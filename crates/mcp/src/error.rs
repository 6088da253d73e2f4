//! MCP error types.

use std::io::ErrorKind;

use rmcp::service::ServiceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("initialize handshake failed: {0}")]
    Handshake(String),

    #[error("server not connected")]
    NotConnected,

    #[error("server exited unexpectedly")]
    ServerExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("failed to send request: {0}")]
    Transport(String),

    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("server error [{code}]: {message}")]
    Rpc { code: i32, message: String },

    #[error("tool call failed: {0}")]
    ToolCallFailed(String),

    #[error("output too large: {size} bytes (max {max})")]
    OutputTooLarge { size: usize, max: usize },

    #[error("HTTP endpoint unreachable: {0}")]
    Unreachable(String),
}

impl Error {
    /// Stable machine-readable code for this error.
    ///
    /// Retry policies match against these strings, so they must not change
    /// between releases.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Spawn { source, .. } => match source.kind() {
                ErrorKind::NotFound => "spawn_not_found",
                ErrorKind::PermissionDenied => "spawn_denied",
                _ => "spawn_failed",
            },
            Error::Io(e) => io_code(e.kind()),
            Error::Handshake(_) => "handshake_failed",
            Error::NotConnected => "not_connected",
            Error::ServerExited => "server_exited",
            Error::Timeout => "timeout",
            Error::Cancelled => "cancelled",
            Error::Transport(_) => "broken_pipe",
            Error::InvalidArguments(_) => "invalid_arguments",
            Error::InvalidResponse(_) => "invalid_response",
            Error::Rpc { .. } => "jsonrpc",
            Error::ToolCallFailed(_) => "tool_failed",
            Error::OutputTooLarge { .. } => "output_too_large",
            Error::Unreachable(_) => "http_unavailable",
        }
    }

    /// Whether the error means the underlying transport is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::ServerExited | Error::Transport(_) | Error::NotConnected
        )
    }
}

fn io_code(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::ConnectionRefused => "connection_refused",
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => "connection_reset",
        ErrorKind::BrokenPipe => "broken_pipe",
        ErrorKind::TimedOut => "timeout",
        ErrorKind::UnexpectedEof => "server_exited",
        _ => "io",
    }
}

impl From<ServiceError> for Error {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::McpError(data) => Error::Rpc {
                code: data.code.0,
                message: data.message.to_string(),
            },
            ServiceError::TransportClosed => Error::ServerExited,
            ServiceError::Timeout { .. } => Error::Timeout,
            ServiceError::Cancelled { .. } => Error::Cancelled,
            ServiceError::UnexpectedResponse => {
                Error::InvalidResponse("unexpected response type".to_string())
            }
            other => Error::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
