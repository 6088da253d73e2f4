use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::document::DocumentError;
use crate::llm::ModelError;

/// A failed connection attempt, classified by a stable code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("[{code}] {message}")]
pub struct ConnectionError {
    pub code: String,
    pub message: String,
}

impl ConnectionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<mcp::Error> for ConnectionError {
    fn from(e: mcp::Error) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

/// Errors from server lifecycle operations.
///
/// Connection failures never reach tool-execution callers; these are only
/// returned to whoever drives the manager directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ManagerError {
    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("server {0} already configured")]
    DuplicateServer(String),

    #[error("server {0} is disabled in configuration")]
    Disabled(String),

    #[error("server {0} was auto-disabled after repeated failures; re-enable it first")]
    AutoDisabled(String),

    #[error("server {server_id} failed to connect: {source}")]
    Connection {
        server_id: String,
        #[source]
        source: ConnectionError,
    },

    #[error("connection manager is shut down")]
    ShutDown,
}

/// Typed rejection of a tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    #[error("tool execution is stopped")]
    Stopped,

    #[error("request {0} is already executing")]
    DuplicateRequest(String),

    #[error("concurrency limit reached ({active}/{limit} executions in flight)")]
    ConcurrencyLimit { active: usize, limit: usize },

    #[error("session limit reached for {document} ({current}/{limit} tool calls)")]
    SessionLimit {
        document: String,
        limit: u32,
        current: u32,
    },

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("tool {tool} timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("execution cancelled")]
    Cancelled,

    #[error("tool {tool} failed: {message}")]
    ToolFailed { tool: String, message: String },
}

impl ExecutionError {
    /// Whether the caller may reasonably retry the same request.
    ///
    /// Only backpressure is retryable; every other rejection is terminal or
    /// needs a user decision.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyLimit { .. })
    }
}

/// Errors that end an autonomous tool-calling run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinatorError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("generation cancelled")]
    Cancelled,

    #[error("generation timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("round limit of {0} reached")]
    RoundLimit(usize),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

pub type Result<T> = std::result::Result<T, Error>;
