//! Transport-agnostic tool server client.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::{CallToolResult, Tool};

/// A connection to one tool server.
///
/// Implementations own their I/O. Every suspending call takes a
/// cancellation token and must return [`Error::Cancelled`] promptly once it
/// fires.
///
/// [`Error::Cancelled`]: crate::Error::Cancelled
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Establish the connection and complete the initialize handshake.
    ///
    /// Connecting an already connected server is a no-op.
    async fn connect(&self, cancel: &CancellationToken) -> Result<()>;

    /// Tear the connection down. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the transport currently believes it is connected.
    fn is_connected(&self) -> bool;

    /// List every tool the server exposes, following pagination.
    async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<Tool>>;

    /// Invoke a tool, failing with [`Error::Timeout`] after `timeout`.
    ///
    /// [`Error::Timeout`]: crate::Error::Timeout
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult>;

    /// Liveness probe.
    async fn ping(&self, cancel: &CancellationToken) -> Result<()>;
}
