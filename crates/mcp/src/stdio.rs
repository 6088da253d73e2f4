//! Stdio transport: a child process driven through `rmcp`'s
//! [`TokioChildProcess`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::ServiceExt;
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::ToolServer;
use crate::error::{Error, Result};
use crate::protocol::{CallToolResult, Tool};
use crate::session::{Session, StewardClient};

/// Configuration for a stdio tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Tool server reached through a child process's stdin/stdout.
pub struct StdioServer {
    config: ServerConfig,
    session: Session,
}

impl StdioServer {
    /// Create an unconnected server handle.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            session: Session::default(),
        }
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn spawn(&self) -> Result<TokioChildProcess> {
        let config = &self.config;
        let command = Command::new(&config.command).configure(|cmd| {
            cmd.args(&config.args).envs(&config.env);
            if let Some(dir) = &config.cwd {
                cmd.current_dir(dir);
            }
        });
        TokioChildProcess::new(command).map_err(|source| Error::Spawn {
            command: config.command.clone(),
            source,
        })
    }
}

#[async_trait]
impl ToolServer for StdioServer {
    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        // A dead process from an earlier session is reaped first.
        if let Err(e) = self.session.close(&self.config.name).await {
            debug!(server = %self.config.name, error = %e, "stale session did not shut down cleanly");
        }

        let transport = self.spawn()?;
        let service = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            served = StewardClient::default().serve(transport) => {
                served.map_err(|e| Error::Handshake(e.to_string()))?
            }
        };

        info!(server = %self.config.name, command = %self.config.command, "stdio server initialized");
        self.session.install(&self.config.name, service);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.session.close(&self.config.name).await
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<Tool>> {
        self.session.list_tools(cancel).await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult> {
        self.session.call_tool(name, arguments, timeout, cancel).await
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.session.ping(cancel).await
    }
}
