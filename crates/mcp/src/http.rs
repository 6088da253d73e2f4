//! Event-stream transport: `rmcp`'s streamable HTTP client, which POSTs
//! JSON-RPC and reads either a JSON body or a `text/event-stream` reply.

use std::time::Duration;

use async_trait::async_trait;
use rmcp::ServiceExt;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::ToolServer;
use crate::error::{Error, Result};
use crate::protocol::{CallToolResult, Tool};
use crate::session::{Session, StewardClient};

/// Configuration for an event-stream tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub name: String,
    pub url: String,
    /// Sent as a bearer token on every request.
    pub auth_token: Option<String>,
}

/// Tool server reached over HTTP.
pub struct HttpServer {
    config: HttpConfig,
    session: Session,
}

impl HttpServer {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            session: Session::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn transport_config(&self) -> StreamableHttpClientTransportConfig {
        let mut config = StreamableHttpClientTransportConfig::with_uri(self.config.url.as_str());
        config.auth_header = self.config.auth_token.clone();
        config
    }
}

#[async_trait]
impl ToolServer for HttpServer {
    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if let Err(e) = self.session.close(&self.config.name).await {
            debug!(server = %self.config.name, error = %e, "stale session did not shut down cleanly");
        }

        let transport = StreamableHttpClientTransport::from_config(self.transport_config());
        let service = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            served = StewardClient::default().serve(transport) => {
                served.map_err(|e| Error::Unreachable(e.to_string()))?
            }
        };

        info!(server = %self.config.name, url = %self.config.url, "event-stream server initialized");
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
