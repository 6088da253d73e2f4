//! A live `rmcp` client session shared by both transports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rmcp::model::{
    CallToolRequest, CallToolRequestMethod, CallToolRequestParams, ClientCapabilities,
    ClientInfo, ClientRequest, Extensions, PingRequest, PingRequestMethod, ServerResult,
};
use rmcp::service::{Peer, PeerRequestOptions, RunningService};
use rmcp::{ClientHandler, RoleClient};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{CallToolResult, Tool};

/// Default timeout for protocol requests other than tool calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum output size (1MB).
/// Sized for large tool outputs (file reads, search results).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

pub(crate) type Service = RunningService<RoleClient, StewardClient>;

/// Client identity announced during the initialize handshake.
#[derive(Debug, Clone)]
pub(crate) struct StewardClient {
    info: ClientInfo,
}

impl Default for StewardClient {
    fn default() -> Self {
        let mut info = ClientInfo::default();
        info.client_info.name = "steward".into();
        info.client_info.version = env!("CARGO_PKG_VERSION").into();
        info.capabilities = ClientCapabilities::default();
        Self { info }
    }
}

impl ClientHandler for StewardClient {
    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }
}

/// Holds the running service for one server and routes requests to it.
///
/// Requests clone the peer out of the slot, so concurrent calls never wait
/// on each other.
#[derive(Default)]
pub(crate) struct Session {
    service: Mutex<Option<Service>>,
    connected: AtomicBool,
}

impl Session {
    pub(crate) fn install(&self, name: &str, service: Service) {
        if let Some(info) = service.peer_info() {
            debug!(
                server = %name,
                remote = %info.server_info.name,
                version = %info.server_info.version,
                "session established"
            );
        }
        *self.service.lock() = Some(service);
        self.connected.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Cancel the running service. Idempotent.
    pub(crate) async fn close(&self, name: &str) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let service = self.service.lock().take();
        if let Some(service) = service {
            service
                .cancel()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            debug!(server = %name, "session closed");
        }
        Ok(())
    }

    fn peer(&self) -> Result<Peer<RoleClient>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.service
            .lock()
            .as_ref()
            .map(|service| service.peer().clone())
            .ok_or(Error::NotConnected)
    }

    /// Mark the session dead when the transport reports it is gone.
    fn observe<T>(&self, outcome: Result<T>) -> Result<T> {
        if let Err(e) = &outcome {
            if e.is_disconnect() {
                self.connected.store(false, Ordering::SeqCst);
            }
        }
        outcome
    }

    async fn request(
        &self,
        request: ClientRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ServerResult> {
        let peer = self.peer()?;
        let exchange = async {
            let options = PeerRequestOptions {
                timeout: Some(timeout),
                meta: None,
            };
            let handle = peer.send_cancellable_request(request, options).await?;
            Ok::<_, Error>(handle.await_response().await?)
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            response = exchange => response,
        };
        self.observe(outcome)
    }

    pub(crate) async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<Tool>> {
        let peer = self.peer()?;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            listed = tokio::time::timeout(DEFAULT_TIMEOUT, peer.list_all_tools()) => match listed {
                Err(_) => Err(Error::Timeout),
                Ok(tools) => tools.map_err(Error::from),
            },
        };
        let tools = self.observe(outcome)?;
        Ok(tools.into_iter().map(Tool::from).collect())
    }

    pub(crate) async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult> {
        let arguments = match arguments {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(Error::InvalidArguments(format!(
                    "expected a JSON object, got {other}"
                )));
            }
        };
        let request = ClientRequest::CallToolRequest(CallToolRequest {
            method: CallToolRequestMethod,
            params: CallToolRequestParams {
                name: name.to_string().into(),
                arguments,
                meta: None,
                task: None,
            },
            extensions: Extensions::default(),
        });

        let result = match self.request(request, timeout, cancel).await? {
            ServerResult::CallToolResult(result) => CallToolResult::from(result),
            other => {
                return Err(Error::InvalidResponse(format!(
                    "unexpected response to tools/call: {other:?}"
                )));
            }
        };

        let size = result.payload_len();
        if size > MAX_OUTPUT_SIZE {
            return Err(Error::OutputTooLarge {
                size,
                max: MAX_OUTPUT_SIZE,
            });
        }
        if result.is_error {
            return Err(Error::ToolCallFailed(result.joined_text()));
        }
        Ok(result)
    }

    pub(crate) async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        let request = ClientRequest::PingRequest(PingRequest {
            method: PingRequestMethod,
            extensions: Extensions::default(),
        });
        self.request(request, DEFAULT_TIMEOUT, cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requests_without_service_are_not_connected() {
        let session = Session::default();
        assert!(!session.is_connected());
        let err = session
            .ping(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        session.close("idle").await.unwrap();
    }

    #[tokio::test]
    async fn non_object_arguments_are_rejected_before_sending() {
        let session = Session::default();
        session.connected.store(true, Ordering::SeqCst);
        let err = session
            .call_tool(
                "echo",
                Some(Value::from(3)),
                DEFAULT_TIMEOUT,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_arguments");
    }

    #[test]
    fn client_announces_itself() {
        let info = StewardClient::default().get_info();
        assert_eq!(info.client_info.name, "steward");
    }
}
