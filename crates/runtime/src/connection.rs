//! One supervised tool-server connection.
//!
//! [`ServerConnection`] owns the transport and the connection state machine.
//! It never retries on its own; the manager decides what happens after a
//! failure and serializes lifecycle calls per server.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mcp::{CallToolResult, HttpConfig, HttpServer, ServerConfig, StdioServer, Tool, ToolServer};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ServerDescriptor, TransportConfig};
use crate::error::ConnectionError;

const TRANSITION_LOG: usize = 32;

/// Connection state of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// Connected is only reachable from Connecting, and every state may
    /// return to Disconnected on an explicit stop.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Error)
                | (Error, Connecting)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Error, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: DateTime<Utc>,
}

/// Creates transports for server descriptors.
pub trait ServerFactory: Send + Sync {
    fn create(&self, descriptor: &ServerDescriptor) -> Box<dyn ToolServer>;
}

/// Builds the real stdio and event-stream transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportFactory;

impl ServerFactory for TransportFactory {
    fn create(&self, descriptor: &ServerDescriptor) -> Box<dyn ToolServer> {
        let name = descriptor.display_name().to_string();
        match &descriptor.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => Box::new(StdioServer::new(ServerConfig {
                name,
                command: command.clone(),
                args: args.clone(),
                env: env.clone(),
                cwd: cwd.clone(),
            })),
            TransportConfig::EventStream { url, auth_token } => Box::new(HttpServer::new(HttpConfig {
                name,
                url: url.clone(),
                auth_token: auth_token.clone(),
            })),
        }
    }
}

pub struct ServerConnection {
    id: String,
    name: String,
    server: Box<dyn ToolServer>,
    state: watch::Sender<ConnectionState>,
    transitions: Mutex<VecDeque<Transition>>,
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    pub fn new(id: impl Into<String>, name: impl Into<String>, server: Box<dyn ToolServer>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            id: id.into(),
            name: name.into(),
            server,
            state,
            transitions: Mutex::new(VecDeque::with_capacity(TRANSITION_LOG)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Most recent transitions, oldest first.
    pub fn recent_transitions(&self) -> Vec<Transition> {
        self.transitions.lock().iter().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.server.is_connected()
    }

    /// Move to `next` if the edge is legal. Returns whether the state changed.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let mut from = None;
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                warn!(
                    server_id = %self.id,
                    from = %current,
                    to = %next,
                    "refusing illegal connection state transition"
                );
                return false;
            }
            from = Some(*current);
            *current = next;
            true
        });

        let Some(from) = from else {
            return false;
        };
        debug!(server_id = %self.id, %from, to = %next, "connection state changed");
        let mut log = self.transitions.lock();
        if log.len() == TRANSITION_LOG {
            log.pop_front();
        }
        log.push_back(Transition {
            from,
            to: next,
            at: Utc::now(),
        });
        true
    }

    /// One connection attempt: Connecting, then Connected or Error.
    pub async fn connect(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.state() == ConnectionState::Connected {
            // The transport dropped underneath us.
            self.transition(ConnectionState::Error);
        }
        self.transition(ConnectionState::Connecting);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(mcp::Error::Cancelled),
            r = tokio::time::timeout(timeout, self.server.connect(cancel)) => {
                r.unwrap_or(Err(mcp::Error::Timeout))
            }
        };

        match outcome {
            Ok(()) => {
                self.transition(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = self.server.disconnect().await {
                    debug!(server_id = %self.id, error = %cleanup, "cleanup after failed connect reported an error");
                }
                // A stopped cycle is a disconnect, not a failure.
                if matches!(e, mcp::Error::Cancelled) {
                    self.transition(ConnectionState::Disconnected);
                } else {
                    self.transition(ConnectionState::Error);
                }
                Err(e.into())
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.server.disconnect().await {
            debug!(server_id = %self.id, error = %e, "disconnect reported an error");
        }
        self.transition(ConnectionState::Disconnected);
    }

    /// Mark a live connection as failed (e.g. after a failed ping).
    pub(crate) fn mark_failed(&self) {
        self.transition(ConnectionState::Error);
    }

    pub async fn list_tools(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Tool>, ConnectionError> {
        if !self.is_connected() {
            return Err(mcp::Error::NotConnected.into());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(mcp::Error::Cancelled.into()),
            r = tokio::time::timeout(timeout, self.server.list_tools(cancel)) => {
                r.unwrap_or(Err(mcp::Error::Timeout)).map_err(Into::into)
            }
        }
    }

    /// Invoke a tool. The timeout bounds the whole call even if the transport
    /// ignores it.
    pub async fn call_tool(
        &self,
        name: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> mcp::Result<CallToolResult> {
        if !self.is_connected() {
            return Err(mcp::Error::NotConnected);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(mcp::Error::Cancelled),
            r = tokio::time::timeout(timeout, self.server.call_tool(name, params, timeout, cancel)) => {
                r.unwrap_or(Err(mcp::Error::Timeout))
            }
        }
    }

    pub async fn ping(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(mcp::Error::NotConnected.into());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(mcp::Error::Cancelled.into()),
            r = tokio::time::timeout(timeout, self.server.ping(cancel)) => {
                r.unwrap_or(Err(mcp::Error::Timeout)).map_err(Into::into)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockServer;
    use ConnectionState::*;

    #[test]
    fn no_shortcut_to_connected() {
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Connected));
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Error.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Error));
    }

    #[test]
    fn illegal_transitions_are_refused() {
        let conn = ServerConnection::new("fs", "fs", Box::new(MockServer::new()));
        assert!(!conn.transition(Connected));
        assert_eq!(conn.state(), Disconnected);
        assert!(conn.recent_transitions().is_empty());
    }

    #[tokio::test]
    async fn connect_walks_through_connecting() {
        let conn = ServerConnection::new("fs", "fs", Box::new(MockServer::new()));
        conn.connect(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert!(conn.is_connected());
        let path: Vec<_> = conn
            .recent_transitions()
            .iter()
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(path, vec![(Disconnected, Connecting), (Connecting, Connected)]);
    }

    #[tokio::test]
    async fn failed_connect_lands_in_error() {
        let server = MockServer::new().failing_connects(std::io::ErrorKind::ConnectionRefused);
        let conn = ServerConnection::new("fs", "fs", Box::new(server));
        let err = conn
            .connect(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, "connection_refused");
        assert_eq!(conn.state(), Error);
    }

    #[tokio::test]
    async fn failed_cleanup_keeps_the_connect_error() {
        let server = MockServer::new().failing_connects(std::io::ErrorKind::ConnectionRefused);
        server.fail_disconnects(true);
        let conn = ServerConnection::new("fs", "fs", Box::new(server.clone()));
        let err = conn
            .connect(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, "connection_refused");
        assert_eq!(server.disconnects(), 1);
        assert_eq!(conn.state(), Error);
    }

    #[tokio::test]
    async fn call_tool_times_out() {
        let server = MockServer::new().with_delay(Duration::from_secs(5));
        let conn = ServerConnection::new("slow", "slow", Box::new(server));
        conn.connect(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        let err = conn
            .call_tool(
                "echo",
                None,
                Duration::from_millis(20),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, mcp::Error::Timeout));
    }

    #[tokio::test]
    async fn watchers_see_state_changes() {
        let conn = ServerConnection::new("fs", "fs", Box::new(MockServer::new()));
        let mut rx = conn.watch();
        conn.connect(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Connected);
        conn.disconnect().await;
        assert_eq!(conn.state(), Disconnected);
    }
}
