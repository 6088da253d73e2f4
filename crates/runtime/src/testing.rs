//! In-process fakes shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mcp::{CallToolResult, Tool, ToolServer};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::{ExecutorConfig, ServerDescriptor, TransportConfig};
use crate::connection::{ServerConnection, ServerFactory};
use crate::discovery::{ToolDiscoveryCache, ToolSource};
use crate::executor::ToolExecutor;
use crate::llm::{AdapterEvent, AdapterStream, Message, ModelAdapter, ModelError, ToolSpec};
use crate::notify::{Notice, NotificationSink};

#[derive(Default)]
struct MockState {
    tools: Vec<String>,
    delay: Option<Duration>,
    list_delay: Option<Duration>,
    connect_error: Mutex<Option<ErrorKind>>,
    connected: AtomicBool,
    fail_lists: AtomicBool,
    fail_pings: AtomicBool,
    fail_disconnects: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    calls: AtomicUsize,
    list_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A scriptable tool server. Clones share state, so a test can keep a
/// handle after boxing one into a connection.
///
/// Calls answer `"{tool}:{arguments}"`; a tool named `fail` always fails.
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<MockState>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn configure(mut self, f: impl FnOnce(&mut MockState)) -> Self {
        let state = Arc::get_mut(&mut self.state).expect("configure before sharing");
        f(state);
        self
    }

    pub fn with_tools(self, tools: &[&str]) -> Self {
        self.configure(|s| s.tools = tools.iter().map(|t| t.to_string()).collect())
    }

    /// Delay every tool call.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.configure(|s| s.delay = Some(delay))
    }

    pub fn with_list_delay(self, delay: Duration) -> Self {
        self.configure(|s| s.list_delay = Some(delay))
    }

    pub fn failing_connects(self, kind: ErrorKind) -> Self {
        self.set_connect_error(Some(kind));
        self
    }

    pub fn set_connect_error(&self, kind: Option<ErrorKind>) {
        *self.state.connect_error.lock() = kind;
    }

    pub fn fail_lists(&self, fail: bool) {
        self.state.fail_lists.store(fail, Ordering::SeqCst);
    }

    pub fn fail_pings(&self, fail: bool) {
        self.state.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn fail_disconnects(&self, fail: bool) {
        self.state.fail_disconnects.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.state.list_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a MockState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn pause(delay: Option<Duration>, cancel: &CancellationToken) -> mcp::Result<()> {
    let Some(delay) = delay else {
        return Ok(());
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(mcp::Error::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[async_trait]
impl ToolServer for MockServer {
    async fn connect(&self, _cancel: &CancellationToken) -> mcp::Result<()> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = *self.state.connect_error.lock() {
            return Err(mcp::Error::Io(kind.into()));
        }
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> mcp::Result<()> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
        if self.state.fail_disconnects.load(Ordering::SeqCst) {
            return Err(mcp::Error::Transport("pipe already closed".into()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn list_tools(&self, cancel: &CancellationToken) -> mcp::Result<Vec<Tool>> {
        self.state.list_calls.fetch_add(1, Ordering::SeqCst);
        pause(self.state.list_delay, cancel).await?;
        if self.state.fail_lists.load(Ordering::SeqCst) {
            return Err(mcp::Error::ServerExited);
        }
        Ok(self
            .state
            .tools
            .iter()
            .map(|name| Tool {
                name: name.clone(),
                description: Some(format!("mock {name}")),
                input_schema: json!({ "type": "object" }),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> mcp::Result<CallToolResult> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.state);
        pause(self.state.delay, cancel).await?;
        if name == "fail" {
            return Err(mcp::Error::ToolCallFailed("boom".into()));
        }
        let args = arguments.unwrap_or(Value::Null);
        Ok(CallToolResult::text(format!("{name}:{args}")))
    }

    async fn ping(&self, _cancel: &CancellationToken) -> mcp::Result<()> {
        if self.state.fail_pings.load(Ordering::SeqCst) {
            return Err(mcp::Error::Timeout);
        }
        Ok(())
    }
}

/// Hands out registered mocks by server id, and fresh ones otherwise.
#[derive(Default)]
pub struct MockFactory {
    servers: HashMap<String, MockServer>,
}

impl MockFactory {
    pub fn with(mut self, id: &str, server: MockServer) -> Self {
        self.servers.insert(id.to_string(), server);
        self
    }
}

impl ServerFactory for MockFactory {
    fn create(&self, descriptor: &ServerDescriptor) -> Box<dyn ToolServer> {
        Box::new(self.servers.get(&descriptor.id).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingSink {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }
}

pub fn descriptor(id: &str) -> ServerDescriptor {
    ServerDescriptor::new(
        id,
        id,
        TransportConfig::Stdio {
            command: "mock".into(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
        },
    )
}

/// A fixed set of connections, in order.
pub struct StaticSource {
    connections: Vec<Arc<ServerConnection>>,
}

impl StaticSource {
    pub fn new(connections: Vec<Arc<ServerConnection>>) -> Self {
        Self { connections }
    }
}

impl ToolSource for StaticSource {
    fn connected_servers(&self) -> Vec<Arc<ServerConnection>> {
        self.connections
            .iter()
            .filter(|c| c.is_connected())
            .cloned()
            .collect()
    }

    fn connection(&self, id: &str) -> Option<Arc<ServerConnection>> {
        self.connections.iter().find(|c| c.id() == id).cloned()
    }
}

pub async fn connected(id: &str, server: MockServer) -> Arc<ServerConnection> {
    let connection = Arc::new(ServerConnection::new(id, id, Box::new(server)));
    connection
        .connect(Duration::from_secs(1), &CancellationToken::new())
        .await
        .expect("mock connects");
    connection
}

pub async fn executor_with(config: ExecutorConfig, servers: Vec<(&str, MockServer)>) -> ToolExecutor {
    let mut connections = Vec::new();
    for (id, server) in servers {
        connections.push(connected(id, server).await);
    }
    let source: Arc<dyn ToolSource> = Arc::new(StaticSource::new(connections));
    let discovery = ToolDiscoveryCache::new(source.clone(), Duration::from_secs(1));
    ToolExecutor::new(&config, source, discovery)
}

/// Replays one scripted response per round and records what it was sent.
pub struct ScriptedAdapter {
    script: Mutex<VecDeque<Vec<AdapterEvent>>>,
    seen: Mutex<Vec<(Vec<Message>, Vec<String>)>>,
}

impl ScriptedAdapter {
    pub fn new(rounds: Vec<Vec<AdapterEvent>>) -> Self {
        Self {
            script: Mutex::new(rounds.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn rounds(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn seen_messages(&self, round: usize) -> Vec<Message> {
        self.seen.lock()[round].0.clone()
    }

    pub fn seen_tools(&self, round: usize) -> Vec<String> {
        self.seen.lock()[round].1.clone()
    }
}

#[async_trait]
impl ModelAdapter for ScriptedAdapter {
    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        _cancel: &CancellationToken,
    ) -> Result<AdapterStream, ModelError> {
        let names = tools.iter().map(|t| t.name.clone()).collect();
        self.seen.lock().push((messages.to_vec(), names));
        let events = self.script.lock().pop_front().unwrap_or_default();
        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }
}
