//! Supervision of the configured tool servers.
//!
//! The manager owns every [`ServerDescriptor`] and its health record. Each
//! server has a lifecycle lock so that connect cycles, stops and recoveries
//! for one server never overlap, while different servers proceed
//! independently. State changes are published as [`ServerEvent`]s; that
//! stream is the only link to the discovery cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ManagerConfig, ServerDescriptor};
use crate::connection::{ConnectionState, ServerConnection, ServerFactory, TransportFactory};
use crate::discovery::ToolSource;
use crate::error::{ConnectionError, ManagerError};
use crate::events::ServerEvent;
use crate::notify::{LogSink, Notice, NotificationSink};
use crate::retry::{GiveUpReason, RetryDecision, RetryState, RetrySupervisor};

const EVENT_CAPACITY: usize = 64;

/// Health snapshot for one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerHealthStatus {
    pub server_id: String,
    pub connection_state: ConnectionState,
    pub consecutive_failures: u32,
    pub retry_state: RetryState,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub auto_disabled_at: Option<DateTime<Utc>>,
}

/// Result of pinging one server during a health check.
#[derive(Debug, Clone)]
pub struct PingOutcome {
    pub server_id: String,
    pub result: Result<Duration, ConnectionError>,
}

struct EntryState {
    descriptor: ServerDescriptor,
    consecutive_failures: u32,
    retry: RetrySupervisor,
    last_ping_at: Option<DateTime<Utc>>,
    auto_disabled_at: Option<DateTime<Utc>>,
    cycle: CancellationToken,
}

struct ServerEntry {
    id: String,
    connection: Arc<ServerConnection>,
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<EntryState>,
}

impl ServerEntry {
    fn new(descriptor: ServerDescriptor, connection: ServerConnection, config: &ManagerConfig) -> Self {
        Self {
            id: descriptor.id.clone(),
            connection: Arc::new(connection),
            lifecycle: tokio::sync::Mutex::new(()),
            state: Mutex::new(EntryState {
                descriptor,
                consecutive_failures: 0,
                retry: RetrySupervisor::new(config.retry.clone()),
                last_ping_at: None,
                auto_disabled_at: None,
                cycle: CancellationToken::new(),
            }),
        }
    }

    fn begin_cycle(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        let mut state = self.state.lock();
        state.cycle = token.clone();
        state.retry.begin_cycle();
        token
    }

    fn current_cycle(&self) -> CancellationToken {
        self.state.lock().cycle.clone()
    }

    fn cancel_cycle(&self) {
        self.state.lock().cycle.cancel();
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().descriptor.enabled
    }

    fn is_auto_disabled(&self) -> bool {
        self.state.lock().descriptor.auto_disabled
    }

    fn health(&self) -> ServerHealthStatus {
        let state = self.state.lock();
        ServerHealthStatus {
            server_id: self.id.clone(),
            connection_state: self.connection.state(),
            consecutive_failures: state.consecutive_failures,
            retry_state: state.retry.state().clone(),
            last_ping_at: state.last_ping_at,
            auto_disabled_at: state.auto_disabled_at,
        }
    }
}

struct Inner {
    config: ManagerConfig,
    factory: Arc<dyn ServerFactory>,
    sink: Arc<dyn NotificationSink>,
    servers: RwLock<Vec<Arc<ServerEntry>>>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// Builder for [`ServerConnectionManager`].
pub struct ManagerBuilder {
    config: ManagerConfig,
    factory: Arc<dyn ServerFactory>,
    sink: Arc<dyn NotificationSink>,
}

impl ManagerBuilder {
    /// Use a custom transport factory.
    pub fn factory(mut self, factory: Arc<dyn ServerFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Where auto-disable notices go.
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> ServerConnectionManager {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        ServerConnectionManager {
            inner: Arc::new(Inner {
                config: self.config,
                factory: self.factory,
                sink: self.sink,
                servers: RwLock::new(Vec::new()),
                events,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

/// Owns the configured servers and drives their lifecycles.
///
/// Cheap to clone; clones share the same servers.
#[derive(Clone)]
pub struct ServerConnectionManager {
    inner: Arc<Inner>,
}

impl ServerConnectionManager {
    pub fn builder(config: ManagerConfig) -> ManagerBuilder {
        ManagerBuilder {
            config,
            factory: Arc::new(TransportFactory),
            sink: Arc::new(LogSink),
        }
    }

    pub fn new(config: ManagerConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Register `descriptors` and connect every enabled one.
    ///
    /// Returns once every initial connect cycle has either succeeded or given
    /// up. Connection failures are recorded in the health status, not
    /// returned.
    pub async fn initialize(&self, descriptors: Vec<ServerDescriptor>) -> Result<(), ManagerError> {
        let mut enabled = Vec::new();
        for descriptor in descriptors {
            if descriptor.enabled {
                enabled.push(descriptor.id.clone());
            }
            self.add_server(descriptor)?;
        }

        let results = join_all(enabled.iter().map(|id| self.start_server(id))).await;
        let connected = results.iter().filter(|r| r.is_ok()).count();
        info!(
            servers = enabled.len(),
            connected, "tool servers initialized"
        );
        Ok(())
    }

    /// Register a server without starting it.
    pub fn add_server(&self, descriptor: ServerDescriptor) -> Result<(), ManagerError> {
        self.ensure_open()?;
        let mut servers = self.inner.servers.write();
        if servers.iter().any(|e| e.id == descriptor.id) {
            return Err(ManagerError::DuplicateServer(descriptor.id));
        }
        let server = self.inner.factory.create(&descriptor);
        let connection =
            ServerConnection::new(&descriptor.id, descriptor.display_name(), server);
        debug!(server_id = %descriptor.id, transport = descriptor.transport.kind(), "server added");
        servers.push(Arc::new(ServerEntry::new(
            descriptor,
            connection,
            &self.inner.config,
        )));
        Ok(())
    }

    /// Stop a server and forget it.
    pub async fn remove_server(&self, id: &str) -> Result<(), ManagerError> {
        let entry = self.entry(id)?;
        let emitted = self.stop_entry(&entry).await;
        self.inner.servers.write().retain(|e| e.id != id);
        if !emitted {
            self.emit(ServerEvent::ServerStopped {
                server_id: id.to_string(),
            });
        }
        debug!(server_id = %id, "server removed");
        Ok(())
    }

    /// Apply a new server list.
    ///
    /// Removed servers are stopped, new ones added and started if enabled,
    /// and servers whose launch parameters changed are restarted from a clean
    /// slate. Unchanged servers keep their counters and connections.
    pub async fn reconfigure(&self, descriptors: Vec<ServerDescriptor>) -> Result<(), ManagerError> {
        self.ensure_open()?;
        for (i, d) in descriptors.iter().enumerate() {
            if descriptors[..i].iter().any(|other| other.id == d.id) {
                return Err(ManagerError::DuplicateServer(d.id.clone()));
            }
        }

        let current = self.inner.servers.read().clone();
        for entry in &current {
            let replacement = descriptors.iter().find(|d| d.id == entry.id);
            let keep = replacement.is_some_and(|d| entry.state.lock().descriptor.same_launch(d));
            if !keep {
                self.remove_server(&entry.id).await?;
            }
        }

        let mut to_start = Vec::new();
        let mut to_stop = Vec::new();
        for descriptor in &descriptors {
            match self.entry(&descriptor.id) {
                Ok(entry) => {
                    let was_enabled = {
                        let mut state = entry.state.lock();
                        let was = state.descriptor.enabled;
                        state.descriptor.enabled = descriptor.enabled;
                        was
                    };
                    match (was_enabled, descriptor.enabled) {
                        (false, true) => to_start.push(descriptor.id.clone()),
                        (true, false) => to_stop.push(descriptor.id.clone()),
                        _ => {}
                    }
                }
                Err(_) => {
                    self.add_server(descriptor.clone())?;
                    if descriptor.enabled {
                        to_start.push(descriptor.id.clone());
                    }
                }
            }
        }

        // Keep configuration order.
        {
            let mut servers = self.inner.servers.write();
            servers.sort_by_key(|e| {
                descriptors
                    .iter()
                    .position(|d| d.id == e.id)
                    .unwrap_or(usize::MAX)
            });
        }

        for id in &to_stop {
            self.stop_server(id).await?;
        }
        join_all(to_start.iter().map(|id| self.start_server(id))).await;
        info!(servers = descriptors.len(), "server configuration applied");
        Ok(())
    }

    /// Connect a server. Idempotent for connected servers.
    ///
    /// Runs a full retry cycle and returns its outcome.
    pub async fn start_server(&self, id: &str) -> Result<(), ManagerError> {
        self.ensure_open()?;
        let entry = self.entry(id)?;
        if !entry.is_enabled() {
            return Err(ManagerError::Disabled(id.to_string()));
        }

        let _guard = entry.lifecycle.lock().await;
        if entry.is_auto_disabled() {
            return Err(ManagerError::AutoDisabled(id.to_string()));
        }
        if entry.connection.is_connected() {
            return Ok(());
        }
        let cancel = entry.begin_cycle(&self.inner.shutdown);
        self.connect_cycle(&entry, &cancel).await
    }

    /// Disconnect a server. Idempotent.
    pub async fn stop_server(&self, id: &str) -> Result<(), ManagerError> {
        let entry = self.entry(id)?;
        self.stop_entry(&entry).await;
        Ok(())
    }

    /// Clear the auto-disabled flag and failure count, then connect afresh.
    ///
    /// This is the only way out of the auto-disabled state.
    pub async fn reenable_server(&self, id: &str) -> Result<(), ManagerError> {
        let entry = self.entry(id)?;
        {
            let mut state = entry.state.lock();
            if !state.descriptor.enabled {
                return Err(ManagerError::Disabled(id.to_string()));
            }
            state.descriptor.auto_disabled = false;
            state.descriptor.failure_count = 0;
            state.auto_disabled_at = None;
            state.consecutive_failures = 0;
            state.retry.reset();
        }
        info!(server_id = %id, "server re-enabled");
        self.start_server(id).await
    }

    /// Ping every connected server.
    ///
    /// A failed ping moves the server to Error and schedules a recovery
    /// cycle in the background. Servers left in Error by an exhausted cycle
    /// get a new cycle too, unless auto-disabled.
    pub async fn perform_health_check(&self) -> Vec<PingOutcome> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let entries = self.inner.servers.read().clone();
        let mut to_ping = Vec::new();
        for entry in entries {
            match entry.connection.state() {
                ConnectionState::Connected => to_ping.push(entry),
                ConnectionState::Error if entry.lifecycle.try_lock().is_ok() => {
                    self.spawn_recovery(entry);
                }
                _ => {}
            }
        }

        let outcomes = join_all(to_ping.into_iter().map(|entry| self.ping_entry(entry))).await;
        outcomes.into_iter().flatten().collect()
    }

    /// Run [`perform_health_check`](Self::perform_health_check) every
    /// `interval` until [`shutdown`](Self::shutdown).
    pub fn start_health_monitor(&self, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let outcomes = this.perform_health_check().await;
                        debug!(pinged = outcomes.len(), "health check completed");
                    }
                }
            }
        })
    }

    /// Cancel every retry and the health monitor, then disconnect all servers.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        let entries = self.inner.servers.read().clone();
        join_all(entries.iter().map(|e| self.stop_entry(e))).await;
        info!("connection manager shut down");
    }

    pub fn health_status(&self, id: &str) -> Result<ServerHealthStatus, ManagerError> {
        Ok(self.entry(id)?.health())
    }

    pub fn all_health(&self) -> Vec<ServerHealthStatus> {
        self.inner.servers.read().iter().map(|e| e.health()).collect()
    }

    pub fn descriptor(&self, id: &str) -> Result<ServerDescriptor, ManagerError> {
        Ok(self.entry(id)?.state.lock().descriptor.clone())
    }

    pub fn descriptors(&self) -> Vec<ServerDescriptor> {
        self.inner
            .servers
            .read()
            .iter()
            .map(|e| e.state.lock().descriptor.clone())
            .collect()
    }

    fn entry(&self, id: &str) -> Result<Arc<ServerEntry>, ManagerError> {
        self.inner
            .servers
            .read()
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownServer(id.to_string()))
    }

    fn ensure_open(&self) -> Result<(), ManagerError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ManagerError::ShutDown);
        }
        Ok(())
    }

    fn emit(&self, event: ServerEvent) {
        debug!(event = %event, "server event");
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Returns whether a stop event was emitted.
    async fn stop_entry(&self, entry: &ServerEntry) -> bool {
        // Cancel first so a running cycle releases the lifecycle lock.
        entry.cancel_cycle();
        let _guard = entry.lifecycle.lock().await;
        let was = entry.connection.state();
        entry.connection.disconnect().await;
        entry.state.lock().retry.abandon();
        if was == ConnectionState::Disconnected {
            return false;
        }
        info!(server_id = %entry.id, "server stopped");
        self.emit(ServerEvent::ServerStopped {
            server_id: entry.id.clone(),
        });
        true
    }

    /// Connect with retries until success, give-up, auto-disable or cancel.
    ///
    /// Callers hold the entry's lifecycle lock.
    async fn connect_cycle(
        &self,
        entry: &ServerEntry,
        cancel: &CancellationToken,
    ) -> Result<(), ManagerError> {
        let timeout = self.inner.config.connect_timeout();
        let threshold = self.inner.config.failure_threshold;

        loop {
            if entry.is_auto_disabled() {
                return Err(ManagerError::AutoDisabled(entry.id.clone()));
            }

            let err = match entry.connection.connect(timeout, cancel).await {
                Ok(()) => {
                    {
                        let mut state = entry.state.lock();
                        state.consecutive_failures = 0;
                        state.descriptor.failure_count = 0;
                        state.descriptor.last_connected_at = Some(Utc::now());
                        state.retry.reset();
                    }
                    info!(server_id = %entry.id, "server connected");
                    self.emit(ServerEvent::ServerStarted {
                        server_id: entry.id.clone(),
                    });
                    return Ok(());
                }
                Err(err) => err,
            };

            if cancel.is_cancelled() {
                debug!(server_id = %entry.id, "connect cycle cancelled");
                entry.state.lock().retry.abandon();
                return Err(ManagerError::Connection {
                    server_id: entry.id.clone(),
                    source: err,
                });
            }

            let (failures, decision, disabled, name) = {
                let mut state = entry.state.lock();
                state.consecutive_failures += 1;
                state.descriptor.failure_count = state.consecutive_failures;
                let decision = state.retry.record_failure(&err.code, &err.message);
                let disabled = state.consecutive_failures >= threshold;
                if disabled {
                    state.descriptor.auto_disabled = true;
                    state.auto_disabled_at = Some(Utc::now());
                    state.retry.abandon();
                }
                (
                    state.consecutive_failures,
                    decision,
                    disabled,
                    state.descriptor.display_name().to_string(),
                )
            };

            self.emit(ServerEvent::ServerFailed {
                server_id: entry.id.clone(),
                error: err.clone(),
                consecutive_failures: failures,
            });

            if disabled {
                error!(
                    server_id = %entry.id,
                    consecutive_failures = failures,
                    error = %err,
                    "server auto-disabled"
                );
                self.emit(ServerEvent::ServerAutoDisabled {
                    server_id: entry.id.clone(),
                    consecutive_failures: failures,
                });
                self.inner.sink.notify(Notice::ServerAutoDisabled {
                    server_id: entry.id.clone(),
                    server_name: name,
                    consecutive_failures: failures,
                });
                return Err(ManagerError::AutoDisabled(entry.id.clone()));
            }

            match decision {
                RetryDecision::GiveUp(reason) => {
                    let why = match reason {
                        GiveUpReason::NonTransient => "non-transient error",
                        GiveUpReason::Exhausted => "retries exhausted",
                    };
                    warn!(
                        server_id = %entry.id,
                        consecutive_failures = failures,
                        error = %err,
                        "giving up on server: {why}"
                    );
                    return Err(ManagerError::Connection {
                        server_id: entry.id.clone(),
                        source: err,
                    });
                }
                RetryDecision::RetryAfter(delay) => {
                    let attempt = entry.state.lock().retry.state().current_attempt + 1;
                    warn!(
                        server_id = %entry.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "server connection failed, retrying"
                    );
                    self.emit(ServerEvent::ServerRetry {
                        server_id: entry.id.clone(),
                        attempt,
                        delay,
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            entry.state.lock().retry.abandon();
                            return Err(ManagerError::Connection {
                                server_id: entry.id.clone(),
                                source: ConnectionError::new("cancelled", "connect cycle cancelled"),
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn ping_entry(&self, entry: Arc<ServerEntry>) -> Option<PingOutcome> {
        let guard = entry.lifecycle.try_lock().ok()?;
        let cancel = entry.current_cycle();
        let started = Instant::now();
        let result = entry
            .connection
            .ping(self.inner.config.ping_timeout(), &cancel)
            .await;

        match &result {
            Ok(()) => {
                entry.state.lock().last_ping_at = Some(Utc::now());
            }
            Err(err) if !cancel.is_cancelled() => {
                entry.connection.mark_failed();
                let failures = entry.state.lock().consecutive_failures;
                warn!(server_id = %entry.id, error = %err, "health check failed");
                self.emit(ServerEvent::ServerFailed {
                    server_id: entry.id.clone(),
                    error: err.clone(),
                    consecutive_failures: failures,
                });
                drop(guard);
                self.spawn_recovery(entry.clone());
            }
            Err(_) => {}
        }

        Some(PingOutcome {
            server_id: entry.id.clone(),
            result: result.map(|()| started.elapsed()),
        })
    }

    fn spawn_recovery(&self, entry: Arc<ServerEntry>) {
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = entry.lifecycle.lock().await;
            let cancel = entry.current_cycle();
            if cancel.is_cancelled()
                || entry.connection.state() != ConnectionState::Error
                || entry.is_auto_disabled()
                || !entry.is_enabled()
            {
                return;
            }
            entry.state.lock().retry.begin_cycle();
            if let Err(e) = this.connect_cycle(&entry, &cancel).await {
                debug!(server_id = %entry.id, error = %e, "recovery did not reconnect");
            }
        });
    }
}

impl ToolSource for ServerConnectionManager {
    fn connected_servers(&self) -> Vec<Arc<ServerConnection>> {
        self.inner
            .servers
            .read()
            .iter()
            .filter(|e| e.connection.is_connected())
            .map(|e| e.connection.clone())
            .collect()
    }

    fn connection(&self, server_id: &str) -> Option<Arc<ServerConnection>> {
        self.inner
            .servers
            .read()
            .iter()
            .find(|e| e.id == server_id)
            .map(|e| e.connection.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::retry::RetryPolicy;
    use crate::testing::{MockFactory, MockServer, RecordingSink, descriptor};
    use std::io::ErrorKind;

    fn config(threshold: u32) -> ManagerConfig {
        ManagerConfig {
            failure_threshold: threshold,
            connect_timeout_secs: 1,
            ping_timeout_secs: 1,
            retry: RetryPolicy {
                max_attempts: 5,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                jitter: false,
                ..RetryPolicy::default()
            },
            ..ManagerConfig::default()
        }
    }

    fn manager(threshold: u32, factory: MockFactory) -> ServerConnectionManager {
        ServerConnectionManager::builder(config(threshold))
            .factory(Arc::new(factory))
            .build()
    }

    fn drain(rx: &mut broadcast::Receiver<ServerEvent>) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        kinds
    }

    #[tokio::test]
    async fn auto_disable_then_reenable() {
        let fs = MockServer::new().failing_connects(ErrorKind::ConnectionRefused);
        let sink = Arc::new(RecordingSink::default());
        let manager = ServerConnectionManager::builder(config(3))
            .factory(Arc::new(MockFactory::default().with("fs", fs.clone())))
            .sink(sink.clone())
            .build();
        let mut events = manager.subscribe();

        manager.initialize(vec![descriptor("fs")]).await.unwrap();

        assert_eq!(fs.connects(), 3);
        let health = manager.health_status("fs").unwrap();
        assert_eq!(health.consecutive_failures, 3);
        assert!(health.auto_disabled_at.is_some());
        assert!(!health.retry_state.is_retrying);
        assert!(manager.descriptor("fs").unwrap().auto_disabled);
        assert_eq!(sink.notices().len(), 1);
        assert!(drain(&mut events).contains(&"server-auto-disabled"));

        // No automatic fourth attempt, even when asked to start or checked.
        assert!(matches!(
            manager.start_server("fs").await,
            Err(ManagerError::AutoDisabled(_))
        ));
        manager.perform_health_check().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fs.connects(), 3);

        fs.set_connect_error(None);
        manager.reenable_server("fs").await.unwrap();
        let health = manager.health_status("fs").unwrap();
        assert_eq!(health.connection_state, ConnectionState::Connected);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.auto_disabled_at.is_none());
        assert!(manager.descriptor("fs").unwrap().last_connected_at.is_some());
    }

    #[tokio::test]
    async fn transitions_follow_lifecycle_edges() {
        let fs = MockServer::new().failing_connects(ErrorKind::ConnectionRefused);
        let manager = manager(3, MockFactory::default().with("fs", fs.clone()));
        manager.initialize(vec![descriptor("fs")]).await.unwrap();
        fs.set_connect_error(None);
        manager.reenable_server("fs").await.unwrap();
        manager.stop_server("fs").await.unwrap();

        let conn = manager.connection("fs").unwrap();
        let transitions = conn.recent_transitions();
        assert!(!transitions.is_empty());
        for t in &transitions {
            assert!(t.from.can_transition_to(t.to), "{:?} -> {:?}", t.from, t.to);
        }
        assert_eq!(
            transitions.last().map(|t| t.to),
            Some(ConnectionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn non_transient_error_stops_cycle() {
        let fs = MockServer::new().failing_connects(ErrorKind::PermissionDenied);
        let manager = manager(3, MockFactory::default().with("fs", fs.clone()));
        manager.initialize(vec![descriptor("fs")]).await.unwrap();

        assert_eq!(fs.connects(), 1);
        let health = manager.health_status("fs").unwrap();
        assert_eq!(health.connection_state, ConnectionState::Error);
        assert_eq!(health.consecutive_failures, 1);
        assert!(health.auto_disabled_at.is_none());
    }

    #[tokio::test]
    async fn exhausted_cycle_counts_toward_threshold() {
        let fs = MockServer::new().failing_connects(ErrorKind::ConnectionRefused);
        let mut cfg = config(10);
        cfg.retry.max_attempts = 2;
        let manager = ServerConnectionManager::builder(cfg)
            .factory(Arc::new(MockFactory::default().with("fs", fs.clone())))
            .build();
        manager.initialize(vec![descriptor("fs")]).await.unwrap();
        assert_eq!(fs.connects(), 2);
        let health = manager.health_status("fs").unwrap();
        assert_eq!(health.consecutive_failures, 2);
        assert_eq!(health.retry_state.current_attempt, 2);
        assert!(health.retry_state.last_error.is_some());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let manager = manager(3, MockFactory::default());
        let mut events = manager.subscribe();
        manager.add_server(descriptor("fs")).unwrap();

        manager.start_server("fs").await.unwrap();
        manager.start_server("fs").await.unwrap();
        manager.stop_server("fs").await.unwrap();
        manager.stop_server("fs").await.unwrap();

        assert_eq!(drain(&mut events), vec!["server-started", "server-stopped"]);
    }

    #[tokio::test]
    async fn disabled_servers_are_not_started() {
        let manager = manager(3, MockFactory::default());
        let mut d = descriptor("off");
        d.enabled = false;
        manager.initialize(vec![d]).await.unwrap();
        assert!(matches!(
            manager.start_server("off").await,
            Err(ManagerError::Disabled(_))
        ));
        assert!(matches!(
            manager.start_server("nope").await,
            Err(ManagerError::UnknownServer(_))
        ));
    }

    #[tokio::test]
    async fn failed_ping_recovers() {
        let fs = MockServer::new();
        let manager = manager(3, MockFactory::default().with("fs", fs.clone()));
        manager.initialize(vec![descriptor("fs")]).await.unwrap();
        let mut events = manager.subscribe();

        fs.fail_pings(true);
        let outcomes = manager.perform_health_check().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_err());

        let started = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(ServerEvent::ServerStarted { server_id }) => break server_id,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream closed: {e}"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(started, "fs");
        assert_eq!(fs.connects(), 2);

        fs.fail_pings(false);
        let outcomes = manager.perform_health_check().await;
        assert!(outcomes[0].result.is_ok());
        assert!(manager.health_status("fs").unwrap().last_ping_at.is_some());
    }

    #[tokio::test]
    async fn reconfigure_applies_diff() {
        let manager = manager(3, MockFactory::default());
        manager
            .initialize(vec![descriptor("a"), descriptor("b")])
            .await
            .unwrap();

        let mut b = descriptor("b");
        b.enabled = false;
        manager
            .reconfigure(vec![descriptor("c"), b])
            .await
            .unwrap();

        let ids: Vec<_> = manager.descriptors().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert!(matches!(
            manager.health_status("a"),
            Err(ManagerError::UnknownServer(_))
        ));
        assert_eq!(
            manager.health_status("b").unwrap().connection_state,
            ConnectionState::Disconnected
        );
        assert_eq!(
            manager.health_status("c").unwrap().connection_state,
            ConnectionState::Connected
        );
        let connected: Vec<_> = manager
            .connected_servers()
            .iter()
            .map(|c| c.id().to_string())
            .collect();
        assert_eq!(connected, vec!["c"]);
    }

    #[tokio::test]
    async fn changed_launch_restarts_from_clean_slate() {
        let fs = MockServer::new().failing_connects(ErrorKind::PermissionDenied);
        let manager = manager(3, MockFactory::default().with("fs", fs.clone()));
        manager.initialize(vec![descriptor("fs")]).await.unwrap();
        let old = manager.connection("fs").unwrap();
        assert_eq!(manager.health_status("fs").unwrap().consecutive_failures, 1);
        assert_eq!(manager.descriptor("fs").unwrap().failure_count, 1);

        fs.set_connect_error(None);
        let mut moved = descriptor("fs");
        moved.transport = TransportConfig::Stdio {
            command: "mock-v2".into(),
            args: vec!["--verbose".into()],
            env: Default::default(),
            cwd: None,
        };
        manager.reconfigure(vec![moved]).await.unwrap();

        let fresh = manager.connection("fs").unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(!old.is_connected());
        assert_eq!(fs.connects(), 2);

        let health = manager.health_status("fs").unwrap();
        assert_eq!(health.connection_state, ConnectionState::Connected);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.auto_disabled_at.is_none());
        let d = manager.descriptor("fs").unwrap();
        assert_eq!(d.failure_count, 0);
        assert!(matches!(
            d.transport,
            TransportConfig::Stdio { ref command, .. } if command == "mock-v2"
        ));
    }

    #[tokio::test]
    async fn shutdown_disconnects_everything() {
        let manager = manager(3, MockFactory::default());
        manager
            .initialize(vec![descriptor("a"), descriptor("b")])
            .await
            .unwrap();
        let monitor = manager.start_health_monitor(Duration::from_millis(5));
        manager.shutdown().await;
        monitor.await.unwrap();

        assert!(manager.connected_servers().is_empty());
        assert!(matches!(
            manager.start_server("a").await,
            Err(ManagerError::ShutDown)
        ));
    }
}
