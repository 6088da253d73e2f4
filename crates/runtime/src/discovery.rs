//! Tool discovery with coalesced rebuilds.
//!
//! The cache holds one immutable [`ToolCatalogSnapshot`] at a time. A rebuild
//! is a single shared future: callers arriving while it runs attach to it
//! and get the same `Arc`, so concurrent tool calls cost one round of
//! `tools/list` requests at most.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ServerConnection;
use crate::events::ServerEvent;
use crate::llm::ToolSpec;

/// Read-only view of the servers a cache or executor may talk to.
pub trait ToolSource: Send + Sync {
    /// Connected servers, in configuration order.
    fn connected_servers(&self) -> Vec<Arc<ServerConnection>>;

    fn connection(&self, server_id: &str) -> Option<Arc<ServerConnection>>;
}

/// A tool as advertised by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl From<mcp::Tool> for ToolDescriptor {
    fn from(tool: mcp::Tool) -> Self {
        Self {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            input_schema: tool.input_schema,
        }
    }
}

impl From<&ToolDescriptor> for ToolSpec {
    fn from(tool: &ToolDescriptor) -> Self {
        ToolSpec {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        }
    }
}

/// The server that owns a tool name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOwner {
    pub server_id: String,
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerTools {
    pub server_id: String,
    pub server_name: String,
    pub tools: Vec<ToolDescriptor>,
}

/// Which server exposes which tool, as of one rebuild.
///
/// Tool names are unique: when two servers expose the same name the first
/// server in configuration order keeps it and the duplicate is dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCatalogSnapshot {
    mapping: HashMap<String, ToolOwner>,
    servers: Vec<ServerTools>,
    built_at: DateTime<Utc>,
}

impl ToolCatalogSnapshot {
    pub fn owner(&self, tool: &str) -> Option<&ToolOwner> {
        self.mapping.get(tool)
    }

    pub fn servers(&self) -> &[ServerTools] {
        &self.servers
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn tool_count(&self) -> usize {
        self.mapping.len()
    }

    /// Whether `server_id` lists `tool` in this snapshot.
    pub fn server_has_tool(&self, server_id: &str, tool: &str) -> bool {
        self.servers
            .iter()
            .find(|s| s.server_id == server_id)
            .is_some_and(|s| s.tools.iter().any(|t| t.name == tool))
    }

    /// All tools in configuration order.
    pub fn tools(&self) -> impl Iterator<Item = (&ServerTools, &ToolDescriptor)> {
        self.servers
            .iter()
            .flat_map(|s| s.tools.iter().map(move |t| (s, t)))
    }

    /// Model-facing specs for every tool.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools().map(|(_, t)| ToolSpec::from(t)).collect()
    }

    fn from_servers(listed: Vec<(Arc<ServerConnection>, Vec<ToolDescriptor>)>) -> Self {
        let mut mapping: HashMap<String, ToolOwner> = HashMap::new();
        let mut servers = Vec::with_capacity(listed.len());
        for (conn, tools) in listed {
            let mut kept = Vec::with_capacity(tools.len());
            for tool in tools {
                if let Some(owner) = mapping.get(&tool.name) {
                    warn!(
                        tool = %tool.name,
                        server_id = %conn.id(),
                        owner = %owner.server_id,
                        "duplicate tool name, keeping the first server's"
                    );
                    continue;
                }
                mapping.insert(
                    tool.name.clone(),
                    ToolOwner {
                        server_id: conn.id().to_string(),
                        server_name: conn.name().to_string(),
                    },
                );
                kept.push(tool);
            }
            servers.push(ServerTools {
                server_id: conn.id().to_string(),
                server_name: conn.name().to_string(),
                tools: kept,
            });
        }
        Self {
            mapping,
            servers,
            built_at: Utc::now(),
        }
    }
}

/// Cache counters for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryMetrics {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    /// Requests that attached to a rebuild already in flight.
    pub batched: u64,
    pub in_flight: bool,
    pub builds: u64,
    pub invalidations: u64,
    pub last_invalidation_reason: Option<String>,
    pub last_invalidated_at: Option<DateTime<Utc>>,
    pub last_build_duration: Option<Duration>,
    pub last_server_count: usize,
    pub last_tool_count: usize,
    pub last_error: Option<String>,
}

type SharedBuild = Shared<BoxFuture<'static, Arc<ToolCatalogSnapshot>>>;

#[derive(Default)]
struct CacheState {
    snapshot: Option<Arc<ToolCatalogSnapshot>>,
    stale: bool,
    epoch: u64,
    in_flight: Option<SharedBuild>,
    metrics: DiscoveryMetrics,
}

/// Lazily rebuilt catalog of tools across connected servers.
#[derive(Clone)]
pub struct ToolDiscoveryCache {
    source: Arc<dyn ToolSource>,
    list_timeout: Duration,
    state: Arc<Mutex<CacheState>>,
}

impl ToolDiscoveryCache {
    pub fn new(source: Arc<dyn ToolSource>, list_timeout: Duration) -> Self {
        Self {
            source,
            list_timeout,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Current snapshot, rebuilding when missing, invalidated or forced.
    ///
    /// A forced refresh that finds a rebuild already running joins it.
    pub async fn get_snapshot(&self, force_refresh: bool) -> Arc<ToolCatalogSnapshot> {
        let build = {
            let mut state = self.state.lock();
            state.metrics.requests += 1;

            let fresh = match &state.snapshot {
                Some(snapshot) if !force_refresh && !state.stale => Some(snapshot.clone()),
                _ => None,
            };
            if let Some(snapshot) = fresh {
                state.metrics.hits += 1;
                return snapshot;
            }

            if let Some(build) = state.in_flight.clone() {
                state.metrics.batched += 1;
                build
            } else {
                state.metrics.misses += 1;
                state.metrics.in_flight = true;
                let build = self.rebuild(state.epoch);
                state.in_flight = Some(build.clone());
                build
            }
        };
        build.await
    }

    /// Last snapshot without triggering a rebuild.
    pub fn get_cached_snapshot(&self) -> Option<Arc<ToolCatalogSnapshot>> {
        self.state.lock().snapshot.clone()
    }

    /// Start a rebuild in the background if one is needed.
    pub fn preload(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let snapshot = this.get_snapshot(false).await;
            debug!(tools = snapshot.tool_count(), "tool catalog preloaded");
        })
    }

    /// Mark the snapshot stale; the next request rebuilds.
    pub fn invalidate(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.lock();
        state.stale = true;
        state.epoch += 1;
        state.metrics.invalidations += 1;
        state.metrics.last_invalidated_at = Some(Utc::now());
        debug!(reason = %reason, "tool catalog invalidated");
        state.metrics.last_invalidation_reason = Some(reason);
    }

    /// Invalidate on every event from `events` until the sender goes away.
    pub fn attach(&self, mut events: broadcast::Receiver<ServerEvent>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => this.invalidate(event.to_string()),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        this.invalidate(format!("missed {missed} server events"));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn metrics(&self) -> DiscoveryMetrics {
        self.state.lock().metrics.clone()
    }

    pub async fn tool_specs(&self) -> Vec<ToolSpec> {
        self.get_snapshot(false).await.specs()
    }

    pub async fn find_server(&self, tool: &str) -> Option<ToolOwner> {
        self.get_snapshot(false).await.owner(tool).cloned()
    }

    fn rebuild(&self, epoch: u64) -> SharedBuild {
        let source = self.source.clone();
        let state = self.state.clone();
        let timeout = self.list_timeout;

        async move {
            let started = Instant::now();
            let (snapshot, errors) = build_snapshot(source.as_ref(), timeout).await;
            let snapshot = Arc::new(snapshot);
            let elapsed = started.elapsed();

            let mut state = state.lock();
            state.in_flight = None;
            state.snapshot = Some(snapshot.clone());
            // An invalidation that raced the build wins.
            state.stale = state.epoch != epoch;

            let metrics = &mut state.metrics;
            metrics.in_flight = false;
            metrics.builds += 1;
            metrics.last_build_duration = Some(elapsed);
            metrics.last_server_count = snapshot.servers().len();
            metrics.last_tool_count = snapshot.tool_count();
            metrics.last_error = (!errors.is_empty()).then(|| errors.join("; "));

            info!(
                servers = snapshot.servers().len(),
                tools = snapshot.tool_count(),
                elapsed_ms = elapsed.as_millis() as u64,
                "tool catalog rebuilt"
            );
            snapshot
        }
        .boxed()
        .shared()
    }
}

async fn build_snapshot(
    source: &dyn ToolSource,
    timeout: Duration,
) -> (ToolCatalogSnapshot, Vec<String>) {
    let servers = source.connected_servers();
    let cancel = CancellationToken::new();
    let listed = join_all(servers.iter().map(|conn| conn.list_tools(timeout, &cancel))).await;

    let mut errors = Vec::new();
    let mut per_server = Vec::with_capacity(servers.len());
    for (conn, result) in servers.into_iter().zip(listed) {
        let tools = match result {
            Ok(tools) => tools.into_iter().map(ToolDescriptor::from).collect(),
            Err(e) => {
                warn!(server_id = %conn.id(), error = %e, "tool discovery failed for server");
                errors.push(format!("{}: {e}", conn.id()));
                Vec::new()
            }
        };
        per_server.push((conn, tools));
    }
    (ToolCatalogSnapshot::from_servers(per_server), errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockServer, StaticSource, connected};

    async fn cache_with(servers: Vec<(&str, MockServer)>) -> ToolDiscoveryCache {
        let mut conns = Vec::new();
        for (id, mock) in servers {
            conns.push(connected(id, mock).await);
        }
        ToolDiscoveryCache::new(Arc::new(StaticSource::new(conns)), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_rebuild() {
        let fs = MockServer::new()
            .with_tools(&["read", "write"])
            .with_list_delay(Duration::from_millis(30));
        let cache = cache_with(vec![("fs", fs.clone())]).await;

        let snapshots = join_all((0..8).map(|_| cache.get_snapshot(false))).await;

        assert_eq!(fs.list_calls(), 1);
        for s in &snapshots {
            assert!(Arc::ptr_eq(s, &snapshots[0]));
        }
        let metrics = cache.metrics();
        assert_eq!(metrics.requests, 8);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.batched, 7);
        assert_eq!(metrics.builds, 1);
        assert!(!metrics.in_flight);
        assert_eq!(metrics.last_tool_count, 2);
    }

    #[tokio::test]
    async fn hits_until_invalidated() {
        let fs = MockServer::new().with_tools(&["read"]);
        let cache = cache_with(vec![("fs", fs.clone())]).await;
        assert!(cache.get_cached_snapshot().is_none());

        let first = cache.get_snapshot(false).await;
        let second = cache.get_snapshot(false).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fs.list_calls(), 1);
        assert_eq!(cache.metrics().hits, 1);

        cache.invalidate("server-started(fs)");
        let third = cache.get_snapshot(false).await;
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(fs.list_calls(), 2);
        let metrics = cache.metrics();
        assert_eq!(metrics.invalidations, 1);
        assert_eq!(
            metrics.last_invalidation_reason.as_deref(),
            Some("server-started(fs)")
        );

        cache.get_snapshot(true).await;
        assert_eq!(fs.list_calls(), 3);
    }

    #[tokio::test]
    async fn failing_server_contributes_nothing() {
        let good = MockServer::new().with_tools(&["read"]);
        let bad = MockServer::new().with_tools(&["search"]);
        bad.fail_lists(true);
        let cache = cache_with(vec![("fs", good), ("web", bad)]).await;

        let snapshot = cache.get_snapshot(false).await;
        assert_eq!(snapshot.owner("read").unwrap().server_id, "fs");
        assert!(snapshot.owner("search").is_none());
        assert_eq!(snapshot.servers().len(), 2);
        assert!(snapshot.servers()[1].tools.is_empty());
        let err = cache.metrics().last_error.unwrap();
        assert!(err.starts_with("web:"));
    }

    #[tokio::test]
    async fn first_server_wins_name_collisions() {
        let a = MockServer::new().with_tools(&["search", "read"]);
        let b = MockServer::new().with_tools(&["search", "fetch"]);
        let cache = cache_with(vec![("a", a), ("b", b)]).await;

        let snapshot = cache.get_snapshot(false).await;
        assert_eq!(snapshot.owner("search").unwrap().server_id, "a");
        assert_eq!(snapshot.owner("fetch").unwrap().server_id, "b");
        assert_eq!(snapshot.tool_count(), 3);
        assert!(!snapshot.server_has_tool("b", "search"));
        let names: Vec<_> = snapshot.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["search", "read", "fetch"]);
    }

    #[tokio::test]
    async fn invalidation_during_build_keeps_cache_stale() {
        let fs = MockServer::new()
            .with_tools(&["read"])
            .with_list_delay(Duration::from_millis(30));
        let cache = cache_with(vec![("fs", fs.clone())]).await;

        let pending = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_snapshot(false).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.invalidate("server-stopped(fs)");
        pending.await.unwrap();

        cache.get_snapshot(false).await;
        assert_eq!(fs.list_calls(), 2);
    }

    #[tokio::test]
    async fn attached_events_invalidate() {
        let fs = MockServer::new().with_tools(&["read"]);
        let cache = cache_with(vec![("fs", fs)]).await;
        cache.get_snapshot(false).await;

        let (tx, rx) = broadcast::channel(4);
        let task = cache.attach(rx);
        tx.send(ServerEvent::ServerStopped {
            server_id: "fs".into(),
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let metrics = cache.metrics();
        assert_eq!(metrics.invalidations, 1);
        assert_eq!(
            metrics.last_invalidation_reason.as_deref(),
            Some("server-stopped(fs)")
        );
    }

    #[tokio::test]
    async fn preload_builds_in_background() {
        let fs = MockServer::new().with_tools(&["read"]);
        let cache = cache_with(vec![("fs", fs)]).await;
        cache.preload().await.unwrap();
        assert_eq!(cache.get_cached_snapshot().unwrap().tool_count(), 1);
        assert_eq!(cache.find_server("read").await.unwrap().server_id, "fs");
    }
}
