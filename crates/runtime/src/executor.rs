//! The single entry point for running a tool call.
//!
//! [`ToolExecutor::execute_tool`] admits the request, resolves the owning
//! server through the discovery snapshot, consults the optional result
//! cache, and calls the server with a timeout and a cancellation token
//! that [`ToolExecutor::cancel_execution`] can fire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mcp::CallToolResult;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::{
    Admission, AdmissionPermit, DocumentSessionState, ExecutionAdmissionTracker,
};
use crate::config::ExecutorConfig;
use crate::discovery::{ToolDiscoveryCache, ToolSource};
use crate::error::ExecutionError;
use crate::history::{ExecutionHistory, ExecutionRecord, ExecutionStatus};
use crate::notify::{LogSink, Notice, NotificationSink, SessionDecision, SessionLimitHandler};
use crate::result_cache::{CacheKey, ResultCache};

/// Who asked for the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionSource {
    UserInvoked,
    AiAutonomous,
}

/// A request to run one tool.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub request_id: String,
    /// Target server. When unset the discovery snapshot decides.
    pub server_id: Option<String>,
    pub tool_name: String,
    pub parameters: Option<Value>,
    pub source: ExecutionSource,
    pub document_path: Option<String>,
    pub section_line: Option<u32>,
    /// Falls back to the executor's default.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl ExecutionRequest {
    pub fn new(tool_name: impl Into<String>, parameters: Option<Value>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            server_id: None,
            tool_name: tool_name.into(),
            parameters,
            source: ExecutionSource::UserInvoked,
            document_path: None,
            section_line: None,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_source(mut self, source: ExecutionSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_document(mut self, path: impl Into<String>) -> Self {
        self.document_path = Some(path.into());
        self
    }

    pub fn with_section_line(mut self, line: u32) -> Self {
        self.section_line = Some(line);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A completed execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub request_id: String,
    pub server_id: String,
    pub tool_name: String,
    pub result: CallToolResult,
    pub duration: Duration,
    pub cached: bool,
    pub cache_age: Option<Duration>,
}

impl ExecutionResult {
    pub fn text(&self) -> String {
        self.result.joined_text()
    }
}

/// Executor counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutorMetrics {
    pub total_executed: u64,
    pub successes: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub cache_hits: u64,
    /// Requests turned away before admission.
    pub rejections: u64,
    pub average_duration: Option<Duration>,
    pub active: usize,
    pub peak_active: usize,
}

#[derive(Default)]
struct Stats {
    successes: u64,
    errors: u64,
    timeouts: u64,
    cancellations: u64,
    cache_hits: u64,
    rejections: u64,
    finished: u32,
    total_duration: Duration,
}

fn status_of(outcome: &Result<ExecutionResult, ExecutionError>) -> ExecutionStatus {
    match outcome {
        Ok(_) => ExecutionStatus::Success,
        Err(ExecutionError::Timeout { .. }) => ExecutionStatus::Timeout,
        Err(ExecutionError::Cancelled) => ExecutionStatus::Cancelled,
        Err(_) => ExecutionStatus::Error,
    }
}

/// Clears an execution's in-flight entry on every exit path. If the
/// `execute_tool` future is dropped before it settles, the history record is
/// finished as cancelled.
struct InFlight<'a> {
    executor: &'a ToolExecutor,
    request_id: &'a str,
    started: Instant,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let executor = self.executor;
        executor.in_flight.lock().remove(self.request_id);
        if self.settled {
            return;
        }

        let elapsed = self.started.elapsed();
        executor.history.lock().update(self.request_id, |record| {
            record.status = ExecutionStatus::Cancelled;
            record.duration = Some(elapsed);
            record.error = Some(ExecutionError::Cancelled.to_string());
        });
        executor.record_stats(&Err(ExecutionError::Cancelled), elapsed);
        debug!(request_id = %self.request_id, "execution dropped before completion");
    }
}

pub struct ToolExecutor {
    source: Arc<dyn ToolSource>,
    discovery: ToolDiscoveryCache,
    admission: ExecutionAdmissionTracker,
    history: Mutex<ExecutionHistory>,
    result_cache: Option<ResultCache>,
    session_handler: RwLock<Option<Arc<dyn SessionLimitHandler>>>,
    sink: Arc<dyn NotificationSink>,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
    default_timeout: Duration,
    stats: Mutex<Stats>,
}

impl ToolExecutor {
    pub fn new(
        config: &ExecutorConfig,
        source: Arc<dyn ToolSource>,
        discovery: ToolDiscoveryCache,
    ) -> Self {
        let result_cache = config
            .result_cache
            .enabled
            .then(|| ResultCache::new(&config.result_cache));
        Self {
            source,
            discovery,
            admission: ExecutionAdmissionTracker::new(
                config.concurrent_limit,
                config.session_limit,
            ),
            history: Mutex::new(ExecutionHistory::new(config.history_capacity)),
            result_cache,
            session_handler: RwLock::new(None),
            sink: Arc::new(LogSink),
            in_flight: Mutex::new(HashMap::new()),
            default_timeout: config.default_timeout(),
            stats: Mutex::new(Stats::default()),
        }
    }

    /// Where session-limit notices go.
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn discovery(&self) -> &ToolDiscoveryCache {
        &self.discovery
    }

    /// Install the callback asked when a document reaches its session limit.
    /// Without one, such calls are rejected.
    pub fn set_session_handler(&self, handler: Option<Arc<dyn SessionLimitHandler>>) {
        *self.session_handler.write() = handler;
    }

    /// Admit, run and record one tool call.
    pub async fn execute_tool(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, ExecutionError> {
        let permit = match self.admit(&request).await {
            Ok(permit) => permit,
            Err(e) => {
                self.stats.lock().rejections += 1;
                debug!(
                    request_id = %request.request_id,
                    tool = %request.tool_name,
                    error = %e,
                    "execution rejected"
                );
                return Err(e);
            }
        };

        self.history.lock().push(ExecutionRecord::pending(&request));
        let token = request.cancel.child_token();
        self.in_flight
            .lock()
            .insert(request.request_id.clone(), token.clone());

        let started = Instant::now();
        let mut guard = InFlight {
            executor: self,
            request_id: &request.request_id,
            started,
            settled: false,
        };
        let outcome = self.run(&request, permit, &token, started).await;
        let elapsed = started.elapsed();

        let status = status_of(&outcome);
        self.history.lock().update(&request.request_id, |record| {
            record.status = status;
            record.duration = Some(elapsed);
            match &outcome {
                Ok(result) => {
                    record.server_id = Some(result.server_id.clone());
                    record.cached = result.cached;
                }
                Err(e) => record.error = Some(e.to_string()),
            }
        });
        guard.settled = true;
        drop(guard);
        self.record_stats(&outcome, elapsed);

        match &outcome {
            Ok(result) => info!(
                request_id = %request.request_id,
                tool = %request.tool_name,
                server_id = %result.server_id,
                cached = result.cached,
                duration_ms = elapsed.as_millis() as u64,
                "tool executed"
            ),
            Err(e) => warn!(
                request_id = %request.request_id,
                tool = %request.tool_name,
                error = %e,
                "tool execution failed"
            ),
        }
        outcome
    }

    /// Pre-check admission without side effects.
    pub fn can_execute(&self, document: Option<&str>) -> bool {
        self.admission.can_execute(document)
    }

    /// Cancel an in-flight execution. Returns false if it is not running.
    pub fn cancel_execution(&self, request_id: &str) -> bool {
        match self.in_flight.lock().get(request_id) {
            Some(token) => {
                debug!(request_id, "cancelling execution");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Reject new executions and cancel the running ones.
    pub fn stop(&self) {
        self.admission.stop();
        let running: Vec<_> = self.in_flight.lock().values().cloned().collect();
        for token in running {
            token.cancel();
        }
        info!("tool execution stopped");
    }

    pub fn resume(&self) {
        self.admission.resume();
        info!("tool execution resumed");
    }

    pub fn is_stopped(&self) -> bool {
        self.admission.is_stopped()
    }

    pub fn active_executions(&self) -> Vec<String> {
        self.admission.active_executions()
    }

    pub fn session_state(&self, document: &str) -> Option<DocumentSessionState> {
        self.admission.session_state(document)
    }

    pub fn reset_session(&self, document: &str) {
        self.admission.reset_session(document);
    }

    pub fn reset_all_sessions(&self) {
        self.admission.reset_all_sessions();
    }

    /// History, oldest first.
    pub fn history(&self) -> Vec<ExecutionRecord> {
        self.history.lock().records()
    }

    pub fn clear_result_cache(&self) {
        if let Some(cache) = &self.result_cache {
            cache.clear();
        }
    }

    pub fn metrics(&self) -> ExecutorMetrics {
        let stats = self.stats.lock();
        ExecutorMetrics {
            total_executed: self.admission.total_executed(),
            successes: stats.successes,
            errors: stats.errors,
            timeouts: stats.timeouts,
            cancellations: stats.cancellations,
            cache_hits: stats.cache_hits,
            rejections: stats.rejections,
            average_duration: (stats.finished > 0).then(|| stats.total_duration / stats.finished),
            active: self.admission.active_count(),
            peak_active: self.admission.peak_active(),
        }
    }

    async fn admit(&self, request: &ExecutionRequest) -> Result<AdmissionPermit, ExecutionError> {
        let document = request.document_path.as_deref();
        let (document, limit, current) =
            match self.admission.try_admit(&request.request_id, document)? {
                Admission::Granted(permit) => return Ok(permit),
                Admission::SessionLimitReached {
                    document,
                    limit,
                    current,
                } => (document, limit, current),
            };

        let handler = self.session_handler.read().clone();
        let decision = match handler {
            Some(handler) => handler.on_session_limit(&document, limit, current).await,
            None => SessionDecision::Cancel,
        };
        debug!(document = %document, limit, current, ?decision, "session limit reached");

        match decision {
            SessionDecision::Continue => self
                .admission
                .admit_over_limit(&request.request_id, &document),
            SessionDecision::Cancel => {
                self.sink.notify(Notice::SessionLimitReached {
                    document: document.clone(),
                    limit,
                    current,
                });
                Err(ExecutionError::SessionLimit {
                    document,
                    limit,
                    current,
                })
            }
        }
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        mut permit: AdmissionPermit,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ExecutionResult, ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        let tool = request.tool_name.as_str();
        let snapshot = self.discovery.get_snapshot(false).await;
        let server_id = match &request.server_id {
            Some(id) if snapshot.server_has_tool(id, tool) => id.clone(),
            Some(id) => {
                return Err(ExecutionError::ToolNotFound(format!("{tool} on server {id}")));
            }
            None => snapshot
                .owner(tool)
                .map(|owner| owner.server_id.clone())
                .ok_or_else(|| ExecutionError::ToolNotFound(tool.to_string()))?,
        };

        let key = self
            .result_cache
            .as_ref()
            .map(|_| CacheKey::new(&server_id, tool, request.parameters.as_ref()));
        if let (Some(cache), Some(key)) = (&self.result_cache, &key) {
            if let Some((result, age)) = cache.get(key) {
                debug!(request_id = %request.request_id, tool, "result cache hit");
                return Ok(ExecutionResult {
                    request_id: request.request_id.clone(),
                    server_id,
                    tool_name: tool.to_string(),
                    result,
                    duration: started.elapsed(),
                    cached: true,
                    cache_age: Some(age),
                });
            }
        }

        let connection = self
            .source
            .connection(&server_id)
            .filter(|c| c.is_connected())
            .ok_or_else(|| ExecutionError::ServerUnavailable(server_id.clone()))?;

        permit.commit_session();
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let result = connection
            .call_tool(tool, request.parameters.clone(), timeout, cancel)
            .await
            .map_err(|e| match e {
                mcp::Error::Timeout => ExecutionError::Timeout {
                    tool: tool.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                },
                mcp::Error::Cancelled => ExecutionError::Cancelled,
                mcp::Error::NotConnected | mcp::Error::ServerExited | mcp::Error::Transport(_) => {
                    ExecutionError::ServerUnavailable(server_id.clone())
                }
                mcp::Error::ToolCallFailed(message) => ExecutionError::ToolFailed {
                    tool: tool.to_string(),
                    message,
                },
                other => ExecutionError::ToolFailed {
                    tool: tool.to_string(),
                    message: other.to_string(),
                },
            })?;

        if let (Some(cache), Some(key)) = (&self.result_cache, key) {
            cache.insert(key, result.clone());
        }

        Ok(ExecutionResult {
            request_id: request.request_id.clone(),
            server_id,
            tool_name: tool.to_string(),
            result,
            duration: started.elapsed(),
            cached: false,
            cache_age: None,
        })
    }

    fn record_stats(&self, outcome: &Result<ExecutionResult, ExecutionError>, elapsed: Duration) {
        let mut stats = self.stats.lock();
        match status_of(outcome) {
            ExecutionStatus::Success => stats.successes += 1,
            ExecutionStatus::Timeout => stats.timeouts += 1,
            ExecutionStatus::Cancelled => stats.cancellations += 1,
            _ => stats.errors += 1,
        }
        if outcome.as_ref().is_ok_and(|r| r.cached) {
            stats.cache_hits += 1;
        }
        stats.finished = stats.finished.saturating_add(1);
        stats.total_duration += elapsed;
    }
}
