//! Steward runtime: tool-server lifecycle and tool execution.
//!
//! This crate keeps a fleet of tool servers connected and runs tool calls
//! against them, both on direct request and on behalf of a language model.
//!
//! # Overview
//!
//! The runtime is organized around these pieces:
//!
//! - **ServerConnectionManager**: owns one [`ServerConnection`] per
//!   configured server, retries failed connects with backoff, pings live
//!   servers and auto-disables servers that keep failing.
//! - **ToolDiscoveryCache**: an event-invalidated catalog of which server
//!   owns which tool. Concurrent lookups share a single rebuild.
//! - **ToolExecutor**: the single entry point for a tool call. Admission
//!   (stop switch, concurrency ceiling, per-document session ceiling) is
//!   enforced by the [`ExecutionAdmissionTracker`].
//! - **AutonomousToolCallCoordinator**: drives a [`llm::ModelAdapter`]
//!   through rounds of text and tool calls.
//!
//! # Example
//!
//! ```ignore
//! use runtime::{RuntimeConfig, ServerConnectionManager, ToolDiscoveryCache, ToolExecutor};
//! use std::sync::Arc;
//!
//! # async fn example(config: RuntimeConfig) -> runtime::Result<()> {
//! let manager = ServerConnectionManager::new(config.manager.clone());
//! manager.initialize(config.servers.clone()).await?;
//!
//! let discovery = ToolDiscoveryCache::new(
//!     Arc::new(manager.clone()),
//!     config.discovery.list_tools_timeout(),
//! );
//! discovery.attach(manager.subscribe());
//!
//! let executor = ToolExecutor::new(&config.executor, Arc::new(manager.clone()), discovery);
//! let result = executor
//!     .execute_tool(runtime::ExecutionRequest::new("read_file", None))
//!     .await?;
//! println!("{}", result.text());
//! # Ok(())
//! # }
//! ```

mod admission;
mod config;
mod connection;
mod coordinator;
mod discovery;
mod document;
mod error;
mod events;
mod executor;
mod history;
pub mod llm;
mod manager;
mod notify;
mod result_cache;
mod retry;

#[cfg(test)]
mod testing;

// Configuration
pub use config::{
    ConfigError, DiscoveryConfig, ExecutorConfig, ManagerConfig, ResultCacheConfig,
    RuntimeConfig, ServerDescriptor, TransportConfig,
};

// Server lifecycle
pub use connection::{ConnectionState, ServerConnection, ServerFactory, Transition, TransportFactory};
pub use events::ServerEvent;
pub use manager::{ManagerBuilder, PingOutcome, ServerConnectionManager, ServerHealthStatus};
pub use retry::{
    DEFAULT_TRANSIENT_CODES, GiveUpReason, RetryDecision, RetryPolicy, RetryState,
    RetrySupervisor,
};

// Discovery
pub use discovery::{
    DiscoveryMetrics, ServerTools, ToolCatalogSnapshot, ToolDescriptor, ToolDiscoveryCache,
    ToolOwner, ToolSource,
};

// Execution
pub use admission::{Admission, AdmissionPermit, DocumentSessionState, ExecutionAdmissionTracker};
pub use executor::{
    ExecutionRequest, ExecutionResult, ExecutionSource, ExecutorMetrics, ToolExecutor,
};
pub use history::{ExecutionHistory, ExecutionRecord, ExecutionStatus};
pub use result_cache::{CacheKey, ResultCache};

// Autonomous generation
pub use coordinator::{
    AutonomousToolCallCoordinator, CoordinatorChunk, GenerateOptions, ToolFailurePolicy,
};
pub use document::{DocumentError, DocumentGuard, DocumentLock, DocumentWriter, FileWriter, MemoryWriter};

// Notifications
pub use notify::{LogSink, Notice, NotificationSink, SessionDecision, SessionLimitHandler};

// Error types
pub use error::{
    ConnectionError, CoordinatorError, Error, ExecutionError, ManagerError, Result,
};
