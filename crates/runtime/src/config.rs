//! Configuration for the tool-server engine.
//!
//! Every section has defaults so an empty document is a valid config.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Errors that can occur when parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub manager: ManagerConfig,
    pub executor: ExecutorConfig,
    pub discovery: DiscoveryConfig,
    pub servers: Vec<ServerDescriptor>,
}

impl RuntimeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.id.trim().is_empty() {
                return Err(ConfigError::Invalid("server id must not be empty".into()));
            }
            if !seen.insert(server.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server id: {}",
                    server.id
                )));
            }
        }
        if self.executor.concurrent_limit == 0 {
            return Err(ConfigError::Invalid(
                "executor.concurrent_limit must be at least 1".into(),
            ));
        }
        if self.executor.session_limit == 0 {
            return Err(ConfigError::Invalid(
                "executor.session_limit must be at least 1".into(),
            ));
        }
        if self.manager.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "manager.failure_threshold must be at least 1".into(),
            ));
        }
        self.manager.retry.validate().map_err(ConfigError::Invalid)
    }
}

/// How to reach a tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransportConfig {
    /// A subprocess speaking JSON-RPC over stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    /// An HTTP endpoint answering with JSON or an event stream.
    EventStream {
        url: String,
        /// Bearer token sent with every request.
        #[serde(default)]
        auth_token: Option<String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::EventStream { .. } => "event-stream",
        }
    }
}

/// One configured tool server.
///
/// The runtime fields are owned by the connection manager and never read
/// from or written to the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub transport: TransportConfig,

    #[serde(skip)]
    pub failure_count: u32,
    #[serde(skip)]
    pub auto_disabled: bool,
    #[serde(skip)]
    pub last_connected_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl ServerDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            transport,
            failure_count: 0,
            auto_disabled: false,
            last_connected_at: None,
        }
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Whether two descriptors launch the same server the same way.
    pub fn same_launch(&self, other: &Self) -> bool {
        self.name == other.name && self.transport == other.transport
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Consecutive failures before a server is auto-disabled.
    pub failure_threshold: u32,
    pub health_check_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub ping_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            health_check_interval_secs: 60,
            connect_timeout_secs: 30,
            ping_timeout_secs: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub concurrent_limit: usize,
    pub session_limit: u32,
    pub default_timeout_secs: u64,
    pub history_capacity: usize,
    pub result_cache: ResultCacheConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrent_limit: 3,
            session_limit: 25,
            default_timeout_secs: 30,
            history_capacity: 100,
            result_cache: ResultCacheConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultCacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 300,
            max_entries: 256,
        }
    }
}

impl ResultCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub list_tools_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            list_tools_timeout_secs: 10,
        }
    }
}

impl DiscoveryConfig {
    pub fn list_tools_timeout(&self) -> Duration {
        Duration::from_secs(self.list_tools_timeout_secs)
    }
}
