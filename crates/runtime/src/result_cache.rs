//! TTL cache for successful tool results.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mcp::CallToolResult;
use moka::sync::Cache;
use serde_json::{Map, Value};

use crate::config::ResultCacheConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    server_id: String,
    tool: String,
    params: String,
}

impl CacheKey {
    /// Parameters are normalized so key order does not matter.
    pub fn new(server_id: &str, tool: &str, params: Option<&Value>) -> Self {
        let params = params.map(normalize).unwrap_or(Value::Null).to_string();
        Self {
            server_id: server_id.to_string(),
            tool: tool.to_string(),
            params,
        }
    }
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), normalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

#[derive(Debug)]
struct Entry {
    result: CallToolResult,
    stored_at: Instant,
}

/// Successful results keyed by server, tool and parameters.
///
/// Backed by a concurrent `moka` cache, so lookups never block each other
/// and expiry and capacity eviction happen inside the cache.
#[derive(Clone)]
pub struct ResultCache {
    entries: Option<Cache<CacheKey, Arc<Entry>>>,
}

impl ResultCache {
    pub fn new(config: &ResultCacheConfig) -> Self {
        Self::with_ttl(config.ttl(), config.max_entries)
    }

    pub fn with_ttl(ttl: Duration, max_entries: usize) -> Self {
        let entries = (max_entries > 0).then(|| {
            Cache::builder()
                .time_to_live(ttl)
                .max_capacity(max_entries as u64)
                .build()
        });
        Self { entries }
    }

    /// A live entry and its age.
    pub fn get(&self, key: &CacheKey) -> Option<(CallToolResult, Duration)> {
        let entry = self.entries.as_ref()?.get(key)?;
        Some((entry.result.clone(), entry.stored_at.elapsed()))
    }

    pub fn insert(&self, key: CacheKey, result: CallToolResult) {
        if let Some(entries) = &self.entries {
            let entry = Entry {
                result,
                stored_at: Instant::now(),
            };
            entries.insert(key, Arc::new(entry));
        }
    }

    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.invalidate_all();
        }
    }

    /// Number of live entries after pending evictions are applied.
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| {
            entries.run_pending_tasks();
            entries.entry_count() as usize
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
