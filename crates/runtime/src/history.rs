//! Bounded execution history.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::executor::{ExecutionRequest, ExecutionSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Success,
    Error,
    Timeout,
    Cancelled,
}

/// One history entry. Created pending at admission, finished in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub request_id: String,
    pub server_id: Option<String>,
    pub tool_name: String,
    pub source: ExecutionSource,
    pub document_path: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration: Option<Duration>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub cached: bool,
}

impl ExecutionRecord {
    pub(crate) fn pending(request: &ExecutionRequest) -> Self {
        Self {
            request_id: request.request_id.clone(),
            server_id: request.server_id.clone(),
            tool_name: request.tool_name.clone(),
            source: request.source,
            document_path: request.document_path.clone(),
            timestamp: Utc::now(),
            duration: None,
            status: ExecutionStatus::Pending,
            error: None,
            cached: false,
        }
    }
}

/// Ring buffer of records in submission order; the oldest is evicted first.
#[derive(Debug)]
pub struct ExecutionHistory {
    capacity: usize,
    records: VecDeque<ExecutionRecord>,
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, record: ExecutionRecord) {
        if self.capacity == 0 {
            return;
        }
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Update a record in place. Returns false if it was already evicted.
    pub fn update(&mut self, request_id: &str, f: impl FnOnce(&mut ExecutionRecord)) -> bool {
        match self
            .records
            .iter_mut()
            .rev()
            .find(|r| r.request_id == request_id)
        {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    /// Records, oldest first.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
