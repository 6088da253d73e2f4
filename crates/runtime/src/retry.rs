//! Exponential backoff with jitter.
//!
//! [`RetrySupervisor`] is a small state machine: callers report each failed
//! attempt and get back a [`RetryDecision`]. It does not sleep or spawn
//! anything itself, so the same supervisor drives connection retries in the
//! manager and can back any other retry loop.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Error codes retried by default.
pub const DEFAULT_TRANSIENT_CODES: &[&str] = &[
    "timeout",
    "connection_refused",
    "connection_reset",
    "broken_pipe",
    "server_exited",
    "http_unavailable",
];

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per cycle, including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Scale each delay by a uniform factor in `[0, 1)`.
    pub jitter: bool,
    /// Error codes that trigger a retry. Anything else fails immediately.
    pub transient_codes: BTreeSet<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
            transient_codes: DEFAULT_TRANSIENT_CODES
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn is_transient(&self, code: &str) -> bool {
        self.transient_codes.contains(code)
    }

    /// Un-jittered delay before retry number `attempt` (1-based):
    /// `min(max_delay, initial_delay * multiplier^(attempt - 1))`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// The full un-jittered schedule for one cycle.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|a| self.base_delay(a)).collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err("retry.backoff_multiplier must be a finite number >= 1.0".to_string());
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err("retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string());
        }
        Ok(())
    }
}

/// Observable retry progress for one server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryState {
    pub is_retrying: bool,
    pub current_attempt: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub backoff_intervals: Vec<Duration>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The error code is not in the transient set.
    NonTransient,
    /// `max_attempts` reached.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct RetrySupervisor {
    policy: RetryPolicy,
    state: RetryState,
}

impl RetrySupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::default(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }

    /// Record a failed attempt and decide what happens next.
    pub fn record_failure(&mut self, code: &str, message: impl Into<String>) -> RetryDecision {
        self.state.current_attempt += 1;
        self.state.last_error = Some(message.into());
        if self.state.backoff_intervals.is_empty() {
            self.state.backoff_intervals = self.policy.schedule();
        }

        let reason = if !self.policy.is_transient(code) {
            Some(GiveUpReason::NonTransient)
        } else if self.state.current_attempt >= self.policy.max_attempts {
            Some(GiveUpReason::Exhausted)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.state.is_retrying = false;
            self.state.next_retry_at = None;
            return RetryDecision::GiveUp(reason);
        }

        let delay = self.delay_for(self.state.current_attempt);
        self.state.is_retrying = true;
        self.state.next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
        RetryDecision::RetryAfter(delay)
    }

    /// Start a new cycle. The last error survives for diagnostics.
    pub fn begin_cycle(&mut self) {
        self.state.current_attempt = 0;
        self.abandon();
    }

    /// Stop retrying without touching the attempt count.
    pub fn abandon(&mut self) {
        self.state.is_retrying = false;
        self.state.next_retry_at = None;
    }

    /// Back to idle, keeping nothing from the previous cycle.
    pub fn reset(&mut self) {
        self.state = RetryState::default();
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay(attempt);
        if self.policy.jitter {
            base.mul_f64(rand::thread_rng().gen_range(0.0..1.0))
        } else {
            base
        }
    }
}
