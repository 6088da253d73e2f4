//! User-facing notifications.
//!
//! Only two conditions are meant to reach a person directly: a server being
//! auto-disabled and a document hitting its session limit. Everything else
//! is logged.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Notice {
    ServerAutoDisabled {
        server_id: String,
        server_name: String,
        consecutive_failures: u32,
    },
    SessionLimitReached {
        document: String,
        limit: u32,
        current: u32,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerAutoDisabled {
                server_name,
                consecutive_failures,
                ..
            } => write!(
                f,
                "Tool server \"{server_name}\" was disabled after {consecutive_failures} consecutive failures. Re-enable it once the problem is fixed."
            ),
            Self::SessionLimitReached {
                document,
                limit,
                current,
            } => write!(
                f,
                "{document} has used {current} of {limit} tool calls this session."
            ),
        }
    }
}

/// Fire-and-forget notification target.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notice: Notice) {
        warn!(notice = %notice, "user notice");
    }
}

/// What to do when a document reaches its session limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionDecision {
    /// Allow this one call past the limit.
    Continue,
    Cancel,
}

/// Asks the user (or a policy) whether to exceed a session limit.
#[async_trait]
pub trait SessionLimitHandler: Send + Sync {
    async fn on_session_limit(&self, document: &str, limit: u32, current: u32)
    -> SessionDecision;
}

/// A fixed answer, useful for non-interactive callers.
#[async_trait]
impl SessionLimitHandler for SessionDecision {
    async fn on_session_limit(&self, _: &str, _: u32, _: u32) -> SessionDecision {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_disable_notice_reads_well() {
        let notice = Notice::ServerAutoDisabled {
            server_id: "fs".into(),
            server_name: "filesystem".into(),
            consecutive_failures: 3,
        };
        assert!(notice.to_string().contains("\"filesystem\" was disabled after 3"));
    }

    #[tokio::test]
    async fn fixed_decision_handler() {
        let handler: &dyn SessionLimitHandler = &SessionDecision::Cancel;
        assert_eq!(
            handler.on_session_limit("notes.md", 5, 5).await,
            SessionDecision::Cancel
        );
    }
}
