//! Lifecycle events published by the connection manager.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::ConnectionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    ServerStarted {
        server_id: String,
    },
    ServerStopped {
        server_id: String,
    },
    ServerFailed {
        server_id: String,
        error: ConnectionError,
        consecutive_failures: u32,
    },
    ServerAutoDisabled {
        server_id: String,
        consecutive_failures: u32,
    },
    ServerRetry {
        server_id: String,
        attempt: u32,
        delay: Duration,
    },
}

impl ServerEvent {
    pub fn server_id(&self) -> &str {
        match self {
            Self::ServerStarted { server_id }
            | Self::ServerStopped { server_id }
            | Self::ServerFailed { server_id, .. }
            | Self::ServerAutoDisabled { server_id, .. }
            | Self::ServerRetry { server_id, .. } => server_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServerStarted { .. } => "server-started",
            Self::ServerStopped { .. } => "server-stopped",
            Self::ServerFailed { .. } => "server-failed",
            Self::ServerAutoDisabled { .. } => "server-auto-disabled",
            Self::ServerRetry { .. } => "server-retry",
        }
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.server_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_event_and_server() {
        let event = ServerEvent::ServerAutoDisabled {
            server_id: "fs".into(),
            consecutive_failures: 3,
        };
        assert_eq!(event.to_string(), "server-auto-disabled(fs)");
    }

    #[test]
    fn serializes_with_kebab_tag() {
        let event = ServerEvent::ServerStarted {
            server_id: "fs".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "server-started");
        assert_eq!(json["server_id"], "fs");
    }
}
