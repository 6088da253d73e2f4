//! Configuration loading from steward.toml.

use std::path::{Path, PathBuf};

use runtime::RuntimeConfig;

pub const CONFIG_FILE: &str = "steward.toml";

/// Load and validate a runtime configuration file.
pub fn load(path: impl AsRef<Path>) -> Result<RuntimeConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&content)
}

pub fn parse(toml: &str) -> Result<RuntimeConfig, ConfigError> {
    Ok(RuntimeConfig::from_toml(toml)?)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(#[from] runtime::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime::TransportConfig;

    #[test]
    fn parses_servers_and_limits() {
        let config = parse(
            r#"
            [executor]
            concurrent_limit = 2
            session_limit = 10

            [[servers]]
            id = "fs"
            name = "Filesystem"
            transport = { kind = "stdio", command = "mcp-fs", args = ["--root", "."] }

            [[servers]]
            id = "search"
            enabled = false
            transport = { kind = "event-stream", url = "http://localhost:8080/mcp" }
            "#,
        )
        .unwrap();

        assert_eq!(config.executor.concurrent_limit, 2);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].display_name(), "Filesystem");
        assert!(matches!(
            &config.servers[0].transport,
            TransportConfig::Stdio { command, .. } if command == "mcp-fs"
        ));
        assert!(!config.servers[1].enabled);
        assert_eq!(config.servers[1].transport.kind(), "event-stream");
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = parse(
            r#"
            [[servers]]
            id = "fs"
            transport = { kind = "stdio", command = "a" }

            [[servers]]
            id = "fs"
            transport = { kind = "stdio", command = "b" }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate server id"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load("/nonexistent/steward.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/steward.toml"));
    }
}
