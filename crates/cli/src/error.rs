//! CLI error types.

use thiserror::Error;

use crate::config::ConfigError;

/// CLI errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `--args` was not valid JSON.
    #[error("invalid tool arguments: {0}")]
    Arguments(#[from] serde_json::Error),

    #[error(transparent)]
    Manager(#[from] runtime::ManagerError),

    #[error(transparent)]
    Execution(#[from] runtime::ExecutionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
