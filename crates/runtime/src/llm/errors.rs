use thiserror::Error;

/// Errors from a model adapter.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network: {0}")]
    Network(String),
    #[error("provider api: {0}")]
    Api(String),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("model stream cancelled")]
    Cancelled,
}
