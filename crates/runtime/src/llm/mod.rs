//! Conversation types and the streaming model adapter seam.

pub mod adapter;
pub mod errors;
pub mod types;

pub use adapter::{AdapterEvent, AdapterStream, ModelAdapter};
pub use errors::ModelError;
pub use types::{Message, Part, Role, ToolCall, ToolOutcome, ToolResult, ToolSpec};
