//! Streaming model adapter trait.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use super::errors::ModelError;
use super::types::{Message, Part, Role, ToolCall, ToolResult, ToolSpec};

/// One item of a model's streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// Text to show as it arrives.
    Text(String),
    /// One or more tool calls the model wants run before it continues.
    ToolCalls(Vec<ToolCall>),
}

pub type AdapterStream = BoxStream<'static, Result<AdapterEvent, ModelError>>;

/// A language model backend that can request tool calls mid-stream.
///
/// Provider wire formats live behind this trait. The stream ends when the
/// model has finished its turn.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Start one round of generation.
    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        cancel: &CancellationToken,
    ) -> Result<AdapterStream, ModelError>;

    /// Append a finished round to the conversation: the assistant turn with
    /// its text and tool calls, then the results.
    fn format_tool_results(
        &self,
        messages: &mut Vec<Message>,
        assistant_text: &str,
        calls: &[ToolCall],
        results: Vec<ToolResult>,
    ) {
        let mut parts = Vec::with_capacity(calls.len() + 1);
        if !assistant_text.is_empty() {
            parts.push(Part::text(assistant_text));
        }
        parts.extend(calls.iter().cloned().map(Part::ToolCall));
        messages.push(Message::from_parts(Role::Assistant, parts));
        messages.push(Message::tool_results(results));
    }

    /// How a tool result appears in the generated text.
    fn render_tool_result(&self, call: &ToolCall, result: &ToolResult) -> String {
        format!("\n\n> **{}**\n> {}\n\n", call.name, result.outcome.text())
    }
}
