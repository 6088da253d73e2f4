//! Tool and result types exposed to the rest of the workspace.
//!
//! The wire protocol itself is handled by `rmcp`; these are the owned,
//! serializable shapes the runtime caches, compares and prints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool definition returned by tools/list.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: Value,
}

impl From<rmcp::model::Tool> for Tool {
    fn from(tool: rmcp::model::Tool) -> Self {
        Self {
            name: tool.name.to_string(),
            description: tool.description.map(|d| d.to_string()),
            input_schema: Value::Object((*tool.input_schema).clone()),
        }
    }
}

/// Result of tools/call.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Build a result holding a single text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Concatenated text of all text blocks, newline separated.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Approximate payload size, used to enforce the output limit.
    pub fn payload_len(&self) -> usize {
        self.content.iter().map(ToolContent::payload_len).sum()
    }
}

impl From<rmcp::model::CallToolResult> for CallToolResult {
    fn from(result: rmcp::model::CallToolResult) -> Self {
        let mut content: Vec<ToolContent> = result
            .content
            .iter()
            .filter_map(|block| serde_json::to_value(block).ok())
            .map(ToolContent::from_wire)
            .collect();

        // Servers that only return structured output still get a text block.
        if content.is_empty() {
            if let Some(structured) = result.structured_content {
                content.push(ToolContent::Text {
                    text: structured.to_string(),
                });
            }
        }

        Self {
            content,
            is_error: result.is_error.unwrap_or(false),
        }
    }
}

/// Content returned by a tool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
}

impl ToolContent {
    /// Get text content if this is a text content block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ToolContent::Text { text } => Some(text),
            _ => None,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            ToolContent::Text { text } => text.len(),
            ToolContent::Image { data, .. } | ToolContent::Audio { data, .. } => data.len(),
            ToolContent::Resource { resource } => resource.to_string().len(),
        }
    }

    /// Map one serialized content block. Block kinds without a dedicated
    /// variant (resource links, future additions) are kept whole as a
    /// resource.
    fn from_wire(value: Value) -> Self {
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        match kind {
            "text" => ToolContent::Text {
                text: field("text"),
            },
            "image" => ToolContent::Image {
                data: field("data"),
                mime_type: field("mimeType"),
            },
            "audio" => ToolContent::Audio {
                data: field("data"),
                mime_type: field("mimeType"),
            },
            "resource" => ToolContent::Resource {
                resource: value.get("resource").cloned().unwrap_or(Value::Null),
            },
            _ => ToolContent::Resource { resource: value },
        }
    }
}
