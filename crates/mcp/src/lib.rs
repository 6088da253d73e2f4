//! MCP (Model Context Protocol) client library.
//!
//! This crate wraps the `rmcp` SDK behind the [`ToolServer`] abstraction.
//! Two transports are provided: a child process over stdio
//! ([`StdioServer`]) and a streamable HTTP endpoint ([`HttpServer`]).
//! Failures are reported as [`Error`] values with stable codes that retry
//! policies can match on.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{ServerConfig, StdioServer, ToolServer};
//! use std::collections::HashMap;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> mcp::Result<()> {
//! let server = StdioServer::new(ServerConfig {
//!     name: "filesystem".to_string(),
//!     command: "mcp-filesystem".to_string(),
//!     args: vec!["--root".to_string(), "./workspace".to_string()],
//!     env: HashMap::new(),
//!     cwd: None,
//! });
//!
//! let cancel = CancellationToken::new();
//! server.connect(&cancel).await?;
//!
//! for tool in server.list_tools(&cancel).await? {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let result = server
//!     .call_tool(
//!         "read_file",
//!         Some(serde_json::json!({ "path": "./README.md" })),
//!         Duration::from_secs(30),
//!         &cancel,
//!     )
//!     .await?;
//! println!("{}", result.joined_text());
//!
//! server.disconnect().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod http;
mod protocol;
mod session;
mod stdio;

pub use client::ToolServer;
pub use error::{Error, Result};
pub use http::{HttpConfig, HttpServer};
pub use protocol::{CallToolResult, Tool, ToolContent};
pub use session::{DEFAULT_TIMEOUT, MAX_OUTPUT_SIZE};
pub use stdio::{ServerConfig, StdioServer};
