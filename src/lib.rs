//! # mcplex - Multi-server MCP client for Rust
//!
//! A client implementation of the Model Context Protocol (MCP) that can talk
//! to many servers at once over stdio, HTTP, streamable HTTP, and SSE
//! transports, with OAuth 2.1 + PKCE support for the HTTP family.
//!
//! ## Features
//!
//! - 🔌 **Four transports**: child-process stdio, plain HTTP, streamable
//!   HTTP (SSE-formatted POST responses), and long-lived SSE streams
//! - 🗂 **Aggregating client**: one facade over any number of servers with a
//!   coherent, invalidation-aware tool cache
//! - 🔐 **OAuth 2.1**: discovery, dynamic client registration (RFC 7591),
//!   PKCE (S256 only), resource-bound tokens (RFC 8707), token refresh
//! - 🔁 **Resilience**: retry with exponential backoff, SSE liveness pings,
//!   transparent reconnection with a fresh handshake
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mcplex::{Client, ServerConfig};
//! use serde_json::json;
//!
//! # async fn example() -> mcplex::Result<()> {
//! let config: ServerConfig = serde_json::from_value(json!({
//!     "type": "stdio",
//!     "command": "my-mcp-server --verbose",
//! }))?;
//!
//! let client = Client::builder().server(config)?.build();
//! let tools = client.list_tools(true).await?;
//! for tool in &tools {
//!     println!("{} ({})", tool.name, tool.server.server_name);
//! }
//!
//! let result = client.call_tool("echo", json!({"msg": "hi"}), None).await?;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod shared;
pub mod types;

pub use client::{Client, ClientBuilder, Tool, ToolCall, ToolCallOutcome, ToolServer};
pub use config::{load_server_definitions, CommandSpec, ServerConfig};
pub use error::{Error, Result, TransportError};
pub use shared::retry::RetryPolicy;
pub use shared::transport::{McpTransport, TransportState};

/// MCP protocol version implemented by this crate.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Client implementation name advertised during the initialize handshake.
pub const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");

/// Client implementation version advertised during the initialize handshake.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
