//! MCP protocol payload types.
//!
//! Only the client-side subset is modeled: the initialize handshake and the
//! tool catalog. Tool call results stay as raw [`serde_json::Value`] because
//! their shape is server-defined.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Implementation information exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    /// Implementation name (e.g., "mcplex").
    pub name: String,
    /// Implementation version.
    pub version: String,
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol version the server settled on.
    #[serde(default)]
    pub protocol_version: String,
    /// Server capabilities, kept structural.
    #[serde(default)]
    pub capabilities: Value,
    /// Server implementation info.
    pub server_info: Implementation,
    /// Optional onboarding instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// A tool advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Tool name, unique within its server.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema describing the tool's arguments. Servers emit this as
    /// `inputSchema`; the older `schema` spelling is accepted on input.
    #[serde(rename = "inputSchema", alias = "schema", default)]
    pub input_schema: Value,
}

/// Result of a `tools/list` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    /// Tools exposed by the server.
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
    /// Pagination cursor, when the catalog is chunked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}
