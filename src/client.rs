//! Aggregating client facade over any number of MCP servers.
//!
//! The client owns a registry of transports, merges their tool catalogs
//! into one cache, routes tool calls to the owning server (demanding
//! disambiguation when a name is served by several), and fans
//! server-originated notifications out to registered listeners. A built-in
//! listener invalidates the tool cache whenever any server announces
//! `notifications/tools/list_changed`.

use crate::auth::OAuthProvider;
use crate::config::{create_transport, create_transport_with_oauth, ServerConfig};
use crate::error::{Error, Result};
use crate::shared::transport::McpTransport;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Listener for server-originated notifications: `(server_name, method,
/// params)`. Listeners run on transport reader tasks and must not block.
pub type NotificationCallback = Arc<dyn Fn(&str, &str, Option<&Value>) + Send + Sync>;

/// Non-owning back-reference from a tool to the server that provides it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolServer {
    /// Index into the client's server registry.
    pub index: usize,
    /// Registry name of the server.
    pub server_name: String,
}

/// A tool discovered via `tools/list`, annotated with its owning server.
///
/// Tool identity within a client is `(server, name)`; the name alone may be
/// ambiguous across servers.
#[derive(Debug, Clone)]
pub struct Tool {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments.
    pub schema: Value,
    /// The server providing this tool.
    pub server: ToolServer,
}

impl Tool {
    /// Project into the `{name, description, parameters}` shape most
    /// function-calling APIs accept. Vendor-specific envelopes belong to
    /// the embedder.
    pub fn to_function_spec(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description.clone().unwrap_or_default(),
            "parameters": self.schema,
        })
    }
}

/// One entry in a [`Client::call_tools`] batch.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Tool name.
    pub name: String,
    /// Tool arguments.
    pub arguments: Value,
    /// Optional server name for disambiguation.
    pub server: Option<String>,
}

/// Outcome of one batch entry; failures are captured, not propagated.
#[derive(Debug)]
pub struct ToolCallOutcome {
    /// Tool name from the request.
    pub name: String,
    /// Server name from the request.
    pub server: Option<String>,
    /// The call's result or error.
    pub result: Result<Value>,
}

struct ServerEntry {
    name: String,
    transport: Arc<dyn McpTransport>,
}

struct ClientInner {
    servers: Vec<ServerEntry>,
    tool_cache: RwLock<Option<Vec<Tool>>>,
    listeners: RwLock<Vec<NotificationCallback>>,
}

impl ClientInner {
    fn handle_notification(&self, server_name: &str, method: &str, params: Option<&Value>) {
        if method == "notifications/tools/list_changed" {
            debug!(server = server_name, "tool catalog changed; invalidating cache");
            *self.tool_cache.write() = None;
        }
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(server_name, method, params);
        }
    }
}

/// Builder for [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    entries: Vec<(Option<String>, Arc<dyn McpTransport>)>,
}

impl ClientBuilder {
    /// Add a server from a configuration record.
    pub fn server(mut self, config: ServerConfig) -> Result<Self> {
        let transport = create_transport(&config)?;
        self.entries.push((config.name().map(str::to_string), transport));
        Ok(self)
    }

    /// Add an HTTP-family server with an OAuth provider attached.
    pub fn server_with_oauth(
        mut self,
        config: ServerConfig,
        oauth: Arc<OAuthProvider>,
    ) -> Result<Self> {
        let transport = create_transport_with_oauth(&config, Some(oauth))?;
        self.entries.push((config.name().map(str::to_string), transport));
        Ok(self)
    }

    /// Add a pre-built transport (custom implementations, tests).
    pub fn transport(mut self, transport: Arc<dyn McpTransport>) -> Self {
        self.entries
            .push((transport.name().map(str::to_string), transport));
        self
    }

    /// Build the client and wire up notification routing.
    pub fn build(self) -> Client {
        let servers: Vec<ServerEntry> = self
            .entries
            .into_iter()
            .enumerate()
            .map(|(index, (name, transport))| ServerEntry {
                name: name.unwrap_or_else(|| format!("server-{index}")),
                transport,
            })
            .collect();

        for (i, a) in servers.iter().enumerate() {
            if servers.iter().skip(i + 1).any(|b| b.name == a.name) {
                warn!(name = %a.name, "duplicate server name; disambiguation by name will be unreliable");
            }
        }

        let inner = Arc::new(ClientInner {
            servers,
            tool_cache: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
        });

        // Each transport reports notifications tagged with its registry
        // name. The handler holds a weak reference: transports must not keep
        // the client alive.
        for entry in &inner.servers {
            let weak: Weak<ClientInner> = Arc::downgrade(&inner);
            let server_name = entry.name.clone();
            entry
                .transport
                .set_notification_handler(Arc::new(move |method, params| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_notification(&server_name, method, params);
                    }
                }));
        }

        Client { inner }
    }
}

/// Aggregating MCP client.
///
/// # Examples
///
/// ```rust,no_run
/// use mcplex::Client;
/// use serde_json::json;
///
/// # async fn example() -> mcplex::Result<()> {
/// let configs = mcplex::load_server_definitions("servers.json")?;
/// let client = Client::new(configs)?;
///
/// for tool in client.list_tools(true).await? {
///     println!("{}: {}", tool.server.server_name, tool.name);
/// }
/// let result = client.call_tool("search", json!({"q": "rust"}), None).await?;
/// println!("{result}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("servers", &self.server_names())
            .field("cached_tools", &self.inner.tool_cache.read().as_ref().map(Vec::len))
            .finish()
    }
}

impl Client {
    /// Build a client from server configurations.
    pub fn new(configs: Vec<ServerConfig>) -> Result<Self> {
        let mut builder = Self::builder();
        for config in configs {
            builder = builder.server(config)?;
        }
        Ok(builder.build())
    }

    /// Build a client from a server-definition file.
    pub fn from_definition_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(crate::config::load_server_definitions(path)?)
    }

    /// Start building a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Registry names, in registration order.
    pub fn server_names(&self) -> Vec<String> {
        self.inner.servers.iter().map(|s| s.name.clone()).collect()
    }

    /// The transport registered under `name`.
    pub fn transport(&self, name: &str) -> Option<Arc<dyn McpTransport>> {
        self.inner
            .servers
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.transport.clone())
    }

    /// List every tool across all servers.
    ///
    /// With `cache_ok`, a previously merged catalog is returned as-is; it
    /// stays valid until [`clear_cache`](Self::clear_cache) or any server's
    /// `notifications/tools/list_changed`. A failing server fails the whole
    /// call rather than silently shrinking the catalog.
    pub async fn list_tools(&self, cache_ok: bool) -> Result<Vec<Tool>> {
        if cache_ok {
            if let Some(tools) = self.inner.tool_cache.read().clone() {
                return Ok(tools);
            }
        }

        let mut merged = Vec::new();
        for (index, entry) in self.inner.servers.iter().enumerate() {
            entry.transport.connect().await?;
            let tools = entry.transport.list_tools().await?;
            merged.extend(tools.into_iter().map(|info| Tool {
                name: info.name,
                description: info.description,
                schema: info.input_schema,
                server: ToolServer {
                    index,
                    server_name: entry.name.clone(),
                },
            }));
        }
        *self.inner.tool_cache.write() = Some(merged.clone());
        Ok(merged)
    }

    /// Drop the cached tool catalog.
    pub fn clear_cache(&self) {
        *self.inner.tool_cache.write() = None;
    }

    /// Tools whose names match `pattern` (a regex; plain substrings work).
    pub async fn find_tools(&self, pattern: &str) -> Result<Vec<Tool>> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid tool pattern '{pattern}': {e}")))?;
        Ok(self
            .list_tools(true)
            .await?
            .into_iter()
            .filter(|tool| regex.is_match(&tool.name))
            .collect())
    }

    /// First tool matching `pattern`.
    pub async fn find_tool(&self, pattern: &str) -> Result<Tool> {
        self.find_tools(pattern)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::ToolNotFound(pattern.to_string()))
    }

    /// Call a tool by name.
    ///
    /// When several servers expose the name, `server` must pick one or the
    /// call fails with [`Error::AmbiguousTool`].
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        server: Option<&str>,
    ) -> Result<Value> {
        let transport = self.resolve_tool(name, server).await?;
        transport.call_tool(name, arguments).await
    }

    /// Call several tools sequentially, capturing per-item failures.
    pub async fn call_tools(&self, batch: Vec<ToolCall>) -> Vec<ToolCallOutcome> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for call in batch {
            let result = self
                .call_tool(&call.name, call.arguments.clone(), call.server.as_deref())
                .await;
            outcomes.push(ToolCallOutcome {
                name: call.name,
                server: call.server,
                result,
            });
        }
        outcomes
    }

    /// Call a tool, receiving the result as a finite stream.
    ///
    /// Every transport currently yields exactly one element (the final
    /// result); the stream shape leaves room for partial results once the
    /// protocol defines them.
    pub async fn call_tool_streaming(
        &self,
        name: &str,
        arguments: Value,
        server: Option<&str>,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        let transport = self.resolve_tool(name, server).await?;
        let name = name.to_string();
        Ok(Box::pin(futures::stream::once(async move {
            transport.call_tool(&name, arguments).await
        })))
    }

    /// Register a listener for server-originated notifications.
    pub fn on_notification(&self, listener: NotificationCallback) {
        self.inner.listeners.write().push(listener);
    }

    /// Tear down every transport. Idempotent; per-server failures are
    /// logged, not propagated.
    pub async fn cleanup(&self) {
        for entry in &self.inner.servers {
            if let Err(e) = entry.transport.cleanup().await {
                warn!(server = %entry.name, error = %e, "transport cleanup failed");
            }
        }
        self.clear_cache();
    }

    /// Resolve a tool name (and optional server name) to the owning
    /// transport.
    async fn resolve_tool(
        &self,
        name: &str,
        server: Option<&str>,
    ) -> Result<Arc<dyn McpTransport>> {
        if let Some(server_name) = server {
            if !self.inner.servers.iter().any(|s| s.name == server_name) {
                return Err(Error::ServerNotFound(server_name.to_string()));
            }
        }

        let tools = self.list_tools(true).await?;
        let matches: Vec<&Tool> = tools
            .iter()
            .filter(|tool| {
                tool.name == name && server.map_or(true, |s| tool.server.server_name == s)
            })
            .collect();

        match matches.as_slice() {
            [] => Err(Error::ToolNotFound(name.to_string())),
            [tool] => Ok(self.inner.servers[tool.server.index].transport.clone()),
            many => Err(Error::AmbiguousTool {
                name: name.to_string(),
                servers: many
                    .iter()
                    .map(|tool| tool.server.server_name.clone())
                    .collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_generates_names_for_anonymous_servers() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"type": "http", "base_url": "http://localhost:1"}"#).unwrap();
        let named: ServerConfig = serde_json::from_str(
            r#"{"type": "http", "base_url": "http://localhost:2", "name": "beta"}"#,
        )
        .unwrap();
        let client = Client::builder()
            .server(config)
            .unwrap()
            .server(named)
            .unwrap()
            .build();
        assert_eq!(client.server_names(), vec!["server-0", "beta"]);
        assert!(client.transport("beta").is_some());
        assert!(client.transport("nope").is_none());
    }

    #[tokio::test]
    async fn unknown_server_name_is_reported_before_tool_lookup() {
        let client = Client::builder().build();
        match client.call_tool("echo", Value::Null, Some("ghost")).await {
            Err(Error::ServerNotFound(name)) => assert_eq!(name, "ghost"),
            other => panic!("expected ServerNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_find_pattern_is_a_config_error() {
        let client = Client::builder().build();
        assert!(matches!(
            client.find_tools("[unclosed").await,
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn tool_projects_into_function_spec() {
        let tool = Tool {
            name: "echo".into(),
            description: Some("repeat the input".into()),
            schema: serde_json::json!({"type": "object"}),
            server: ToolServer {
                index: 0,
                server_name: "local".into(),
            },
        };
        assert_eq!(
            tool.to_function_spec(),
            serde_json::json!({
                "name": "echo",
                "description": "repeat the input",
                "parameters": {"type": "object"},
            })
        );
    }

    #[tokio::test]
    async fn empty_registry_lists_no_tools() {
        let client = Client::builder().build();
        assert!(client.list_tools(true).await.unwrap().is_empty());
        client.cleanup().await;
        client.cleanup().await;
    }
}
