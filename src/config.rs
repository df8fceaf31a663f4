//! Server definitions and the transport factory.
//!
//! A server-definition file is a JSON document holding either one
//! configuration object or an array of them. Each entry is tagged with a
//! `type` (`stdio`, `sse`, `http`, `streamable_http`); entries with unknown
//! types are skipped with a warning so one exotic entry cannot take down a
//! whole config file.

use crate::auth::OAuthProvider;
use crate::error::{Error, Result};
use crate::shared::retry::RetryPolicy;
use crate::shared::{
    HttpTransport, McpTransport, SseTransport, StdioTransport, StreamableHttpTransport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// A stdio command: either a single command line or an argument vector.
///
/// The string form is split without any shell, so shell metacharacters have
/// no effect; use the vector form to pass arguments containing spaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    /// A command line split on whitespace, honoring single and double quotes.
    Line(String),
    /// An explicit argument vector.
    Argv(Vec<String>),
}

impl CommandSpec {
    /// Resolve into an argument vector.
    pub fn to_argv(&self) -> Result<Vec<String>> {
        match self {
            Self::Line(line) => split_command(line),
            Self::Argv(argv) => {
                if argv.is_empty() {
                    return Err(Error::Config("stdio command must not be empty".into()));
                }
                Ok(argv.clone())
            },
        }
    }
}

/// Split a command line into arguments without invoking a shell.
///
/// Supports single- and double-quoted words and backslash escapes outside
/// single quotes. Metacharacters like `|` or `$` are ordinary characters.
pub fn split_command(line: &str) -> Result<Vec<String>> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            },
            Some('"') => match c {
                '"' => quote = None,
                '\\' => match chars.next() {
                    Some(escaped @ ('"' | '\\')) => current.push(escaped),
                    Some(other) => {
                        current.push('\\');
                        current.push(other);
                    },
                    None => return Err(Error::Config("trailing backslash in command".into())),
                },
                _ => current.push(c),
            },
            _ => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                },
                '\\' => {
                    let escaped = chars
                        .next()
                        .ok_or_else(|| Error::Config("trailing backslash in command".into()))?;
                    current.push(escaped);
                    in_word = true;
                },
                c if c.is_whitespace() => {
                    if in_word {
                        argv.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                },
                _ => {
                    current.push(c);
                    in_word = true;
                },
            },
        }
    }
    if quote.is_some() {
        return Err(Error::Config(format!("unterminated quote in command: {line}")));
    }
    if in_word {
        argv.push(current);
    }
    if argv.is_empty() {
        return Err(Error::Config("stdio command must not be empty".into()));
    }
    Ok(argv)
}

fn default_endpoint() -> String {
    "/rpc".to_string()
}

fn default_read_timeout() -> u64 {
    30
}

fn default_ping() -> u64 {
    10
}

fn default_sse_retries() -> u32 {
    0
}

fn default_http_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    1
}

/// stdio server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioConfig {
    /// Command to spawn.
    pub command: CommandSpec,
    /// Environment variables merged into the child environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Seconds to wait for each response.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    /// Display name used by the client registry.
    #[serde(default)]
    pub name: Option<String>,
}

/// SSE server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    /// URL of the event stream.
    pub base_url: String,
    /// Extra headers sent on the stream request and every POST.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Seconds to wait for each response.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    /// Seconds of silence before the liveness monitor pings.
    #[serde(default = "default_ping")]
    pub ping: u64,
    /// Retries for failed POSTs and reconnect attempts.
    #[serde(default = "default_sse_retries")]
    pub retries: u32,
    /// Base backoff in seconds between retries.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: u64,
    /// Display name used by the client registry.
    #[serde(default)]
    pub name: Option<String>,
}

/// HTTP / streamable HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Server base URL.
    pub base_url: String,
    /// JSON-RPC endpoint path resolved against `base_url`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Extra headers sent on every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Seconds to wait for each response.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    /// Retries for failed requests.
    #[serde(default = "default_http_retries")]
    pub retries: u32,
    /// Base backoff in seconds between retries.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: u64,
    /// Display name used by the client registry.
    #[serde(default)]
    pub name: Option<String>,
}

/// One server definition, tagged by transport type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerConfig {
    /// Child process over stdio.
    Stdio(StdioConfig),
    /// Long-lived SSE stream plus POSTed requests.
    Sse(SseConfig),
    /// Plain HTTP request/response.
    Http(HttpConfig),
    /// HTTP with SSE-formatted response bodies.
    StreamableHttp(HttpConfig),
}

impl ServerConfig {
    /// Configured display name, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Stdio(c) => c.name.as_deref(),
            Self::Sse(c) => c.name.as_deref(),
            Self::Http(c) | Self::StreamableHttp(c) => c.name.as_deref(),
        }
    }
}

/// Load server definitions from a JSON file.
///
/// The document may be a single configuration object or an array. Entries
/// whose `type` is missing or unknown are skipped with a warning; entries
/// with a known type but invalid fields fail the load.
pub fn load_server_definitions(path: impl AsRef<Path>) -> Result<Vec<ServerConfig>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    parse_server_definitions(&content)
}

/// Parse server definitions from a JSON string. See
/// [`load_server_definitions`].
pub fn parse_server_definitions(content: &str) -> Result<Vec<ServerConfig>> {
    let document: Value = serde_json::from_str(content)
        .map_err(|e| Error::Config(format!("invalid server definition JSON: {e}")))?;
    let entries = match document {
        Value::Array(entries) => entries,
        object @ Value::Object(_) => vec![object],
        _ => {
            return Err(Error::Config(
                "server definitions must be a JSON object or array".into(),
            ))
        },
    };

    let mut configs = Vec::new();
    for entry in entries {
        let type_tag = entry
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        match type_tag.as_deref() {
            Some("stdio" | "sse" | "http" | "streamable_http") => {
                let config: ServerConfig = serde_json::from_value(entry)
                    .map_err(|e| Error::Config(format!("invalid server definition: {e}")))?;
                configs.push(config);
            },
            Some(unknown) => {
                warn!(server_type = unknown, "ignoring server definition with unknown type");
            },
            None => {
                warn!("ignoring server definition without a type field");
            },
        }
    }
    Ok(configs)
}

/// Construct a transport from a server definition.
pub fn create_transport(config: &ServerConfig) -> Result<Arc<dyn McpTransport>> {
    create_transport_with_oauth(config, None)
}

/// Construct a transport, attaching an OAuth provider to HTTP-family
/// transports. A provider on a stdio or SSE definition is rejected.
pub fn create_transport_with_oauth(
    config: &ServerConfig,
    oauth: Option<Arc<OAuthProvider>>,
) -> Result<Arc<dyn McpTransport>> {
    match config {
        ServerConfig::Stdio(c) => {
            if oauth.is_some() {
                return Err(Error::Config(
                    "OAuth providers only apply to http and streamable_http servers".into(),
                ));
            }
            let transport = StdioTransport::new(
                c.command.to_argv()?,
                c.env.clone(),
                Duration::from_secs(c.read_timeout),
                c.name.clone(),
            )?;
            Ok(Arc::new(transport))
        },
        ServerConfig::Sse(c) => {
            if oauth.is_some() {
                return Err(Error::Config(
                    "OAuth providers only apply to http and streamable_http servers".into(),
                ));
            }
            let transport = SseTransport::new(
                &c.base_url,
                c.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                Duration::from_secs(c.read_timeout),
                Duration::from_secs(c.ping),
                RetryPolicy::new(c.retries, c.retry_backoff),
                c.name.clone(),
            )?;
            Ok(Arc::new(transport))
        },
        ServerConfig::Http(c) => {
            let transport = HttpTransport::new(
                &c.base_url,
                &c.endpoint,
                c.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                Duration::from_secs(c.read_timeout),
                RetryPolicy::new(c.retries, c.retry_backoff),
                c.name.clone(),
                oauth,
            )?;
            Ok(Arc::new(transport))
        },
        ServerConfig::StreamableHttp(c) => {
            let transport = StreamableHttpTransport::new(
                &c.base_url,
                &c.endpoint,
                c.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                Duration::from_secs(c.read_timeout),
                RetryPolicy::new(c.retries, c.retry_backoff),
                c.name.clone(),
                oauth,
            )?;
            Ok(Arc::new(transport))
        },
    }
}
