//! The transport contract shared by every carrier.
//!
//! A transport owns one connection to one MCP server: it frames JSON-RPC,
//! correlates responses by id, runs the initialize handshake, and forwards
//! server-originated notifications to a registered handler.

use crate::error::{Result, TransportError};
use crate::types::{Implementation, JSONRPCResponse, ListToolsResult, ToolInfo};
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::warn;

/// Handler invoked for every server-originated notification.
///
/// Receives the method name and optional params. Handlers run on the
/// transport's reader task and must not block.
pub type NotificationHandler = std::sync::Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

/// Connection lifecycle of a transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No connection; the initial state and where I/O errors return to.
    Disconnected,
    /// Connection attempt in flight.
    Connecting,
    /// Connected at the carrier level, handshake in flight.
    Initializing,
    /// Handshake complete, requests flow.
    Ready,
    /// Latched authorization failure; cleared by the embedder.
    Failed,
    /// Teardown in progress.
    Closing,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Closing => "closing",
        };
        f.write_str(label)
    }
}

/// Table of in-flight requests awaiting responses.
///
/// Entries are inserted before the request is written, completed by the
/// transport's reader, reaped by the caller on timeout, and failed wholesale
/// when the connection drops. A dropped sender wakes the waiting receiver
/// with a cancellation, so [`fail_all`](Self::fail_all) unblocks every
/// waiter in bounded time.
#[derive(Debug, Default)]
pub struct PendingRequests {
    slots: Mutex<HashMap<i64, oneshot::Sender<JSONRPCResponse>>>,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request id, returning the receiver its response lands on.
    pub fn register(&self, id: i64) -> oneshot::Receiver<JSONRPCResponse> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(id, tx);
        rx
    }

    /// Deliver a response to its waiter. Returns false when no slot matches
    /// (already reaped on timeout, or never ours).
    pub fn complete(&self, id: i64, response: JSONRPCResponse) -> bool {
        match self.slots.lock().remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Remove a slot without completing it (timeout reap). A response that
    /// arrives later finds no slot and is discarded.
    pub fn reap(&self, id: i64) {
        self.slots.lock().remove(&id);
    }

    /// Drop every slot, waking all waiters with a cancellation.
    pub fn fail_all(&self) {
        self.slots.lock().clear();
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no requests are in flight.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// A transport carrying JSON-RPC traffic to one MCP server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Short carrier identifier ("stdio", "sse", "http", "streamable_http").
    fn transport_type(&self) -> &'static str;

    /// Configured server name, if any.
    fn name(&self) -> Option<&str>;

    /// Establish the connection and run the initialize handshake.
    ///
    /// Idempotent: a ready transport returns immediately; a lost connection
    /// is fully torn down and re-handshaken.
    async fn connect(&self) -> Result<()>;

    /// Send a request and wait for its correlated response.
    async fn rpc_request(&self, method: &str, params: Option<Value>) -> Result<Value>;

    /// Send a notification without waiting for a response.
    async fn rpc_notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Server implementation info recorded during the handshake.
    fn server_info(&self) -> Option<Implementation>;

    /// Tear the connection down, unblocking every waiter. Idempotent.
    async fn cleanup(&self) -> Result<()>;

    /// Register the handler for server-originated notifications.
    fn set_notification_handler(&self, handler: NotificationHandler);

    /// List the tools the server exposes.
    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let result = self.rpc_request("tools/list", None).await?;
        let parsed: ListToolsResult = serde_json::from_value(result).map_err(|e| {
            TransportError::InvalidMessage(format!("invalid tools/list result: {e}"))
        })?;
        if parsed.next_cursor.is_some() {
            warn!("server returned a paginated tool catalog; only the first page is used");
        }
        Ok(parsed.tools)
    }

    /// Invoke a tool by name.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.rpc_request(
            "tools/call",
            Some(json!({"name": name, "arguments": arguments})),
        )
        .await
    }

    /// Invoke a tool, yielding results as a finite stream.
    ///
    /// The protocol defines no partial-result frames yet, so every transport
    /// yields exactly one element: the final result.
    fn call_tool_streaming<'a>(
        &'a self,
        name: &'a str,
        arguments: Value,
    ) -> BoxStream<'a, Result<Value>> {
        Box::pin(futures::stream::once(self.call_tool(name, arguments)))
    }
}
