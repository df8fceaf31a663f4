//! Child-process transport exchanging newline-delimited JSON-RPC.
//!
//! Spawns the configured command without any shell, pipes its stdio, and
//! supervises a background reader that routes responses to the pending
//! request table and notifications to the registered handler. The child's
//! stderr is drained into the log rather than inherited.

use crate::error::{Error, Result, TransportError};
use crate::shared::rpc::{build_notification, build_request, initialize_params, process_response};
use crate::shared::transport::{
    McpTransport, NotificationHandler, PendingRequests, TransportState,
};
use crate::types::{parse_message, Implementation, InitializeResult, Message};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// stdio transport for MCP communication.
///
/// Messages are written to the child's stdin and read from its stdout,
/// newline-delimited per the MCP specification.
///
/// # Examples
///
/// ```rust,no_run
/// use mcplex::shared::StdioTransport;
/// use mcplex::McpTransport;
/// use std::collections::HashMap;
/// use std::time::Duration;
///
/// # async fn example() -> mcplex::Result<()> {
/// let transport = StdioTransport::new(
///     vec!["my-mcp-server".into(), "--verbose".into()],
///     HashMap::new(),
///     Duration::from_secs(30),
///     None,
/// )?;
/// transport.connect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct StdioTransport {
    inner: Arc<StdioInner>,
}

struct StdioInner {
    argv: Vec<String>,
    env: HashMap<String, String>,
    read_timeout: Duration,
    name: Option<String>,
    state: watch::Sender<TransportState>,
    pending: PendingRequests,
    next_id: AtomicI64,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stderr_drain: Mutex<Option<JoinHandle<()>>>,
    server_info: RwLock<Option<Implementation>>,
    capabilities: RwLock<Option<Value>>,
    handler: RwLock<Option<NotificationHandler>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for StdioInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioInner")
            .field("argv", &self.argv)
            .field("read_timeout", &self.read_timeout)
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl StdioTransport {
    /// Create a stdio transport for the given argument vector.
    ///
    /// `env` is merged into the child's inherited environment. The command
    /// is executed directly; no shell is involved.
    pub fn new(
        argv: Vec<String>,
        env: HashMap<String, String>,
        read_timeout: Duration,
        name: Option<String>,
    ) -> Result<Self> {
        if argv.is_empty() {
            return Err(Error::Config("stdio command must not be empty".into()));
        }
        let (state, _) = watch::channel(TransportState::Disconnected);
        Ok(Self {
            inner: Arc::new(StdioInner {
                argv,
                env,
                read_timeout,
                name,
                state,
                pending: PendingRequests::new(),
                next_id: AtomicI64::new(1),
                stdin: tokio::sync::Mutex::new(None),
                child: Mutex::new(None),
                reader: Mutex::new(None),
                stderr_drain: Mutex::new(None),
                server_info: RwLock::new(None),
                capabilities: RwLock::new(None),
                handler: RwLock::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> TransportState {
        *self.inner.state.borrow()
    }

    async fn spawn_child(&self) -> Result<()> {
        let inner = &self.inner;
        inner.state.send_replace(TransportState::Connecting);

        let mut command = Command::new(&inner.argv[0]);
        command
            .args(&inner.argv[1..])
            .envs(&inner.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            inner.state.send_replace(TransportState::Disconnected);
            Error::Connection(format!("failed to spawn '{}': {e}", inner.argv[0]))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Connection("failed to capture child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Connection("failed to capture child stdout".into()))?;
        let stderr = child.stderr.take();

        *inner.stdin.lock().await = Some(stdin);
        *inner.child.lock() = Some(child);

        let reader_inner = self.inner.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        reader_inner.dispatch_line(&line);
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "error reading child stdout");
                        break;
                    },
                }
            }
            // EOF or read failure: the session is gone.
            reader_inner.pending.fail_all();
            if *reader_inner.state.borrow() != TransportState::Closing {
                reader_inner.state.send_replace(TransportState::Disconnected);
            }
            debug!("stdio reader finished");
        });
        *inner.reader.lock() = Some(reader);

        if let Some(stderr) = stderr {
            let drain = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "mcplex::stdio::stderr", "{line}");
                }
            });
            *inner.stderr_drain.lock() = Some(drain);
        }

        inner.state.send_replace(TransportState::Initializing);
        Ok(())
    }

    async fn handshake(&self) -> Result<()> {
        let result = self
            .request_inner("initialize", Some(initialize_params()))
            .await?;
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            TransportError::InvalidMessage(format!("invalid initialize result: {e}"))
        })?;
        debug!(server = %init.server_info.name, version = %init.server_info.version,
               "stdio session initialized");
        *self.inner.server_info.write() = Some(init.server_info);
        *self.inner.capabilities.write() = Some(init.capabilities);
        self.notify_inner("notifications/initialized", None).await
    }

    async fn request_inner(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let request = build_request(method, params, id);
        let rx = self.inner.pending.register(id);

        if let Err(e) = self.write_frame(&serde_json::to_value(&request)?).await {
            self.inner.pending.reap(id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.read_timeout, rx).await {
            Ok(Ok(response)) => process_response(response),
            Ok(Err(_)) => Err(Error::Connection(
                "connection closed while waiting for response".into(),
            )),
            Err(_) => {
                self.inner.pending.reap(id);
                Err(TransportError::Timeout(format!(
                    "after {:?} waiting for response to \"{method}\"",
                    self.inner.read_timeout
                ))
                .into())
            },
        }
    }

    async fn notify_inner(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = build_notification(method, params);
        self.write_frame(&serde_json::to_value(&notification)?).await
    }

    async fn write_frame(&self, frame: &Value) -> Result<()> {
        let mut payload = serde_json::to_string(frame)?;
        payload.push('\n');

        let mut guard = self.inner.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or(TransportError::ConnectionClosed)?;
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(TransportError::Io)?;
        stdin.flush().await.map_err(TransportError::Io)?;
        Ok(())
    }
}

impl StdioInner {
    fn dispatch_line(&self, line: &str) {
        match parse_message(line.as_bytes()) {
            Ok(Message::Response(response)) => match response.id.as_number() {
                Some(id) => {
                    if !self.pending.complete(id, response) {
                        debug!(id, "discarding response with no pending request");
                    }
                },
                None => warn!(id = %response.id, "discarding response with non-numeric id"),
            },
            Ok(Message::Notification(notification)) => {
                let handler = self.handler.read().clone();
                if let Some(handler) = handler {
                    handler(&notification.method, notification.params.as_ref());
                } else {
                    debug!(method = %notification.method, "notification with no handler");
                }
            },
            Ok(Message::Request(request)) => {
                warn!(method = %request.method, "ignoring unexpected request from server");
            },
            Err(e) => warn!(error = %e, "discarding malformed line from child"),
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn transport_type(&self) -> &'static str {
        "stdio"
    }

    fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    async fn connect(&self) -> Result<()> {
        if *self.inner.state.borrow() == TransportState::Ready {
            return Ok(());
        }
        let _guard = self.inner.connect_lock.lock().await;
        if *self.inner.state.borrow() == TransportState::Ready {
            return Ok(());
        }

        self.teardown().await;
        self.spawn_child().await?;
        if let Err(e) = self.handshake().await {
            self.teardown().await;
            self.inner.state.send_replace(TransportState::Disconnected);
            return Err(e);
        }
        self.inner.state.send_replace(TransportState::Ready);
        Ok(())
    }

    async fn rpc_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.connect().await?;
        self.request_inner(method, params).await
    }

    async fn rpc_notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.connect().await?;
        self.notify_inner(method, params).await
    }

    fn server_info(&self) -> Option<Implementation> {
        self.inner.server_info.read().clone()
    }

    async fn cleanup(&self) -> Result<()> {
        self.inner.state.send_replace(TransportState::Closing);
        self.teardown().await;
        self.inner.state.send_replace(TransportState::Disconnected);
        Ok(())
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.inner.handler.write() = Some(handler);
    }
}

impl StdioTransport {
    /// Drop the pipes, stop the reader, and reap the child. Safe to call
    /// repeatedly.
    async fn teardown(&self) {
        self.inner.pending.fail_all();

        *self.inner.stdin.lock().await = None;

        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        if let Some(drain) = self.inner.stderr_drain.lock().take() {
            drain.abort();
        }

        let child = self.inner.child.lock().take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected() {
        let result = StdioTransport::new(
            Vec::new(),
            HashMap::new(),
            Duration::from_secs(1),
            None,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let transport = StdioTransport::new(
            vec!["true".into()],
            HashMap::new(),
            Duration::from_secs(1),
            Some("local".into()),
        )
        .unwrap();
        assert_eq!(transport.state(), TransportState::Disconnected);
        assert_eq!(transport.transport_type(), "stdio");
        assert_eq!(transport.name(), Some("local"));
        assert!(transport.server_info().is_none());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let transport = StdioTransport::new(
            vec!["true".into()],
            HashMap::new(),
            Duration::from_secs(1),
            None,
        )
        .unwrap();
        transport.cleanup().await.unwrap();
        transport.cleanup().await.unwrap();
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn spawn_failure_reports_connection_error() {
        let transport = StdioTransport::new(
            vec!["definitely-not-a-real-binary-mcplex".into()],
            HashMap::new(),
            Duration::from_secs(1),
            None,
        )
        .unwrap();
        match transport.connect().await {
            Err(Error::Connection(msg)) => assert!(msg.contains("failed to spawn")),
            other => panic!("expected connection error, got {other:?}"),
        }
        assert_eq!(transport.state(), TransportState::Disconnected);
    }
}
