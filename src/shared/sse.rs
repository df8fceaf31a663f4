//! SSE transport: a long-lived `text/event-stream` GET for inbound frames
//! plus POSTed JSON-RPC for outbound requests.
//!
//! The server's first meaningful frame is `event: endpoint`, whose data is
//! the URL (absolute or relative, resolved against the stream URL) that
//! subsequent requests are POSTed to. Responses may come back synchronously
//! in the POST body or asynchronously as `event: message` frames correlated
//! by request id. A liveness monitor pings the server after a quiet period
//! and reconnects with bounded exponential backoff when the session dies.

use crate::error::{Error, Result, TransportError};
use crate::shared::http::{HttpBase, APPLICATION_JSON, LAST_EVENT_ID, TEXT_EVENT_STREAM};
use crate::shared::retry::{with_retry, RetryPolicy};
use crate::shared::rpc::{build_notification, build_request, initialize_params, process_response};
use crate::shared::sse_parser::{SseEvent, SseParser};
use crate::shared::transport::{
    McpTransport, NotificationHandler, PendingRequests, TransportState,
};
use crate::types::{parse_message, Implementation, InitializeResult, Message};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// SSE transport for MCP communication.
///
/// # Examples
///
/// ```rust,no_run
/// use mcplex::shared::SseTransport;
/// use mcplex::{McpTransport, RetryPolicy};
/// use std::time::Duration;
///
/// # async fn example() -> mcplex::Result<()> {
/// let transport = SseTransport::new(
///     "http://localhost:8080/sse",
///     Vec::new(),
///     Duration::from_secs(30),
///     Duration::from_secs(10),
///     RetryPolicy::none(),
///     None,
/// )?;
/// transport.connect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SseTransport {
    inner: Arc<SseInner>,
}

#[derive(Debug)]
struct SseInner {
    /// POST engine; `base.base_url` is the SSE stream URL.
    base: HttpBase,
    /// Client without a total-request timeout, for the long-lived stream.
    stream_http: reqwest::Client,
    ping_interval: Duration,
    state: watch::Sender<TransportState>,
    rpc_endpoint: RwLock<Option<Url>>,
    pending: PendingRequests,
    last_event_id: RwLock<Option<String>>,
    last_activity: Mutex<Instant>,
    auth_error: RwLock<Option<String>>,
    sse_connected: AtomicBool,
    ping_failures: AtomicU32,
    reader: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Create an SSE transport for the given stream URL.
    pub fn new(
        base_url: &str,
        headers: Vec<(String, String)>,
        read_timeout: Duration,
        ping_interval: Duration,
        retry: RetryPolicy,
        name: Option<String>,
    ) -> Result<Self> {
        let url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid base_url '{base_url}': {e}")))?;
        // The stream client gets a connect timeout only; a total timeout
        // would sever the long-lived event stream.
        let stream_http = reqwest::Client::builder()
            .connect_timeout(read_timeout)
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {e}")))?;
        let (state, _) = watch::channel(TransportState::Disconnected);
        Ok(Self {
            inner: Arc::new(SseInner {
                base: HttpBase::new(url, headers, read_timeout, retry, name, None)?,
                stream_http,
                ping_interval,
                state,
                rpc_endpoint: RwLock::new(None),
                pending: PendingRequests::new(),
                last_event_id: RwLock::new(None),
                last_activity: Mutex::new(Instant::now()),
                auth_error: RwLock::new(None),
                sse_connected: AtomicBool::new(false),
                ping_failures: AtomicU32::new(0),
                reader: Mutex::new(None),
                monitor: Mutex::new(None),
            }),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> TransportState {
        *self.inner.state.borrow()
    }

    /// Latched authorization failure, if any.
    pub fn auth_error(&self) -> Option<String> {
        self.inner.auth_error.read().clone()
    }

    /// Clear a latched authorization failure so the next `connect` retries
    /// (typically after the embedder completes an OAuth flow and updates
    /// the request headers).
    pub fn clear_auth_error(&self) {
        *self.inner.auth_error.write() = None;
        if *self.inner.state.borrow() == TransportState::Failed {
            self.inner.state.send_replace(TransportState::Disconnected);
        }
    }

    /// Last event id observed on the stream, sent as `Last-Event-ID` when
    /// reconnecting so the server can replay missed frames.
    pub fn last_event_id(&self) -> Option<String> {
        self.inner.last_event_id.read().clone()
    }

    fn start_reader(&self) {
        self.inner.state.send_replace(TransportState::Connecting);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            SseInner::run_reader(&inner).await;
        });
        *self.inner.reader.lock() = Some(handle);
    }

    /// Wait until the endpoint frame arrives (or the attempt dies).
    async fn wait_for_endpoint(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    TransportState::Initializing | TransportState::Ready => return Ok(()),
                    TransportState::Failed => {
                        let message = self
                            .inner
                            .auth_error
                            .read()
                            .clone()
                            .unwrap_or_else(|| "SSE connection failed".into());
                        return Err(Error::Connection(message));
                    },
                    TransportState::Disconnected | TransportState::Closing => {
                        return Err(Error::Connection("SSE connection failed".into()));
                    },
                    TransportState::Connecting => {},
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Connection("SSE connection failed".into()));
                }
            }
        };
        match tokio::time::timeout(self.inner.base.read_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Connection(
                "timed out waiting for SSE endpoint event".into(),
            )),
        }
    }

    async fn handshake(&self) -> Result<()> {
        let result = self
            .request_inner("initialize", Some(initialize_params()))
            .await?;
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            TransportError::InvalidMessage(format!("invalid initialize result: {e}"))
        })?;
        info!(server = %init.server_info.name, version = %init.server_info.version,
              "SSE session initialized");
        *self.inner.base.server_info.write() = Some(init.server_info);
        *self.inner.base.capabilities.write() = Some(init.capabilities);
        self.notify_inner("notifications/initialized", None).await?;
        self.inner.base.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn request_inner(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let inner = &self.inner;
        let endpoint = inner
            .rpc_endpoint
            .read()
            .clone()
            .ok_or_else(|| Error::Connection("SSE endpoint not received yet".into()))?;

        let id = inner.base.next_id.fetch_add(1, Ordering::SeqCst);
        let request = serde_json::to_value(build_request(method, params, id))?;
        let rx = inner.pending.register(id);

        let base = &inner.base;
        let post_result = with_retry(base.retry, || {
            let request = request.clone();
            let endpoint = endpoint.clone();
            async move { base.post(&endpoint, &request, APPLICATION_JSON, &[]).await }
        })
        .await;

        let raw = match post_result {
            Ok(raw) => raw,
            Err(e) => {
                inner.pending.reap(id);
                if let Error::Connection(message) = &e {
                    if message.starts_with("Authorization failed") {
                        self.latch_auth_error(message.clone());
                    }
                }
                return Err(e);
            },
        };
        inner.touch_activity();

        // Fast path: the server answered in the POST body.
        if !raw.body.is_empty() && raw.content_type.contains(APPLICATION_JSON) {
            if let Ok(Message::Response(response)) = parse_message(&raw.body) {
                if response.id.as_number() == Some(id) {
                    inner.pending.reap(id);
                    return process_response(response);
                }
            }
        }

        // Otherwise the result arrives as an SSE `message` frame.
        match tokio::time::timeout(base.read_timeout, rx).await {
            Ok(Ok(response)) => {
                inner.touch_activity();
                process_response(response)
            },
            Ok(Err(_)) => Err(Error::Connection(
                "SSE connection lost while waiting for result".into(),
            )),
            Err(_) => {
                inner.pending.reap(id);
                Err(TransportError::Timeout(format!(
                    "after {:?} waiting for response to \"{method}\"",
                    base.read_timeout
                ))
                .into())
            },
        }
    }

    async fn notify_inner(&self, method: &str, params: Option<Value>) -> Result<()> {
        let inner = &self.inner;
        let endpoint = inner
            .rpc_endpoint
            .read()
            .clone()
            .ok_or_else(|| Error::Connection("SSE endpoint not received yet".into()))?;
        let notification = serde_json::to_value(build_notification(method, params))?;
        let base = &inner.base;
        with_retry(base.retry, || {
            let notification = notification.clone();
            let endpoint = endpoint.clone();
            async move {
                base.post(&endpoint, &notification, APPLICATION_JSON, &[])
                    .await?;
                Ok(())
            }
        })
        .await?;
        inner.touch_activity();
        Ok(())
    }

    fn latch_auth_error(&self, message: String) {
        warn!(%message, "latching SSE authorization failure");
        *self.inner.auth_error.write() = Some(message);
        self.inner.pending.fail_all();
        self.inner.state.send_replace(TransportState::Failed);
    }

    /// Tear down the connection (reader, endpoint, pending waiters) while
    /// leaving the monitor and any latched auth error in place.
    async fn drop_connection(&self) {
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        self.inner.pending.fail_all();
        *self.inner.rpc_endpoint.write() = None;
        self.inner.sse_connected.store(false, Ordering::SeqCst);
        self.inner.base.initialized.store(false, Ordering::Release);
        let state = *self.inner.state.borrow();
        if !matches!(state, TransportState::Closing | TransportState::Failed) {
            self.inner.state.send_replace(TransportState::Disconnected);
        }
    }

    fn start_monitor(&self) {
        let mut guard = self.inner.monitor.lock();
        if guard.is_some() {
            return;
        }
        let transport = self.clone();
        *guard = Some(tokio::spawn(async move {
            transport.run_monitor().await;
        }));
    }

    /// Liveness monitor: pings after a quiet period, reconnects on failure.
    async fn run_monitor(self) {
        let ping_interval = self.inner.ping_interval;
        loop {
            tokio::time::sleep(ping_interval).await;
            let state = *self.inner.state.borrow();
            match state {
                TransportState::Closing | TransportState::Failed => break,
                TransportState::Disconnected => {
                    if !self.try_reconnect().await {
                        break;
                    }
                    continue;
                },
                TransportState::Ready => {},
                _ => continue,
            }

            let idle = self.inner.last_activity.lock().elapsed();
            if idle < ping_interval {
                continue;
            }
            match self.request_inner("ping", None).await {
                Ok(_) => {
                    self.inner.ping_failures.store(0, Ordering::SeqCst);
                    debug!("SSE ping ok");
                },
                Err(e) => {
                    let failures = self.inner.ping_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(failures, error = %e, "SSE ping failed, reconnecting");
                    self.drop_connection().await;
                    if !self.try_reconnect().await {
                        break;
                    }
                },
            }
        }
        debug!("SSE monitor finished");
    }

    /// Bounded reconnection: `max_retries + 1` attempts with exponential
    /// backoff. Returns false once the budget is spent or auth has latched.
    async fn try_reconnect(&self) -> bool {
        let policy = self.inner.base.retry;
        let attempts = policy.max_retries + 1;
        for attempt in 1..=attempts {
            if self.inner.auth_error.read().is_some() {
                return false;
            }
            match self.connect().await {
                Ok(()) => {
                    self.inner.ping_failures.store(0, Ordering::SeqCst);
                    info!(attempt, "SSE reconnected");
                    return true;
                },
                Err(e) => {
                    warn!(attempt, error = %e, "SSE reconnect attempt failed");
                    if attempt < attempts {
                        tokio::time::sleep(policy.delay_for(attempt)).await;
                    }
                },
            }
        }
        false
    }
}

impl SseInner {
    fn touch_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// The long-lived GET stream. Owns the SSE byte stream exclusively.
    async fn run_reader(inner: &Arc<Self>) {
        let mut request = inner
            .stream_http
            .get(inner.base.base_url.clone())
            .header(reqwest::header::ACCEPT, TEXT_EVENT_STREAM);
        for (key, value) in &inner.base.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(last) = inner.last_event_id.read().clone() {
            request = request.header(LAST_EVENT_ID, last);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "failed to open SSE stream");
                inner.connection_lost();
                return;
            },
        };

        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            let message = format!("Authorization failed: HTTP {status}");
            warn!(%message, "latching SSE authorization failure");
            *inner.auth_error.write() = Some(message);
            inner.pending.fail_all();
            inner.state.send_replace(TransportState::Failed);
            return;
        }
        if !(200..300).contains(&status) {
            warn!(status, "SSE stream request rejected");
            inner.connection_lost();
            return;
        }

        inner.sse_connected.store(true, Ordering::SeqCst);
        inner.touch_activity();
        debug!(url = %inner.base.base_url, "SSE stream open");

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    inner.touch_activity();
                    let text = String::from_utf8_lossy(&bytes);
                    for event in parser.feed(&text) {
                        inner.handle_event(event);
                    }
                },
                Err(e) => {
                    debug!(error = %e, "SSE stream read error");
                    break;
                },
            }
        }

        inner.sse_connected.store(false, Ordering::SeqCst);
        let state = *inner.state.borrow();
        if !matches!(state, TransportState::Closing | TransportState::Failed) {
            inner.connection_lost();
        }
        debug!("SSE reader finished");
    }

    fn connection_lost(&self) {
        self.pending.fail_all();
        self.base.initialized.store(false, Ordering::Release);
        if *self.state.borrow() != TransportState::Closing {
            self.state.send_replace(TransportState::Disconnected);
        }
    }

    fn handle_event(&self, event: SseEvent) {
        if let Some(id) = &event.id {
            *self.last_event_id.write() = Some(id.clone());
        }
        match event.event.as_deref() {
            Some("endpoint") => match self.base.base_url.join(event.data.trim()) {
                Ok(url) => {
                    debug!(endpoint = %url, "received RPC endpoint");
                    *self.rpc_endpoint.write() = Some(url);
                    if *self.state.borrow() == TransportState::Connecting {
                        self.state.send_replace(TransportState::Initializing);
                    }
                },
                Err(e) => warn!(data = %event.data, error = %e, "invalid endpoint frame"),
            },
            Some("ping") => {},
            Some("message") | None => {
                if event.data.is_empty() {
                    return;
                }
                match parse_message(event.data.as_bytes()) {
                    Ok(Message::Response(response)) => match response.id.as_number() {
                        Some(id) => {
                            if !self.pending.complete(id, response) {
                                debug!(id, "discarding SSE response with no pending request");
                            }
                        },
                        None => {
                            debug!(id = %response.id, "discarding SSE response with non-numeric id");
                        },
                    },
                    Ok(Message::Notification(notification)) => {
                        self.base
                            .dispatch_notification(&notification.method, notification.params.as_ref());
                    },
                    Ok(Message::Request(request)) => {
                        warn!(method = %request.method, "ignoring unexpected request from server");
                    },
                    Err(e) => warn!(error = %e, "discarding malformed SSE message frame"),
                }
            },
            Some(other) => debug!(event = other, "ignoring unrecognized SSE event type"),
        }
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    fn transport_type(&self) -> &'static str {
        "sse"
    }

    fn name(&self) -> Option<&str> {
        self.inner.base.name.as_deref()
    }

    async fn connect(&self) -> Result<()> {
        if let Some(message) = self.inner.auth_error.read().clone() {
            return Err(Error::Connection(message));
        }
        if *self.inner.state.borrow() == TransportState::Ready {
            return Ok(());
        }
        let _guard = self.inner.base.connect_lock.lock().await;
        if *self.inner.state.borrow() == TransportState::Ready {
            return Ok(());
        }
        if let Some(message) = self.inner.auth_error.read().clone() {
            return Err(Error::Connection(message));
        }

        self.drop_connection().await;
        self.start_reader();
        if let Err(e) = self.wait_for_endpoint().await {
            self.drop_connection().await;
            return Err(e);
        }
        if let Err(e) = self.handshake().await {
            self.drop_connection().await;
            return Err(e);
        }
        self.inner.state.send_replace(TransportState::Ready);
        self.start_monitor();
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
        self.inner.base.server_info.read().clone()
    }

    async fn cleanup(&self) -> Result<()> {
        self.inner.state.send_replace(TransportState::Closing);
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.abort();
        }
        self.drop_connection().await;
        self.inner.state.send_replace(TransportState::Disconnected);
        Ok(())
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.inner.base.handler.write() = Some(handler);
    }
}
