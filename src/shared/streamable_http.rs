//! Streamable HTTP transport: POST requests whose responses may arrive as
//! SSE-formatted bodies.
//!
//! Shares the POST engine with the plain HTTP transport; the difference is
//! entirely in response parsing. When the server answers with
//! `text/event-stream`, the body is run through the SSE parser, the final
//! `id:` is recorded for resumability, and the first JSON-RPC response found
//! in the frames is the call's result. Notifications embedded in the stream
//! are forwarded to the registered handler.

use crate::error::{Error, Result, TransportError};
use crate::shared::http::{
    HttpBase, RawResponse, ACCEPT_STREAMABLE, APPLICATION_JSON, LAST_EVENT_ID, TEXT_EVENT_STREAM,
};
use crate::shared::retry::{with_retry, RetryPolicy};
use crate::shared::rpc::{build_notification, build_request, initialize_params, process_response};
use crate::shared::sse_parser::SseParser;
use crate::shared::transport::{McpTransport, NotificationHandler};
use crate::types::{parse_message, Implementation, InitializeResult, JSONRPCResponse, Message};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Streamable HTTP transport.
///
/// # Examples
///
/// ```rust,no_run
/// use mcplex::shared::StreamableHttpTransport;
/// use mcplex::{McpTransport, RetryPolicy};
/// use std::time::Duration;
///
/// # async fn example() -> mcplex::Result<()> {
/// let transport = StreamableHttpTransport::new(
///     "http://localhost:8080",
///     "/rpc",
///     Vec::new(),
///     Duration::from_secs(30),
///     RetryPolicy::default(),
///     None,
///     None,
/// )?;
/// transport.connect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct StreamableHttpTransport {
    inner: Arc<StreamableInner>,
}

#[derive(Debug)]
struct StreamableInner {
    base: HttpBase,
    rpc_url: Url,
    last_event_id: RwLock<Option<String>>,
}

impl StreamableHttpTransport {
    /// Create a streamable HTTP transport. Same shape as the plain HTTP
    /// transport; only response handling differs.
    pub fn new(
        base_url: &str,
        endpoint: &str,
        headers: Vec<(String, String)>,
        read_timeout: Duration,
        retry: RetryPolicy,
        name: Option<String>,
        oauth: Option<Arc<crate::auth::OAuthProvider>>,
    ) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid base_url '{base_url}': {e}")))?;
        let rpc_url = base
            .join(endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint '{endpoint}': {e}")))?;
        Ok(Self {
            inner: Arc::new(StreamableInner {
                base: HttpBase::new(base, headers, read_timeout, retry, name, oauth)?,
                rpc_url,
                last_event_id: RwLock::new(None),
            }),
        })
    }

    /// Last SSE event id seen in a response body, echoed as `Last-Event-ID`
    /// on subsequent requests so the server can resume a broken stream.
    pub fn last_event_id(&self) -> Option<String> {
        self.inner.last_event_id.read().clone()
    }

    fn resume_headers(&self) -> Vec<(&'static str, String)> {
        match self.inner.last_event_id.read().clone() {
            Some(id) => vec![(LAST_EVENT_ID, id)],
            None => Vec::new(),
        }
    }

    async fn ensure_initialized(&self) -> Result<()> {
        let base = &self.inner.base;
        if base.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = base.connect_lock.lock().await;
        if base.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let result = self.post_rpc("initialize", Some(initialize_params())).await?;
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            TransportError::InvalidMessage(format!("invalid initialize result: {e}"))
        })?;
        debug!(server = %init.server_info.name, "streamable HTTP session initialized");
        *base.server_info.write() = Some(init.server_info);
        *base.capabilities.write() = Some(init.capabilities);

        self.post_notification("notifications/initialized", None)
            .await?;
        base.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn post_rpc(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let base = &self.inner.base;
        let rpc_url = &self.inner.rpc_url;
        let raw = with_retry(base.retry, || {
            let params = params.clone();
            let extra = self.resume_headers();
            async move {
                let id = base.next_id.fetch_add(1, Ordering::SeqCst);
                let request = serde_json::to_value(build_request(method, params, id))?;
                base.post(rpc_url, &request, ACCEPT_STREAMABLE, &extra).await
            }
        })
        .await?;
        self.parse_response(&raw)
    }

    async fn post_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let base = &self.inner.base;
        let rpc_url = &self.inner.rpc_url;
        with_retry(base.retry, || {
            let params = params.clone();
            let extra = self.resume_headers();
            async move {
                let notification = serde_json::to_value(build_notification(method, params))?;
                base.post(rpc_url, &notification, ACCEPT_STREAMABLE, &extra)
                    .await?;
                Ok(())
            }
        })
        .await
    }

    /// Decode a POST response body by content type.
    fn parse_response(&self, raw: &RawResponse) -> Result<Value> {
        let content_type = raw.content_type.split(';').next().unwrap_or("").trim();
        if content_type.contains(APPLICATION_JSON) {
            let response: JSONRPCResponse = serde_json::from_slice(&raw.body).map_err(|e| {
                TransportError::InvalidMessage(format!("invalid JSON-RPC response: {e}"))
            })?;
            return process_response(response);
        }
        if content_type.contains(TEXT_EVENT_STREAM) {
            return self.parse_sse_body(&raw.body);
        }
        Err(TransportError::Request(format!(
            "unsupported content type '{content_type}' (HTTP {})",
            raw.status
        ))
        .into())
    }

    fn parse_sse_body(&self, body: &[u8]) -> Result<Value> {
        let text = String::from_utf8_lossy(body);
        let mut parser = SseParser::new();
        let mut response: Option<JSONRPCResponse> = None;
        let mut saw_data = false;

        for event in parser.feed(&text) {
            if let Some(id) = &event.id {
                *self.inner.last_event_id.write() = Some(id.clone());
            }
            if !matches!(event.event.as_deref(), None | Some("message")) {
                continue;
            }
            if event.data.is_empty() {
                continue;
            }
            saw_data = true;
            match parse_message(event.data.as_bytes()) {
                Ok(Message::Response(r)) => {
                    if response.is_none() {
                        response = Some(r);
                    }
                },
                Ok(Message::Notification(n)) => {
                    self.inner
                        .base
                        .dispatch_notification(&n.method, n.params.as_ref());
                },
                Ok(Message::Request(r)) => {
                    warn!(method = %r.method, "ignoring unexpected request in SSE body");
                },
                Err(e) => warn!(error = %e, "discarding malformed SSE data frame"),
            }
        }

        if !saw_data {
            return Err(
                TransportError::InvalidMessage("No data found in SSE response".into()).into(),
            );
        }
        match response {
            Some(r) => process_response(r),
            None => Err(TransportError::InvalidMessage(
                "SSE response carried no JSON-RPC response".into(),
            )
            .into()),
        }
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    fn transport_type(&self) -> &'static str {
        "streamable_http"
    }

    fn name(&self) -> Option<&str> {
        self.inner.base.name.as_deref()
    }

    async fn connect(&self) -> Result<()> {
        self.ensure_initialized().await
    }

    async fn rpc_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.ensure_initialized().await?;
        self.post_rpc(method, params).await
    }

    async fn rpc_notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.ensure_initialized().await?;
        self.post_notification(method, params).await
    }

    fn server_info(&self) -> Option<Implementation> {
        self.inner.base.server_info.read().clone()
    }

    async fn cleanup(&self) -> Result<()> {
        let base = &self.inner.base;
        base.initialized.store(false, Ordering::Release);
        *base.session_id.write() = None;
        *base.server_info.write() = None;
        *self.inner.last_event_id.write() = None;
        Ok(())
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.inner.base.handler.write() = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transport() -> StreamableHttpTransport {
        StreamableHttpTransport::new(
            "http://localhost:9000",
            "/rpc",
            Vec::new(),
            Duration::from_secs(5),
            RetryPolicy::none(),
            None,
            None,
        )
        .unwrap()
    }

    fn raw(content_type: &str, body: &str) -> RawResponse {
        RawResponse {
            status: 200,
            content_type: content_type.to_string(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn json_body_is_decoded_directly() {
        let t = transport();
        let result = t
            .parse_response(&raw(
                "application/json",
                r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#,
            ))
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[test]
    fn sse_body_yields_result_and_records_event_id() {
        let t = transport();
        let body = "event: message\nid: 7\ndata: {\"jsonrpc\":\"2.0\",\"id\":42,\"result\":{\"ok\":true}}\n\n";
        let result = t
            .parse_response(&raw("text/event-stream", body))
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(t.last_event_id().as_deref(), Some("7"));
    }

    #[test]
    fn sse_body_without_data_fails() {
        let t = transport();
        let err = t
            .parse_response(&raw("text/event-stream", ": keepalive\n\n"))
            .unwrap_err();
        assert!(err.to_string().contains("No data found in SSE response"));
    }

    #[test]
    fn unsupported_content_type_fails() {
        let t = transport();
        let err = t.parse_response(&raw("text/html", "<html/>")).unwrap_err();
        assert!(err.to_string().contains("unsupported content type"));
    }

    #[test]
    fn multi_line_sse_data_is_joined_before_decoding() {
        let t = transport();
        let body = "data: {\"jsonrpc\":\"2.0\",\ndata: \"id\":1,\"result\":{\"n\":2}}\n\n";
        let result = t
            .parse_response(&raw("text/event-stream", body))
            .unwrap();
        assert_eq!(result, json!({"n": 2}));
    }
}
