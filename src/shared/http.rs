//! HTTP transport base and the plain HTTP transport.
//!
//! [`HttpBase`] is the shared POST engine: it composes headers, consults the
//! OAuth provider before each request, echoes the server-assigned session
//! id, and maps HTTP status codes onto the error taxonomy. The plain
//! [`HttpTransport`] and the streamable variant differ only in how they
//! parse the response body.

use crate::auth::OAuthProvider;
use crate::error::{Error, Result, TransportError};
use crate::shared::retry::{with_retry, RetryPolicy};
use crate::shared::rpc::{build_notification, build_request, initialize_params, process_response};
use crate::shared::transport::{McpTransport, NotificationHandler};
use crate::types::{Implementation, InitializeResult, JSONRPCResponse};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub(crate) const APPLICATION_JSON: &str = "application/json";
pub(crate) const TEXT_EVENT_STREAM: &str = "text/event-stream";
pub(crate) const ACCEPT_STREAMABLE: &str = "application/json, text/event-stream";
pub(crate) const MCP_SESSION_ID: &str = "Mcp-Session-Id";
pub(crate) const LAST_EVENT_ID: &str = "Last-Event-ID";

/// A collected HTTP response body with the metadata the parsers need.
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Shared POST engine for the HTTP transport family.
pub(crate) struct HttpBase {
    pub base_url: Url,
    pub headers: Vec<(String, String)>,
    pub read_timeout: Duration,
    pub retry: RetryPolicy,
    pub name: Option<String>,
    pub http: reqwest::Client,
    pub oauth: Option<Arc<OAuthProvider>>,
    pub session_id: RwLock<Option<String>>,
    pub next_id: AtomicI64,
    pub server_info: RwLock<Option<Implementation>>,
    pub capabilities: RwLock<Option<Value>>,
    pub handler: RwLock<Option<NotificationHandler>>,
    pub initialized: AtomicBool,
    pub connect_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for HttpBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBase")
            .field("base_url", &self.base_url)
            .field("read_timeout", &self.read_timeout)
            .field("retry", &self.retry)
            .field("name", &self.name)
            .field("oauth", &self.oauth.is_some())
            .field("session_id", &self.session_id.read())
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl HttpBase {
    pub fn new(
        base_url: Url,
        headers: Vec<(String, String)>,
        read_timeout: Duration,
        retry: RetryPolicy,
        name: Option<String>,
        oauth: Option<Arc<OAuthProvider>>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(read_timeout)
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            headers,
            read_timeout,
            retry,
            name,
            http,
            oauth,
            session_id: RwLock::new(None),
            next_id: AtomicI64::new(1),
            server_info: RwLock::new(None),
            capabilities: RwLock::new(None),
            handler: RwLock::new(None),
            initialized: AtomicBool::new(false),
            connect_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// POST a JSON-RPC payload.
    ///
    /// User headers are applied first so the forced `Content-Type`/`Accept`
    /// and the session id always win; the OAuth provider is consulted on
    /// every request so tokens that expire soon are refreshed in-line.
    pub async fn post(
        &self,
        url: &Url,
        payload: &Value,
        accept: &str,
        extra: &[(&str, String)],
    ) -> Result<RawResponse> {
        let mut request = self.http.post(url.clone());
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        request = request
            .header(reqwest::header::CONTENT_TYPE, APPLICATION_JSON)
            .header(reqwest::header::ACCEPT, accept);
        if let Some(session) = self.session_id.read().clone() {
            request = request.header(MCP_SESSION_ID, session);
        }
        if let Some(oauth) = &self.oauth {
            let header = oauth.authorization_header().await?;
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }
        for (key, value) in extra {
            request = request.header(*key, value.as_str());
        }

        let response = request
            .json(payload)
            .send()
            .await
            .map_err(request_error)?;

        if let Some(session) = response
            .headers()
            .get(MCP_SESSION_ID)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write() = Some(session.to_string());
        }

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if (200..300).contains(&status) {
            let body = response.bytes().await.map_err(request_error)?.to_vec();
            return Ok(RawResponse {
                status,
                content_type,
                body,
            });
        }
        Err(self.map_status(status))
    }

    fn map_status(&self, status: u16) -> Error {
        match status {
            401 | 403 => {
                if let Some(oauth) = &self.oauth {
                    oauth.invalidate_token();
                }
                Error::Connection(format!("Authorization failed: HTTP {status}"))
            },
            400..=499 => Error::server(format!("Client error: HTTP {status}"), i64::from(status)),
            500..=599 => Error::server(format!("Server error: HTTP {status}"), i64::from(status)),
            _ => TransportError::Request(format!("unexpected HTTP status {status}")).into(),
        }
    }

    pub fn dispatch_notification(&self, method: &str, params: Option<&Value>) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(method, params);
        }
    }
}

/// Map a reqwest failure onto the transport taxonomy.
pub(crate) fn request_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        TransportError::Timeout(format!("during HTTP request: {err}")).into()
    } else {
        TransportError::Request(err.to_string()).into()
    }
}

/// Plain HTTP transport: every JSON-RPC exchange is one POST with a JSON
/// response body.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    inner: Arc<HttpInner>,
}

#[derive(Debug)]
struct HttpInner {
    base: HttpBase,
    rpc_url: Url,
}

impl HttpTransport {
    /// Create a plain HTTP transport.
    ///
    /// `endpoint` is resolved against `base_url` (default "/rpc").
    pub fn new(
        base_url: &str,
        endpoint: &str,
        headers: Vec<(String, String)>,
        read_timeout: Duration,
        retry: RetryPolicy,
        name: Option<String>,
        oauth: Option<Arc<OAuthProvider>>,
    ) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid base_url '{base_url}': {e}")))?;
        let rpc_url = base
            .join(endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint '{endpoint}': {e}")))?;
        Ok(Self {
            inner: Arc::new(HttpInner {
                base: HttpBase::new(base, headers, read_timeout, retry, name, oauth)?,
                rpc_url,
            }),
        })
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
        debug!(server = %init.server_info.name, "HTTP session initialized");
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
        with_retry(base.retry, || {
            let params = params.clone();
            async move {
                let id = base.next_id.fetch_add(1, Ordering::SeqCst);
                let request = serde_json::to_value(build_request(method, params, id))?;
                let raw = base.post(rpc_url, &request, APPLICATION_JSON, &[]).await?;
                let response: JSONRPCResponse = serde_json::from_slice(&raw.body).map_err(|e| {
                    TransportError::InvalidMessage(format!("invalid JSON-RPC response: {e}"))
                })?;
                process_response(response)
            }
        })
        .await
    }

    async fn post_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let base = &self.inner.base;
        let rpc_url = &self.inner.rpc_url;
        with_retry(base.retry, || {
            let params = params.clone();
            async move {
                let notification = serde_json::to_value(build_notification(method, params))?;
                base.post(rpc_url, &notification, APPLICATION_JSON, &[]).await?;
                Ok(())
            }
        })
        .await
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    fn transport_type(&self) -> &'static str {
        "http"
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
        Ok(())
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.inner.base.handler.write() = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_resolves_against_base_url() {
        let transport = HttpTransport::new(
            "http://localhost:9000/api/",
            "rpc",
            Vec::new(),
            Duration::from_secs(30),
            RetryPolicy::default(),
            None,
            None,
        )
        .unwrap();
        assert_eq!(
            transport.inner.rpc_url.as_str(),
            "http://localhost:9000/api/rpc"
        );
    }

    #[test]
    fn invalid_base_url_is_a_config_error() {
        let result = HttpTransport::new(
            "not a url",
            "/rpc",
            Vec::new(),
            Duration::from_secs(30),
            RetryPolicy::default(),
            None,
            None,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn status_mapping() {
        let base = HttpBase::new(
            Url::parse("http://localhost:9000").unwrap(),
            Vec::new(),
            Duration::from_secs(1),
            RetryPolicy::none(),
            None,
            None,
        )
        .unwrap();

        match base.map_status(401) {
            Error::Connection(msg) => assert_eq!(msg, "Authorization failed: HTTP 401"),
            other => panic!("unexpected {other:?}"),
        }
        match base.map_status(404) {
            Error::Server { message, code } => {
                assert_eq!(message, "Client error: HTTP 404");
                assert_eq!(code, Some(404));
            },
            other => panic!("unexpected {other:?}"),
        }
        let err = base.map_status(503);
        assert!(err.is_retryable());
    }
}
