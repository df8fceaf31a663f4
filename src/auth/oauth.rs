//! OAuth 2.1 provider: discovery, registration, PKCE code flow, refresh.
//!
//! The provider is attached to an HTTP transport and consulted before every
//! request via [`OAuthProvider::authorization_header`]. The embedder drives
//! the interactive part: it opens the URL from
//! [`OAuthProvider::start_authorization_flow`] in a browser, hosts its own
//! redirect target, and hands the resulting code back to
//! [`OAuthProvider::complete_authorization_flow`].

use crate::auth::pkce::{PkceParams, CODE_CHALLENGE_METHOD};
use crate::auth::storage::{MemoryTokenStorage, TokenStorage};
use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use url::Url;

/// Tokens within this window of expiry are refreshed proactively.
const REFRESH_THRESHOLD: Duration = Duration::from_secs(300);

/// An issued access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// The access token value.
    pub access_token: String,
    /// Token type, effectively always "Bearer".
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Absolute expiry, derived from the endpoint's `expires_in`.
    #[serde(default)]
    pub expires_at: Option<SystemTime>,
    /// Granted scope.
    #[serde(default)]
    pub scope: Option<String>,
    /// Refresh token, when the server issued one.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Token {
    /// Whether the token has expired.
    pub fn expired(&self) -> bool {
        match self.expires_at {
            Some(at) => SystemTime::now() >= at,
            None => false,
        }
    }

    /// Whether the token expires within the refresh threshold (300 s).
    pub fn expires_soon(&self) -> bool {
        match self.expires_at {
            Some(at) => match at.duration_since(SystemTime::now()) {
                Ok(remaining) => remaining < REFRESH_THRESHOLD,
                Err(_) => true,
            },
            None => false,
        }
    }

    /// `Authorization` header value.
    pub fn to_header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    fn from_response(doc: &Value) -> Result<Self> {
        let access_token = doc
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Connection("token response missing access_token".into()))?
            .to_string();
        Ok(Self {
            access_token,
            token_type: doc
                .get("token_type")
                .and_then(Value::as_str)
                .unwrap_or("Bearer")
                .to_string(),
            expires_at: doc
                .get("expires_in")
                .and_then(Value::as_u64)
                .map(|secs| SystemTime::now() + Duration::from_secs(secs)),
            scope: doc
                .get("scope")
                .and_then(Value::as_str)
                .map(str::to_string),
            refresh_token: doc
                .get("refresh_token")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Client credentials from static configuration or dynamic registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientInfo {
    /// OAuth client id.
    pub client_id: String,
    /// Client secret, for confidential clients only.
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Registered redirect URIs.
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

/// Authorization server metadata (RFC 8414 subset).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetadata {
    /// Issuer identifier.
    #[serde(default)]
    pub issuer: Option<String>,
    /// Authorization endpoint URL.
    pub authorization_endpoint: String,
    /// Token endpoint URL.
    pub token_endpoint: String,
    /// Dynamic registration endpoint, when advertised.
    #[serde(default)]
    pub registration_endpoint: Option<String>,
}

/// OAuth 2.1 provider bound to one MCP server URL (the RFC 8707 resource).
pub struct OAuthProvider {
    server_url: String,
    redirect_uri: String,
    scope: Option<String>,
    storage: Arc<dyn TokenStorage>,
    http: reqwest::Client,
    allow_insecure: bool,
}

impl std::fmt::Debug for OAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProvider")
            .field("server_url", &self.server_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("scope", &self.scope)
            .field("allow_insecure", &self.allow_insecure)
            .finish()
    }
}

impl OAuthProvider {
    /// Create a provider for the given MCP server URL.
    ///
    /// `redirect_uri` must point at a redirect target the embedder hosts;
    /// this library never opens a listener of its own.
    pub fn new(server_url: impl Into<String>, redirect_uri: impl Into<String>) -> Result<Self> {
        let server_url = server_url.into();
        Url::parse(&server_url)
            .map_err(|e| Error::Config(format!("invalid server_url '{server_url}': {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            server_url,
            redirect_uri: redirect_uri.into(),
            scope: None,
            storage: Arc::new(MemoryTokenStorage::new()),
            http,
            allow_insecure: false,
        })
    }

    /// Request a specific scope during authorization.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Use a custom (possibly persistent) credential store.
    pub fn with_storage(mut self, storage: Arc<dyn TokenStorage>) -> Self {
        self.storage = storage;
        self
    }

    /// Permit plain-http OAuth endpoints. Test flag; never set this in
    /// production.
    pub fn allow_insecure(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }

    /// The server URL the provider is bound to.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Whether a non-expired token is available.
    pub fn valid_token(&self) -> bool {
        self.storage
            .token(&self.server_url)
            .is_some_and(|t| !t.expired())
    }

    /// Drop the stored token (after a 401/403, the old token is useless).
    pub fn invalidate_token(&self) {
        self.storage.delete_token(&self.server_url);
    }

    /// Produce the `Authorization` header for the next request, refreshing
    /// a token that expires soon when a refresh token is available.
    pub async fn authorization_header(&self) -> Result<String> {
        let token = self
            .storage
            .token(&self.server_url)
            .ok_or_else(|| Error::Connection("OAuth authorization required".into()))?;

        if token.expires_soon() {
            if let Some(refresh_token) = token.refresh_token.clone() {
                match self.refresh(&refresh_token).await {
                    Ok(fresh) => return Ok(fresh.to_header_value()),
                    Err(e) => {
                        warn!(error = %e, "token refresh failed; re-authorization needed");
                        self.storage.delete_token(&self.server_url);
                        return Err(Error::Connection("OAuth authorization required".into()));
                    },
                }
            }
            if token.expired() {
                self.storage.delete_token(&self.server_url);
                return Err(Error::Connection("OAuth authorization required".into()));
            }
        }
        Ok(token.to_header_value())
    }

    /// Begin the authorization code flow and return the URL the embedder
    /// should open in the user's browser.
    pub async fn start_authorization_flow(&self) -> Result<String> {
        let metadata = self.discover_metadata().await?;
        let client = self.ensure_client_info(&metadata).await?;

        let pkce = PkceParams::generate();
        let state = generate_state();
        self.storage.set_pkce(&self.server_url, pkce.clone());
        self.storage.set_state_token(&self.server_url, state.clone());

        let mut url = Url::parse(&metadata.authorization_endpoint).map_err(|e| {
            Error::Connection(format!(
                "invalid authorization endpoint '{}': {e}",
                metadata.authorization_endpoint
            ))
        })?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("response_type", "code")
                .append_pair("client_id", &client.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("state", &state)
                .append_pair("code_challenge", &pkce.challenge)
                .append_pair("code_challenge_method", CODE_CHALLENGE_METHOD)
                .append_pair("resource", &self.server_url);
            if let Some(scope) = &self.scope {
                pairs.append_pair("scope", scope);
            }
        }
        Ok(url.to_string())
    }

    /// Finish the flow with the code and state returned to the redirect
    /// target. The stored state nonce and PKCE verifier are consumed by
    /// this call whatever its outcome; a second completion attempt always
    /// fails.
    pub async fn complete_authorization_flow(&self, code: &str, state: &str) -> Result<Token> {
        let stored_state = self.storage.state_token(&self.server_url);
        self.storage.delete_state_token(&self.server_url);
        let pkce = self.storage.pkce(&self.server_url);
        self.storage.delete_pkce(&self.server_url);

        match stored_state {
            Some(stored) if stored == state => {},
            _ => {
                return Err(Error::Connection(
                    "OAuth state mismatch; aborting authorization".into(),
                ))
            },
        }
        let pkce = pkce.ok_or_else(|| {
            Error::Connection("no PKCE verifier for pending authorization".into())
        })?;

        let metadata = self.discover_metadata().await?;
        let client = self.ensure_client_info(&metadata).await?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.redirect_uri.clone()),
            ("client_id", client.client_id.clone()),
            ("code_verifier", pkce.verifier),
            ("resource", self.server_url.clone()),
        ];
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let token = self.token_request(&metadata.token_endpoint, &form).await?;
        self.storage.set_token(&self.server_url, token.clone());
        Ok(token)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Token> {
        let metadata = self.discover_metadata().await?;
        let client = self.ensure_client_info(&metadata).await?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", client.client_id.clone()),
            ("resource", self.server_url.clone()),
        ];
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let mut token = self.token_request(&metadata.token_endpoint, &form).await?;
        // Servers may rotate or omit the refresh token; keep the old one
        // when none comes back.
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        self.storage.set_token(&self.server_url, token.clone());
        Ok(token)
    }

    async fn token_request(&self, endpoint: &str, form: &[(&str, String)]) -> Result<Token> {
        let response = self
            .http
            .post(endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("token request failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Connection(format!("token request failed: {e}")))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|doc| {
                    doc.get("error_description")
                        .or_else(|| doc.get("error"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(Error::Connection(format!(
                "token endpoint returned HTTP {status}: {detail}"
            )));
        }

        let doc: Value = serde_json::from_str(&body)
            .map_err(|e| Error::Connection(format!("invalid token response: {e}")))?;
        Token::from_response(&doc)
    }

    /// Discover authorization server metadata for this MCP server.
    ///
    /// Order: cached metadata, the RFC 9728 protected-resource document
    /// (following an advertised authorization server), the RFC 8414
    /// well-known document on the server origin, then constructed defaults.
    pub async fn discover_metadata(&self) -> Result<ServerMetadata> {
        if let Some(metadata) = self.storage.server_metadata(&self.server_url) {
            return Ok(metadata);
        }
        let origin = self.origin()?;
        let mut metadata: Option<ServerMetadata> = None;

        if let Some(doc) = self
            .fetch_well_known(&origin, ".well-known/oauth-protected-resource")
            .await
        {
            if let Some(as_url) = doc
                .get("authorization_servers")
                .and_then(|v| v.get(0))
                .and_then(Value::as_str)
            {
                if let Ok(as_origin) = Url::parse(as_url) {
                    if let Some(doc) = self
                        .fetch_well_known(&as_origin, ".well-known/oauth-authorization-server")
                        .await
                    {
                        metadata = parse_metadata(&doc);
                    }
                }
            }
            if metadata.is_none() {
                metadata = parse_metadata(&doc);
            }
        }
        if metadata.is_none() {
            if let Some(doc) = self
                .fetch_well_known(&origin, ".well-known/oauth-authorization-server")
                .await
            {
                metadata = parse_metadata(&doc);
            }
        }

        let metadata = match metadata {
            Some(m) => m,
            None => {
                debug!(%origin, "no OAuth discovery document; using default endpoints");
                ServerMetadata {
                    issuer: Some(origin.to_string()),
                    authorization_endpoint: origin
                        .join("authorize")
                        .map_err(|e| Error::Connection(format!("invalid origin: {e}")))?
                        .to_string(),
                    token_endpoint: origin
                        .join("token")
                        .map_err(|e| Error::Connection(format!("invalid origin: {e}")))?
                        .to_string(),
                    registration_endpoint: None,
                }
            },
        };

        self.require_https(&metadata.authorization_endpoint)?;
        self.require_https(&metadata.token_endpoint)?;
        if let Some(registration) = &metadata.registration_endpoint {
            self.require_https(registration)?;
        }

        self.storage
            .set_server_metadata(&self.server_url, metadata.clone());
        Ok(metadata)
    }

    async fn ensure_client_info(&self, metadata: &ServerMetadata) -> Result<OAuthClientInfo> {
        if let Some(info) = self.storage.client_info(&self.server_url) {
            return Ok(info);
        }
        let registration_endpoint = metadata.registration_endpoint.as_ref().ok_or_else(|| {
            Error::Connection(
                "no stored client credentials and the server does not support dynamic registration"
                    .into(),
            )
        })?;

        let mut payload = json!({
            "client_name": crate::CLIENT_NAME,
            "redirect_uris": [self.redirect_uri],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none",
        });
        if let Some(scope) = &self.scope {
            payload["scope"] = json!(scope);
        }

        let response = self
            .http
            .post(registration_endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("client registration failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Connection(format!(
                "client registration failed: HTTP {}",
                response.status()
            )));
        }
        let doc: Value = response
            .json()
            .await
            .map_err(|e| Error::Connection(format!("invalid registration response: {e}")))?;

        let client_id = doc
            .get("client_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Connection("registration response missing client_id".into()))?
            .to_string();
        let info = OAuthClientInfo {
            client_id,
            client_secret: doc
                .get("client_secret")
                .and_then(Value::as_str)
                .map(str::to_string),
            redirect_uris: vec![self.redirect_uri.clone()],
        };
        debug!(client_id = %info.client_id, "registered OAuth client");
        self.storage.set_client_info(&self.server_url, info.clone());
        Ok(info)
    }

    async fn fetch_well_known(&self, origin: &Url, path: &str) -> Option<Value> {
        let url = origin.join(path).ok()?;
        let response = self
            .http
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!(%url, status = %response.status(), "discovery document absent");
            return None;
        }
        response.json().await.ok()
    }

    /// Scheme + host + port of the MCP server URL, path dropped.
    fn origin(&self) -> Result<Url> {
        let mut origin = Url::parse(&self.server_url)
            .map_err(|e| Error::Config(format!("invalid server_url: {e}")))?;
        origin.set_path("");
        origin.set_query(None);
        origin.set_fragment(None);
        Ok(origin)
    }

    fn require_https(&self, endpoint: &str) -> Result<()> {
        if self.allow_insecure {
            return Ok(());
        }
        let url = Url::parse(endpoint)
            .map_err(|e| Error::Connection(format!("invalid OAuth endpoint '{endpoint}': {e}")))?;
        if url.scheme() != "https" {
            return Err(Error::Connection(format!(
                "OAuth endpoints must use HTTPS: {endpoint}"
            )));
        }
        Ok(())
    }
}

fn parse_metadata(doc: &Value) -> Option<ServerMetadata> {
    Some(ServerMetadata {
        issuer: doc
            .get("issuer")
            .and_then(Value::as_str)
            .map(str::to_string),
        authorization_endpoint: doc
            .get("authorization_endpoint")
            .and_then(Value::as_str)?
            .to_string(),
        token_endpoint: doc.get("token_endpoint").and_then(Value::as_str)?.to_string(),
        registration_endpoint: doc
            .get("registration_endpoint")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OAuthProvider {
        OAuthProvider::new("https://mcp.example.com/v1/sse", "http://localhost:8090/callback")
            .unwrap()
    }

    #[test]
    fn token_expiry_logic() {
        let mut token = Token {
            access_token: "abc".into(),
            token_type: "Bearer".into(),
            expires_at: None,
            scope: None,
            refresh_token: None,
        };
        assert!(!token.expired());
        assert!(!token.expires_soon());

        token.expires_at = Some(SystemTime::now() + Duration::from_secs(60));
        assert!(!token.expired());
        assert!(token.expires_soon());

        token.expires_at = Some(SystemTime::now() - Duration::from_secs(1));
        assert!(token.expired());
        assert_eq!(token.to_header_value(), "Bearer abc");
    }

    #[test]
    fn origin_drops_path_query_and_fragment() {
        let provider = provider();
        assert_eq!(
            provider.origin().unwrap().as_str(),
            "https://mcp.example.com/"
        );
    }

    #[test]
    fn https_is_required_unless_insecure_flag_set() {
        let provider = provider();
        assert!(provider.require_https("https://auth.example.com/token").is_ok());
        assert!(provider.require_https("http://auth.example.com/token").is_err());

        let insecure = OAuthProvider::new("http://localhost:9000", "http://localhost:8090/cb")
            .unwrap()
            .allow_insecure(true);
        assert!(insecure.require_https("http://localhost:9000/token").is_ok());
    }

    #[test]
    fn metadata_parsing_requires_both_endpoints() {
        let complete = json!({
            "issuer": "https://auth.example.com",
            "authorization_endpoint": "https://auth.example.com/authorize",
            "token_endpoint": "https://auth.example.com/token",
        });
        assert!(parse_metadata(&complete).is_some());

        let partial = json!({"authorization_endpoint": "https://auth.example.com/authorize"});
        assert!(parse_metadata(&partial).is_none());
    }

    #[tokio::test]
    async fn state_mismatch_consumes_stored_entries() {
        let provider = provider();
        provider
            .storage
            .set_state_token(provider.server_url(), "expected".into());
        provider
            .storage
            .set_pkce(provider.server_url(), PkceParams::generate());

        let err = provider
            .complete_authorization_flow("code", "wrong")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("state mismatch"));
        // Single-use: both entries are gone even though the attempt failed.
        assert!(provider.storage.state_token(provider.server_url()).is_none());
        assert!(provider.storage.pkce(provider.server_url()).is_none());
    }

    #[tokio::test]
    async fn missing_token_requires_authorization() {
        let provider = provider();
        let err = provider.authorization_header().await.unwrap_err();
        assert!(err.to_string().contains("OAuth authorization required"));
        assert!(!provider.valid_token());
    }
}
