//! Pluggable OAuth credential storage.
//!
//! Everything is keyed by the MCP server URL the credentials belong to, so
//! one store can serve many providers. Implementations must be safe for
//! concurrent use; the default keeps entries in process memory only, so
//! tokens survive a restart only when the embedder supplies a persistent
//! implementation.

use crate::auth::oauth::{OAuthClientInfo, ServerMetadata, Token};
use crate::auth::pkce::PkceParams;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Storage contract for OAuth state, keyed by server URL.
pub trait TokenStorage: Send + Sync + std::fmt::Debug {
    /// Stored access token.
    fn token(&self, server_url: &str) -> Option<Token>;
    /// Persist an access token.
    fn set_token(&self, server_url: &str, token: Token);
    /// Remove the access token.
    fn delete_token(&self, server_url: &str);

    /// Stored client registration.
    fn client_info(&self, server_url: &str) -> Option<OAuthClientInfo>;
    /// Persist a client registration.
    fn set_client_info(&self, server_url: &str, info: OAuthClientInfo);
    /// Remove the client registration.
    fn delete_client_info(&self, server_url: &str);

    /// Stored authorization server metadata.
    fn server_metadata(&self, server_url: &str) -> Option<ServerMetadata>;
    /// Persist authorization server metadata.
    fn set_server_metadata(&self, server_url: &str, metadata: ServerMetadata);
    /// Remove authorization server metadata.
    fn delete_server_metadata(&self, server_url: &str);

    /// PKCE pair for the in-flight authorization attempt.
    fn pkce(&self, server_url: &str) -> Option<PkceParams>;
    /// Persist a PKCE pair.
    fn set_pkce(&self, server_url: &str, pkce: PkceParams);
    /// Remove the PKCE pair.
    fn delete_pkce(&self, server_url: &str);

    /// CSRF state nonce for the in-flight authorization attempt.
    fn state_token(&self, server_url: &str) -> Option<String>;
    /// Persist a state nonce.
    fn set_state_token(&self, server_url: &str, state: String);
    /// Remove the state nonce.
    fn delete_state_token(&self, server_url: &str);
}

/// Process-local storage; the default.
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    tokens: RwLock<HashMap<String, Token>>,
    clients: RwLock<HashMap<String, OAuthClientInfo>>,
    metadata: RwLock<HashMap<String, ServerMetadata>>,
    pkce: RwLock<HashMap<String, PkceParams>>,
    states: RwLock<HashMap<String, String>>,
}

impl MemoryTokenStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn token(&self, server_url: &str) -> Option<Token> {
        self.tokens.read().get(server_url).cloned()
    }
    fn set_token(&self, server_url: &str, token: Token) {
        self.tokens.write().insert(server_url.to_string(), token);
    }
    fn delete_token(&self, server_url: &str) {
        self.tokens.write().remove(server_url);
    }

    fn client_info(&self, server_url: &str) -> Option<OAuthClientInfo> {
        self.clients.read().get(server_url).cloned()
    }
    fn set_client_info(&self, server_url: &str, info: OAuthClientInfo) {
        self.clients.write().insert(server_url.to_string(), info);
    }
    fn delete_client_info(&self, server_url: &str) {
        self.clients.write().remove(server_url);
    }

    fn server_metadata(&self, server_url: &str) -> Option<ServerMetadata> {
        self.metadata.read().get(server_url).cloned()
    }
    fn set_server_metadata(&self, server_url: &str, metadata: ServerMetadata) {
        self.metadata
            .write()
            .insert(server_url.to_string(), metadata);
    }
    fn delete_server_metadata(&self, server_url: &str) {
        self.metadata.write().remove(server_url);
    }

    fn pkce(&self, server_url: &str) -> Option<PkceParams> {
        self.pkce.read().get(server_url).cloned()
    }
    fn set_pkce(&self, server_url: &str, pkce: PkceParams) {
        self.pkce.write().insert(server_url.to_string(), pkce);
    }
    fn delete_pkce(&self, server_url: &str) {
        self.pkce.write().remove(server_url);
    }

    fn state_token(&self, server_url: &str) -> Option<String> {
        self.states.read().get(server_url).cloned()
    }
    fn set_state_token(&self, server_url: &str, state: String) {
        self.states.write().insert(server_url.to_string(), state);
    }
    fn delete_state_token(&self, server_url: &str) {
        self.states.write().remove(server_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_isolated_per_server_url() {
        let storage = MemoryTokenStorage::new();
        storage.set_state_token("https://a.example", "state-a".into());
        storage.set_state_token("https://b.example", "state-b".into());

        assert_eq!(
            storage.state_token("https://a.example").as_deref(),
            Some("state-a")
        );
        storage.delete_state_token("https://a.example");
        assert!(storage.state_token("https://a.example").is_none());
        assert_eq!(
            storage.state_token("https://b.example").as_deref(),
            Some("state-b")
        );
    }

    #[test]
    fn kinds_are_independent() {
        let storage = MemoryTokenStorage::new();
        let pkce = PkceParams::generate();
        storage.set_pkce("https://a.example", pkce.clone());
        storage.delete_token("https://a.example");
        assert_eq!(storage.pkce("https://a.example"), Some(pkce));
    }
}
