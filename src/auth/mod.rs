//! OAuth 2.1 authorization for the HTTP transport family.
//!
//! The provider implements discovery, dynamic client registration
//! (RFC 7591), the PKCE authorization code flow (S256 only), resource-bound
//! tokens (RFC 8707), and token refresh. Credential storage is pluggable;
//! the default keeps everything process-local.

pub mod oauth;
pub mod pkce;
pub mod storage;

pub use oauth::{OAuthClientInfo, OAuthProvider, ServerMetadata, Token};
pub use pkce::{PkceParams, CODE_CHALLENGE_METHOD};
pub use storage::{MemoryTokenStorage, TokenStorage};
