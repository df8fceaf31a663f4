//! PKCE (RFC 7636) parameters.
//!
//! Only the S256 challenge method exists here; the plaintext method is
//! deliberately unrepresentable.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The only supported code challenge method.
pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// A one-shot PKCE verifier/challenge pair for a single authorization
/// attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceParams {
    /// High-entropy code verifier (base64url, unpadded).
    pub verifier: String,
    /// `BASE64URL(SHA-256(verifier))`.
    pub challenge: String,
}

impl PkceParams {
    /// Generate a fresh pair from 64 random bytes (an 86-character
    /// verifier, comfortably inside RFC 7636's 43..=128 bounds).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 64];
        rand::rng().fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = Self::challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// Compute the S256 challenge for a verifier.
    pub fn challenge_for(verifier: &str) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
    }
}
