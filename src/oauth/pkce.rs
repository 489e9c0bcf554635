//! PKCE (RFC 7636) parameter generation for the authorization-code flow.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// One flow's PKCE material plus the CSRF state token.
#[derive(Debug, Clone)]
pub struct PkceParams {
    /// 32 random bytes, base64url without padding.
    pub verifier: String,
    /// SHA-256 of the verifier, base64url without padding (method S256).
    pub challenge: String,
    /// 16 random bytes, base64url without padding.
    pub state: String,
}

impl PkceParams {
    pub fn generate() -> Self {
        let mut verifier_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut verifier_bytes);
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

        let mut state_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut state_bytes);
        let state = URL_SAFE_NO_PAD.encode(state_bytes);

        Self {
            verifier,
            challenge,
            state,
        }
    }
}
