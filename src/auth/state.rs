//! CSRF token generation and the OAuth `state` parameter codec
//!
//! The state sent to the provider is base64 of a small JSON object:
//! `{"uri": <loopback callback>, "manual": <bool>, "csrf": <token>}`.
//! The relay uses `uri` to know where to forward the browser. On the way
//! back the listener accepts either that wrapper or the bare csrf token.

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use super::error::ProtocolError;

/// Random bytes per csrf token (256 bits)
const CSRF_BYTES: usize = 32;

/// Decoded form of the `state` parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    /// Loopback URL the relay should redirect to
    pub uri: String,
    /// True when the user has to open the URL by hand
    pub manual: bool,
    pub csrf: String,
}

impl AuthState {
    pub fn new(uri: impl Into<String>, manual: bool) -> Self {
        Self {
            uri: uri.into(),
            manual,
            csrf: generate_csrf_token(),
        }
    }

    /// Encode as the value of the `state` query parameter
    pub fn encode(&self) -> String {
        // Serializing a struct of strings and a bool cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    /// Decode a base64 JSON state, tolerating url-safe and unpadded alphabets
    pub fn decode(encoded: &str) -> Result<Self, ProtocolError> {
        let bytes = [&STANDARD, &URL_SAFE, &URL_SAFE_NO_PAD]
            .iter()
            .find_map(|engine| engine.decode(encoded.trim()).ok())
            .ok_or_else(|| ProtocolError::Malformed("state is not base64".to_string()))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| ProtocolError::Malformed(format!("state is not a JSON object: {}", e)))
    }
}

/// Generate a url-safe random csrf token
pub fn generate_csrf_token() -> String {
    let mut bytes = [0u8; CSRF_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Check a callback `state` against the csrf token of the pending flow
///
/// Accepts the raw token (legacy callers) or the base64 JSON wrapper.
// TODO: drop the raw-token branch once no relay deployment still echoes bare tokens.
pub fn verify_state(expected_csrf: &str, received: &str) -> Result<(), ProtocolError> {
    if constant_time_eq(expected_csrf.as_bytes(), received.as_bytes()) {
        return Ok(());
    }

    match AuthState::decode(received) {
        Ok(state) if constant_time_eq(expected_csrf.as_bytes(), state.csrf.as_bytes()) => Ok(()),
        _ => Err(ProtocolError::CsrfMismatch),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
