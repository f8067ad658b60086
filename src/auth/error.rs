//! Typed errors for the authentication flow
//!
//! Every failure the manager can surface maps onto one of five reportable
//! kinds (configuration, network, protocol, timeout, storage) so callers can
//! decide whether to retry, re-prompt, or give up without string matching.

use std::time::Duration;
use thiserror::Error;

/// Coarse classification of an [`AuthError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Network,
    Protocol,
    Timeout,
    Storage,
}

/// Errors raised while decoding or validating the loopback callback
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The `state` parameter did not carry the csrf token of this flow
    #[error("CSRF state mismatch, refusing callback")]
    CsrfMismatch,

    /// The identity provider redirected back with `error=...`
    #[error("Authorization failed: {code}{}", describe(.description))]
    ProviderError {
        code: String,
        description: Option<String>,
    },

    /// A required callback or response field was absent
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A field was present but could not be interpreted
    #[error("Malformed value: {0}")]
    Malformed(String),

    /// The listener received a request on a path other than the callback path
    #[error("Unexpected request: {0}")]
    UnexpectedRequest(String),
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

/// Authentication errors with typed variants
#[derive(Debug, Error)]
pub enum AuthError {
    /// Invalid local configuration (e.g. an unparseable port override)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The refresh service could not be reached
    #[error("Network error: {0}")]
    Network(String),

    /// The refresh service answered with a non-2xx status
    #[error("Token refresh rejected (HTTP {status}): {body}")]
    RefreshRejected { status: u16, body: String },

    /// Callback or response did not follow the expected protocol
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Nobody completed the interactive login in time
    #[error(
        "Authentication timed out after {}s. Complete the login manually by visiting: {auth_url}",
        .after.as_secs()
    )]
    Timeout { auth_url: String, after: Duration },

    /// Reading, writing or clearing the credential record failed
    #[error("Credential storage error: {0}")]
    Storage(String),

    /// A refresh was requested but the credential has no refresh token
    #[error("No refresh token available")]
    MissingRefreshToken,

    /// The system browser could not be opened
    #[error("Failed to launch browser: {0}")]
    Launch(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Configuration(_) => ErrorKind::Configuration,
            AuthError::Network(_) | AuthError::RefreshRejected { .. } => ErrorKind::Network,
            AuthError::Protocol(_) | AuthError::MissingRefreshToken => ErrorKind::Protocol,
            AuthError::Timeout { .. } => ErrorKind::Timeout,
            AuthError::Storage(_) => ErrorKind::Storage,
            // A browser that fails to open only degrades the flow to manual completion
            AuthError::Launch(_) => ErrorKind::Configuration,
        }
    }

    /// Authorization URL the user can open by hand to finish the login, if any
    pub fn fallback_url(&self) -> Option<&str> {
        match self {
            AuthError::Timeout { auth_url, .. } => Some(auth_url),
            _ => None,
        }
    }

    /// Whether this error was caused by the CSRF check failing
    pub fn is_csrf_mismatch(&self) -> bool {
        matches!(self, AuthError::Protocol(ProtocolError::CsrfMismatch))
    }

    /// Convert a non-success HTTP status and its body into an error
    pub fn from_http_status(status: reqwest::StatusCode, body: String) -> Self {
        AuthError::RefreshRejected {
            status: status.as_u16(),
            body,
        }
    }

    /// Convert transport-level reqwest failures into an error
    pub fn from_network_error(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AuthError::Network(format!("Request timeout: {}", e))
        } else if e.is_connect() {
            AuthError::Network(format!("Connection failed: {}", e))
        } else if e.is_decode() {
            AuthError::Protocol(ProtocolError::Malformed(format!(
                "refresh response: {}",
                e
            )))
        } else if let Some(status) = e.status() {
            Self::from_http_status(status, e.to_string())
        } else {
            AuthError::Network(e.to_string())
        }
    }

    pub(crate) fn storage(e: impl std::fmt::Display) -> Self {
        AuthError::Storage(e.to_string())
    }
}

pub type Result<T, E = AuthError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            AuthError::Configuration("bad port".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            AuthError::RefreshRejected {
                status: 400,
                body: "invalid_grant".into()
            }
            .kind(),
            ErrorKind::Network
        );
        assert_eq!(
            AuthError::from(ProtocolError::CsrfMismatch).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(AuthError::Storage("disk".into()).kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_timeout_carries_fallback_url() {
        let err = AuthError::Timeout {
            auth_url: "https://accounts.example.com/auth?x=1".into(),
            after: Duration::from_secs(300),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(
            err.fallback_url(),
            Some("https://accounts.example.com/auth?x=1")
        );
        let message = err.to_string();
        assert!(message.contains("300s"));
        assert!(message.contains("https://accounts.example.com/auth?x=1"));
    }

    #[test]
    fn test_from_http_status_keeps_body() {
        let err = AuthError::from_http_status(
            reqwest::StatusCode::UNAUTHORIZED,
            "{\"error\":\"invalid_grant\"}".to_string(),
        );
        match err {
            AuthError::RefreshRejected { status, body } => {
                assert_eq!(status, 401);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProtocolError::ProviderError {
            code: "access_denied".into(),
            description: Some("user cancelled".into()),
        };
        assert_eq!(
            err.to_string(),
            "Authorization failed: access_denied (user cancelled)"
        );

        let err = ProtocolError::ProviderError {
            code: "access_denied".into(),
            description: None,
        };
        assert_eq!(err.to_string(), "Authorization failed: access_denied");
    }

    #[test]
    fn test_csrf_helper() {
        assert!(AuthError::from(ProtocolError::CsrfMismatch).is_csrf_mismatch());
        assert!(!AuthError::MissingRefreshToken.is_csrf_mismatch());
    }
}
