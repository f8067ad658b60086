//! Credential record and the refresh response that updates it

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Lifetime assumed when a refresh response carries no expiry at all
const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// OAuth credential with its scope and expiry metadata
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Opaque token for API calls
    pub access_token: String,
    /// Needed for unattended use; absent credentials can only be used until expiry
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Space-delimited granted scopes
    #[serde(default)]
    pub scope: Option<String>,
    /// Absolute expiry, epoch milliseconds
    pub expiry_date: i64,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expiry_date", &self.expiry_date)
            .finish()
    }
}

impl Credential {
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }

    /// True when the credential expires within `lookahead` from now (or already has)
    pub fn expires_within(&self, lookahead: Duration) -> bool {
        let lookahead_ms = i64::try_from(lookahead.as_millis()).unwrap_or(i64::MAX);
        self.expiry_date <= now_millis().saturating_add(lookahead_ms)
    }

    /// Milliseconds left before expiry, negative once expired
    pub fn millis_until_expiry(&self) -> i64 {
        self.expiry_date.saturating_sub(now_millis())
    }

    pub fn granted_scopes(&self) -> HashSet<&str> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// Whether every requested scope was granted
    pub fn covers_scopes<S: AsRef<str>>(&self, requested: &[S]) -> bool {
        let granted = self.granted_scopes();
        requested
            .iter()
            .all(|scope| granted.contains(scope.as_ref()))
    }

    /// Apply a refresh response, keeping the refresh token unless a new one was issued
    pub fn merge_refresh(&self, response: RefreshResponse) -> Credential {
        let expiry_date = response.expiry_date.unwrap_or_else(|| {
            let lifetime_ms = response
                .expires_in
                .unwrap_or(DEFAULT_LIFETIME_SECS)
                .saturating_mul(1000);
            now_millis().saturating_add(lifetime_ms)
        });

        Credential {
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .filter(|token| !token.is_empty())
                .or_else(|| self.refresh_token.clone()),
            token_type: response.token_type.or_else(|| self.token_type.clone()),
            scope: response.scope.or_else(|| self.scope.clone()),
            expiry_date,
        }
    }
}

/// Body returned by the remote refresh service
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Absolute expiry, epoch milliseconds
    #[serde(default)]
    pub expiry_date: Option<i64>,
    /// Relative lifetime in seconds, used when `expiry_date` is absent
    #[serde(default)]
    pub expires_in: Option<i64>,
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
