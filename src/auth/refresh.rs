//! Client for the remote token refresh service
//!
//! The service holds the OAuth client secret, so the refresh goes through it
//! rather than straight to the provider: `POST <base>/refreshToken` with
//! `{"refresh_token": ...}`, answering with JSON mergeable into a credential.

use async_trait::async_trait;
use serde::Serialize;

use super::credential::RefreshResponse;
use super::error::AuthError;

/// Exchanges a refresh token for a fresh access token
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, AuthError>;
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// HTTP implementation of [`TokenRefresher`]
#[derive(Debug, Clone)]
pub struct RefreshClient {
    client: reqwest::Client,
    endpoint: String,
}

impl RefreshClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/refreshToken", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TokenRefresher for RefreshClient {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, AuthError> {
        tracing::debug!("Refreshing OAuth token via {}", self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(AuthError::from_network_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::from_http_status(status, body));
        }

        response
            .json::<RefreshResponse>()
            .await
            .map_err(AuthError::from_network_error)
    }
}
