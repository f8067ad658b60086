//! Authentication manager
//!
//! Owns the credential lifecycle for one set of requested scopes:
//!
//! 1. reuse the in-memory credential, refreshing it when it is about to expire
//! 2. otherwise adopt the persisted credential if it grants every requested scope
//! 3. otherwise run the interactive browser login, racing it against a timeout
//!
//! All phases run under one async mutex, so concurrent callers share a single
//! refresh or login instead of racing each other with the same refresh token.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;

use super::browser::{BrowserLauncher, SystemBrowser};
use super::callback::CallbackListener;
use super::credential::Credential;
use super::error::AuthError;
use super::refresh::{RefreshClient, TokenRefresher};
use super::store::{CredentialStore, FileCredentialStore};
use crate::config::Config;

/// Receives human-readable progress messages during the interactive login
pub type StatusObserver = Arc<dyn Fn(&str) + Send + Sync>;

pub struct AuthManager {
    scopes: Vec<String>,
    refresh_lookahead: Duration,
    auth_timeout: Duration,
    auth_url_path: PathBuf,
    listener: CallbackListener,
    store: Arc<dyn CredentialStore>,
    browser: Arc<dyn BrowserLauncher>,
    refresher: Arc<dyn TokenRefresher>,
    /// Most recently validated or refreshed credential
    current: Mutex<Option<Credential>>,
    observer: RwLock<Option<StatusObserver>>,
}

impl AuthManager {
    /// Manager backed by the file store, the system browser and the remote refresh service
    ///
    /// An empty `scopes` list falls back to the configured default scopes.
    pub fn new(config: &Config, scopes: Vec<String>) -> Result<Self, AuthError> {
        let store = FileCredentialStore::from_path_or_default(
            config.storage.credentials_path.as_deref(),
        )?;
        let refresher = RefreshClient::new(&config.oauth.refresh_service_url);

        Ok(Self::with_components(
            config,
            scopes,
            Arc::new(store),
            Arc::new(SystemBrowser::new()),
            Arc::new(refresher),
        ))
    }

    pub fn with_components(
        config: &Config,
        scopes: Vec<String>,
        store: Arc<dyn CredentialStore>,
        browser: Arc<dyn BrowserLauncher>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        let scopes = if scopes.is_empty() {
            config.oauth.scopes.clone()
        } else {
            scopes
        };

        Self {
            listener: CallbackListener::new(&config.callback, &config.oauth, scopes.clone()),
            scopes,
            refresh_lookahead: config.oauth.refresh_lookahead(),
            auth_timeout: config.oauth.auth_timeout(),
            auth_url_path: config.storage.auth_url_path(),
            store,
            browser,
            refresher,
            current: Mutex::new(None),
            observer: RwLock::new(None),
        }
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Register the progress observer, replacing any previous one
    pub fn set_status_observer<F>(&self, observer: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.observer.write() {
            *slot = Some(Arc::new(observer));
        }
    }

    pub fn clear_status_observer(&self) {
        if let Ok(mut slot) = self.observer.write() {
            *slot = None;
        }
    }

    /// Snapshot of the in-memory credential
    pub async fn cached_credential(&self) -> Option<Credential> {
        self.current.lock().await.clone()
    }

    /// Load the persisted credential into memory if it grants the requested scopes
    ///
    /// Returns whether a credential was adopted.
    pub async fn initialize(&self) -> Result<bool, AuthError> {
        let mut current = self.current.lock().await;
        match self.store.load().await? {
            Some(stored) if stored.covers_scopes(&self.scopes) => {
                *current = Some(stored);
                tracing::info!("Loaded stored credential");
                Ok(true)
            }
            Some(_) => {
                tracing::debug!("Stored credential lacks requested scopes, not loading it");
                Ok(false)
            }
            None => {
                tracing::debug!("No stored credential found");
                Ok(false)
            }
        }
    }

    /// Return a usable credential, logging the user in if nothing else works
    pub async fn get_authenticated_credential(&self) -> Result<Credential, AuthError> {
        let mut current = self.current.lock().await;

        if let Some(cached) = current.clone().filter(Credential::has_refresh_token) {
            match self.ensure_fresh(cached).await {
                Ok(fresh) => {
                    *current = Some(fresh.clone());
                    return Ok(fresh);
                }
                Err(e) => {
                    tracing::warn!("Proactive token refresh failed: {}", e);
                    *current = None;
                    self.discard_stored().await;
                }
            }
        }

        match self.store.load().await {
            Ok(Some(stored)) if !stored.covers_scopes(&self.scopes) => {
                tracing::info!(
                    "Stored credential does not grant all requested scopes ({}), signing in again",
                    self.scopes.join(" ")
                );
                self.discard_stored().await;
            }
            Ok(Some(stored)) => match self.ensure_fresh(stored).await {
                Ok(fresh) => {
                    *current = Some(fresh.clone());
                    return Ok(fresh);
                }
                Err(e) => {
                    tracing::warn!("Stored credential could not be refreshed: {}", e);
                    self.discard_stored().await;
                }
            },
            Ok(None) => tracing::debug!("No stored credential found"),
            Err(e) => tracing::warn!("Could not load stored credential: {}", e),
        }

        let credential = self.interactive_login().await?;
        self.persist(&credential).await;
        *current = Some(credential.clone());
        Ok(credential)
    }

    /// Refresh the in-memory credential through the remote refresh service
    ///
    /// On failure the in-memory credential is left as it was.
    pub async fn refresh_token(&self) -> Result<Credential, AuthError> {
        let mut current = self.current.lock().await;
        let existing = current.as_ref().ok_or(AuthError::MissingRefreshToken)?;
        let refreshed = self.refresh(existing).await.inspect_err(|e| {
            tracing::error!("Token refresh failed: {}", e);
        })?;

        self.persist(&refreshed).await;
        *current = Some(refreshed.clone());
        Ok(refreshed)
    }

    /// Forget the credential in memory and on disk
    ///
    /// Idempotent: clearing when nothing is stored succeeds.
    pub async fn clear_auth(&self) -> Result<(), AuthError> {
        self.current.lock().await.take();

        match tokio::fs::remove_file(&self.auth_url_path).await {
            Ok(()) => tracing::debug!("Removed {:?}", self.auth_url_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Could not remove {:?}: {}", self.auth_url_path, e),
        }

        self.store.clear().await.inspect_err(|e| {
            tracing::error!("Failed to clear stored credential: {}", e);
        })?;
        tracing::info!("Signed out");
        Ok(())
    }

    /// Refresh if the credential expires within the lookahead window
    async fn ensure_fresh(&self, credential: Credential) -> Result<Credential, AuthError> {
        if !credential.expires_within(self.refresh_lookahead) {
            return Ok(credential);
        }

        tracing::info!("Access token expiring soon, refreshing");
        let refreshed = self.refresh(&credential).await?;
        self.persist(&refreshed).await;
        Ok(refreshed)
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError> {
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingRefreshToken)?;

        let response = self.refresher.refresh(refresh_token).await?;
        Ok(credential.merge_refresh(response))
    }

    async fn persist(&self, credential: &Credential) {
        if let Err(e) = self.store.save(credential).await {
            tracing::warn!("Could not persist credential, keeping it in memory only: {}", e);
        }
    }

    async fn discard_stored(&self) {
        if let Err(e) = self.store.clear().await {
            tracing::warn!("Could not clear stored credential: {}", e);
        }
    }

    async fn interactive_login(&self) -> Result<Credential, AuthError> {
        let interactive = self.browser.can_launch_interactively();
        let mut pending = self.listener.start(!interactive).await?;
        let auth_url = pending.auth_url().to_string();

        self.publish_auth_url(&auth_url).await;
        self.notify(&format!(
            "Please visit the following URL to authenticate:\n{}",
            auth_url
        ));

        if interactive {
            match self.browser.launch(&auth_url).await {
                Ok(()) => self.notify("Opened the login page in your browser"),
                Err(e) => {
                    tracing::warn!("{}", e);
                    self.notify("Could not open a browser, open the URL above manually");
                }
            }
        }

        self.notify("Waiting for authentication...");
        let outcome = tokio::time::timeout(self.auth_timeout, pending.wait()).await;
        pending.close();

        match outcome {
            Ok(Ok(credential)) => {
                tracing::info!("Authentication completed");
                self.notify("Authentication successful");
                Ok(credential)
            }
            Ok(Err(e)) => {
                tracing::error!("Authentication failed: {}", e);
                Err(e)
            }
            Err(_) => {
                tracing::error!(
                    "Authentication timed out after {}s",
                    self.auth_timeout.as_secs()
                );
                Err(AuthError::Timeout {
                    auth_url,
                    after: self.auth_timeout,
                })
            }
        }
    }

    /// Make the URL reachable without a browser: stderr plus a well-known file
    async fn publish_auth_url(&self, auth_url: &str) {
        eprintln!();
        eprintln!("Sign in by opening this URL in a browser:");
        eprintln!("{}", auth_url);
        eprintln!();

        if let Err(e) = tokio::fs::write(&self.auth_url_path, auth_url).await {
            tracing::warn!(
                "Could not write authorization URL to {:?}: {}",
                self.auth_url_path,
                e
            );
        }
    }

    fn notify(&self, message: &str) {
        let observer = self
            .observer
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().cloned());
        if let Some(observer) = observer {
            observer(message);
        }
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("scopes", &self.scopes)
            .field("refresh_lookahead", &self.refresh_lookahead)
            .field("auth_timeout", &self.auth_timeout)
            .finish_non_exhaustive()
    }
}
