//! Browser launching for the interactive login

use async_trait::async_trait;

use super::error::AuthError;

/// Set to any value to never try opening a browser
pub const ENV_NO_BROWSER: &str = "AUTHGATE_NO_BROWSER";

/// Opens the authorization URL for the user
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Whether a GUI browser can plausibly be shown in this environment
    fn can_launch_interactively(&self) -> bool;

    async fn launch(&self, url: &str) -> Result<(), AuthError>;
}

/// Launches the platform default browser
#[derive(Debug, Clone, Default)]
pub struct SystemBrowser;

impl SystemBrowser {
    pub fn new() -> Self {
        Self
    }

    fn env_allows_browser<F>(lookup: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        let is_set = |key: &str| lookup(key).is_some_and(|v| !v.is_empty());

        if is_set(ENV_NO_BROWSER) || is_set("CI") {
            return false;
        }

        let has_display = is_set("DISPLAY") || is_set("WAYLAND_DISPLAY");
        if is_set("SSH_CONNECTION") && !has_display {
            return false;
        }

        if cfg!(target_os = "linux") && !has_display {
            return false;
        }

        true
    }
}

#[async_trait]
impl BrowserLauncher for SystemBrowser {
    fn can_launch_interactively(&self) -> bool {
        Self::env_allows_browser(|key| std::env::var(key).ok())
    }

    async fn launch(&self, url: &str) -> Result<(), AuthError> {
        let url = url.to_string();
        tokio::task::spawn_blocking(move || open::that(&url))
            .await
            .map_err(|e| AuthError::Launch(e.to_string()))?
            .map_err(|e| AuthError::Launch(e.to_string()))
    }
}
