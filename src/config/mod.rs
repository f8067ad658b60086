//! Configuration management for authgate

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::AuthError;

/// Public client id of the installed-app OAuth client
pub const DEFAULT_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
pub const DEFAULT_AUTHORIZATION_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_RELAY_REDIRECT_URI: &str = "https://auth.authgate.dev/oauth2callback";
pub const DEFAULT_REFRESH_SERVICE_URL: &str = "https://auth.authgate.dev";

pub const ENV_CLIENT_ID: &str = "AUTHGATE_CLIENT_ID";
pub const ENV_REFRESH_URL: &str = "AUTHGATE_REFRESH_URL";
pub const ENV_CALLBACK_PORT: &str = "OAUTH_CALLBACK_PORT";
pub const ENV_CALLBACK_HOST: &str = "OAUTH_CALLBACK_HOST";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub oauth: OAuthConfig,
    pub callback: CallbackConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: String,
    pub authorization_endpoint: String,
    /// External relay the provider redirects to; it forwards tokens to the loopback listener
    pub relay_redirect_uri: String,
    /// Base URL of the service exposing `POST /refreshToken`
    pub refresh_service_url: String,
    /// Scopes requested when the caller does not pass any
    pub scopes: Vec<String>,
    /// How long to wait for the user to finish the browser login (default: 300 = 5 minutes)
    pub auth_timeout_secs: u64,
    /// Refresh proactively when the credential expires within this window
    pub refresh_lookahead_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            authorization_endpoint: DEFAULT_AUTHORIZATION_ENDPOINT.to_string(),
            relay_redirect_uri: DEFAULT_RELAY_REDIRECT_URI.to_string(),
            refresh_service_url: DEFAULT_REFRESH_SERVICE_URL.to_string(),
            scopes: vec![
                "https://www.googleapis.com/auth/cloud-platform".to_string(),
                "https://www.googleapis.com/auth/userinfo.email".to_string(),
            ],
            auth_timeout_secs: 300,
            refresh_lookahead_secs: 300,
        }
    }
}

impl OAuthConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn refresh_lookahead(&self) -> Duration {
        Duration::from_secs(self.refresh_lookahead_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub host: String,
    /// Fixed port for the loopback listener; an ephemeral one is picked when unset
    pub port: Option<u16>,
    pub path: String,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            path: "/oauth2callback".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Where the credential record lives (default: <data dir>/authgate/credentials.json)
    pub credentials_path: Option<PathBuf>,
    /// Where the pending authorization URL is written for manual completion
    pub auth_url_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn auth_url_path(&self) -> PathBuf {
        self.auth_url_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("authgate-auth-url.txt"))
    }
}

/// Values given on the command line; they win over file and environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Config file to read instead of the default location
    pub config_path: Option<PathBuf>,
    pub credentials_path: Option<PathBuf>,
}

impl Config {
    /// Load the config file, then environment overrides, then `overrides`
    pub fn load(overrides: &ConfigOverrides) -> Result<Self, AuthError> {
        let mut config = match overrides.config_path.clone().or_else(Self::default_path) {
            Some(path) => Self::from_file(&path)?,
            None => Config::default(),
        };
        config.apply_env()?;

        if let Some(path) = &overrides.credentials_path {
            config.storage.credentials_path = Some(path.clone());
        }
        Ok(config)
    }

    /// Parse a TOML config file; a missing file yields the defaults
    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config file at {:?}, using defaults", path);
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(AuthError::Configuration(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        toml::from_str(&content).map_err(|e| {
            AuthError::Configuration(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    /// `<config dir>/authgate/config.toml`, when a config directory exists
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "authgate")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), AuthError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (tests pass a map here)
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), AuthError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(client_id) = lookup(ENV_CLIENT_ID) {
            self.oauth.client_id = client_id;
        }
        if let Some(url) = lookup(ENV_REFRESH_URL) {
            self.oauth.refresh_service_url = url.trim_end_matches('/').to_string();
        }
        if let Some(host) = lookup(ENV_CALLBACK_HOST) {
            self.callback.host = host;
        }
        if let Some(raw) = lookup(ENV_CALLBACK_PORT) {
            let port = raw.trim().parse::<u16>().map_err(|_| {
                AuthError::Configuration(format!(
                    "Invalid value for {}: {:?} (expected a port number)",
                    ENV_CALLBACK_PORT, raw
                ))
            })?;
            self.callback.port = Some(port);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.callback.host, "127.0.0.1");
        assert_eq!(config.callback.port, None);
        assert_eq!(config.callback.path, "/oauth2callback");
        assert_eq!(config.oauth.auth_timeout(), Duration::from_secs(300));
        assert_eq!(config.oauth.refresh_lookahead(), Duration::from_secs(300));
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            (ENV_CLIENT_ID, "my-client"),
            (ENV_REFRESH_URL, "http://localhost:9000/"),
            (ENV_CALLBACK_HOST, "localhost"),
            (ENV_CALLBACK_PORT, "8765"),
        ]);
        let mut config = Config::default();
        config.apply_env_from(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.oauth.client_id, "my-client");
        assert_eq!(config.oauth.refresh_service_url, "http://localhost:9000");
        assert_eq!(config.callback.host, "localhost");
        assert_eq!(config.callback.port, Some(8765));
    }

    #[test]
    fn test_invalid_port_override_is_configuration_error() {
        for bad in ["abc", "70000", "-1"] {
            let vars = env(&[(ENV_CALLBACK_PORT, bad)]);
            let mut config = Config::default();
            let err = config.apply_env_from(|k| vars.get(k).cloned()).unwrap_err();
            assert!(matches!(err, AuthError::Configuration(_)), "{bad}");
        }
    }

    #[test]
    fn test_empty_override_is_ignored() {
        let vars = env(&[(ENV_CALLBACK_PORT, "  "), (ENV_CLIENT_ID, "")]);
        let mut config = Config::default();
        config.apply_env_from(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.callback.port, None);
        assert_eq!(config.oauth.client_id, DEFAULT_CLIENT_ID);
    }

    #[test]
    fn test_from_file_missing_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.callback.path, "/oauth2callback");
        assert_eq!(config.oauth.client_id, DEFAULT_CLIENT_ID);
    }

    #[test]
    fn test_from_file_invalid_toml_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[callback\nport = ").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_load_applies_command_line_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [storage]
            credentials_path = "/from/file.json"

            [oauth]
            auth_timeout_secs = 42
            "#,
        )
        .unwrap();

        let from_file = Config::load(&ConfigOverrides {
            config_path: Some(path.clone()),
            credentials_path: None,
        })
        .unwrap();
        assert_eq!(from_file.oauth.auth_timeout_secs, 42);
        assert_eq!(
            from_file.storage.credentials_path,
            Some(PathBuf::from("/from/file.json"))
        );

        let overridden = Config::load(&ConfigOverrides {
            config_path: Some(path),
            credentials_path: Some(dir.path().join("cli.json")),
        })
        .unwrap();
        assert_eq!(overridden.oauth.auth_timeout_secs, 42);
        assert_eq!(
            overridden.storage.credentials_path,
            Some(dir.path().join("cli.json"))
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [callback]
            port = 4000

            [oauth]
            scopes = ["read", "write"]
            "#,
        )
        .unwrap();
        assert_eq!(config.callback.port, Some(4000));
        assert_eq!(config.callback.host, "127.0.0.1");
        assert_eq!(config.oauth.scopes, vec!["read", "write"]);
        assert_eq!(config.oauth.auth_timeout_secs, 300);
    }
}
