//! Credential persistence
//!
//! The file store keeps a single record in
//! ~/.local/share/authgate/credentials.json with 0600 permissions
//! (owner read/write only).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::credential::{now_millis, Credential};
use super::error::AuthError;

/// Persistence for the single credential record of an installation
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the stored credential, `None` when nothing is stored
    async fn load(&self) -> Result<Option<Credential>, AuthError>;

    async fn save(&self, credential: &Credential) -> Result<(), AuthError>;

    /// Remove the record; succeeds when there is nothing to remove
    async fn clear(&self) -> Result<(), AuthError>;
}

/// Storage format with version for future migrations
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCredential {
    version: u32,
    #[serde(flatten)]
    credential: Credential,
    /// When the record was written (epoch milliseconds)
    stored_at: i64,
}

/// JSON file store with atomic writes
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Current storage schema version
    const VERSION: u32 = 1;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the configured path, or the default data directory location
    pub fn from_path_or_default(path: Option<&Path>) -> Result<Self, AuthError> {
        match path {
            Some(path) => Ok(Self::new(path)),
            None => Ok(Self::new(Self::default_path()?)),
        }
    }

    pub fn default_path() -> Result<PathBuf, AuthError> {
        let data_dir = dirs::data_local_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .ok_or_else(|| AuthError::Storage("Failed to determine data directory".into()))?;

        Ok(data_dir.join("authgate").join("credentials.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_record(&self) -> Result<Option<Credential>, AuthError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AuthError::Storage(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let stored: StoredCredential = serde_json::from_str(&content).map_err(|e| {
            AuthError::Storage(format!("Failed to parse {}: {}", self.path.display(), e))
        })?;

        if stored.version > Self::VERSION {
            return Err(AuthError::Storage(format!(
                "Credential file version {} is newer than supported version {}",
                stored.version,
                Self::VERSION
            )));
        }

        Ok(Some(stored.credential))
    }

    fn write_record(&self, credential: &Credential) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AuthError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let stored = StoredCredential {
            version: Self::VERSION,
            credential: credential.clone(),
            stored_at: now_millis(),
        };
        let content = serde_json::to_string_pretty(&stored).map_err(AuthError::storage)?;

        // Write to temp file first, then rename (atomic)
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content).map_err(|e| {
            AuthError::Storage(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&temp_path, perms).map_err(|e| {
                AuthError::Storage(format!("Failed to set credential file permissions: {}", e))
            })?;
        }

        std::fs::rename(&temp_path, &self.path).map_err(|e| {
            AuthError::Storage(format!("Failed to save {}: {}", self.path.display(), e))
        })?;

        tracing::debug!("Saved credential to {:?}", self.path);
        Ok(())
    }

    fn remove_record(&self) -> Result<(), AuthError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!("Deleted credential from {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Storage(format!(
                "Failed to delete {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credential>, AuthError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.read_record())
            .await
            .map_err(AuthError::storage)?
    }

    async fn save(&self, credential: &Credential) -> Result<(), AuthError> {
        let store = self.clone();
        let credential = credential.clone();
        tokio::task::spawn_blocking(move || store.write_record(&credential))
            .await
            .map_err(AuthError::storage)?
    }

    async fn clear(&self) -> Result<(), AuthError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.remove_record())
            .await
            .map_err(AuthError::storage)?
    }
}

/// Process-local store, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    record: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            record: Mutex::new(Some(credential)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credential>, AuthError> {
        Ok(self.record.lock().await.clone())
    }

    async fn save(&self, credential: &Credential) -> Result<(), AuthError> {
        *self.record.lock().await = Some(credential.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), AuthError> {
        self.record.lock().await.take();
        Ok(())
    }
}
