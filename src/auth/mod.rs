//! OAuth2 authentication for installed applications
//!
//! [`AuthManager`] hands out a valid [`Credential`], in order of preference:
//! the in-memory credential, the persisted one, or a fresh interactive login
//! through the system browser and a one-shot loopback listener.
//!
//! The browser, the credential store and the refresh service sit behind
//! traits so embedders and tests can swap them out.

mod browser;
mod callback;
mod credential;
mod error;
mod manager;
mod refresh;
mod state;
mod store;

pub use browser::{BrowserLauncher, SystemBrowser, ENV_NO_BROWSER};
pub use callback::{CallbackListener, PendingAuthorization};
pub use credential::{Credential, RefreshResponse};
pub use error::{AuthError, ErrorKind, ProtocolError, Result};
pub use manager::{AuthManager, StatusObserver};
pub use refresh::{RefreshClient, TokenRefresher};
pub use state::{generate_csrf_token, verify_state, AuthState};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
