//! Loopback listener that receives the OAuth redirect
//!
//! One listener serves one interactive login. It binds a loopback port,
//! builds the authorization URL pointing the relay back at itself, and
//! settles a single completion with the first request it sees. Whatever
//! happens it shuts itself down afterwards; dropping the
//! [`PendingAuthorization`] also shuts it down, so a timed-out flow never
//! leaves the port open.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use super::credential::Credential;
use super::error::{AuthError, ProtocolError};
use super::state::{verify_state, AuthState};
use crate::config::{CallbackConfig, OAuthConfig};

/// How long in-flight responses may take once shutdown was requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const SUCCESS_PAGE: &str = "<!DOCTYPE html>
<html>
<head><title>authgate</title></head>
<body style=\"font-family: system-ui; text-align: center; padding-top: 80px;\">
<h2>Authentication successful!</h2>
<p>You can close this window and return to the terminal.</p>
</body>
</html>";

const FAILURE_PAGE: &str = "<!DOCTYPE html>
<html>
<head><title>authgate</title></head>
<body style=\"font-family: system-ui; text-align: center; padding-top: 80px;\">
<h2>Authentication failed</h2>
<p>Please close this window and check the terminal.</p>
</body>
</html>";

type Completion = Result<Credential, ProtocolError>;

/// Builds authorization URLs and starts one-shot loopback listeners
#[derive(Debug, Clone)]
pub struct CallbackListener {
    host: String,
    port: Option<u16>,
    path: String,
    authorization_endpoint: String,
    client_id: String,
    relay_redirect_uri: String,
    scopes: Vec<String>,
}

impl CallbackListener {
    pub fn new(callback: &CallbackConfig, oauth: &OAuthConfig, scopes: Vec<String>) -> Self {
        let path = if callback.path.starts_with('/') {
            callback.path.clone()
        } else {
            format!("/{}", callback.path)
        };

        Self {
            host: callback.host.clone(),
            port: callback.port,
            path,
            authorization_endpoint: oauth.authorization_endpoint.clone(),
            client_id: oauth.client_id.clone(),
            relay_redirect_uri: oauth.relay_redirect_uri.clone(),
            scopes,
        }
    }

    /// Bind the listener and return the pending login
    ///
    /// `manual` is forwarded in the state so the relay can show a copyable
    /// page instead of redirecting when no browser was launched.
    pub async fn start(&self, manual: bool) -> Result<PendingAuthorization, AuthError> {
        let port = match self.port {
            Some(port) => port,
            None => self.pick_free_port().await?,
        };

        let listener = TcpListener::bind((self.host.as_str(), port))
            .await
            .map_err(|e| {
                AuthError::Configuration(format!(
                    "Failed to bind callback listener on {}:{}: {}",
                    self.host, port, e
                ))
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AuthError::Configuration(format!("Callback listener address: {}", e)))?;

        let callback_url = format!("http://{}:{}{}", self.host, local_addr.port(), self.path);
        let state = AuthState::new(callback_url.clone(), manual);
        let auth_url = self.authorization_url(&state)?;

        let (completion_tx, completion_rx) = oneshot::channel();
        let shutdown = Arc::new(Notify::new());
        let shared = Arc::new(CallbackState {
            csrf: state.csrf.clone(),
            requested_scopes: self.scopes.clone(),
            completion: Mutex::new(Some(completion_tx)),
            shutdown: shutdown.clone(),
        });

        let app = Router::new()
            .route(&self.path, any(handle_callback))
            .fallback(handle_unexpected)
            .with_state(shared);

        let server = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let server = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.notified().await });
                if let Err(e) = server.await {
                    tracing::error!("OAuth callback listener error: {}", e);
                }
                tracing::debug!("OAuth callback listener on {} closed", local_addr);
            }
        });

        tracing::debug!("OAuth callback listener started on {}", local_addr);

        Ok(PendingAuthorization {
            auth_url,
            callback_url,
            csrf: state.csrf,
            local_addr,
            completion: completion_rx,
            guard: ListenerGuard {
                shutdown,
                server: Some(server),
            },
        })
    }

    /// Find a free loopback port by binding port 0 and releasing it
    async fn pick_free_port(&self) -> Result<u16, AuthError> {
        let reserved = TcpListener::bind((self.host.as_str(), 0))
            .await
            .map_err(|e| {
                AuthError::Configuration(format!(
                    "No free port available on {}: {}",
                    self.host, e
                ))
            })?;
        let port = reserved
            .local_addr()
            .map_err(|e| AuthError::Configuration(format!("Free port lookup failed: {}", e)))?
            .port();
        drop(reserved);
        Ok(port)
    }

    fn authorization_url(&self, state: &AuthState) -> Result<String, AuthError> {
        let scope = self.scopes.join(" ");
        let encoded_state = state.encode();
        let url = url::Url::parse_with_params(
            &self.authorization_endpoint,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.relay_redirect_uri.as_str()),
                ("response_type", "code"),
                ("access_type", "offline"),
                ("scope", scope.as_str()),
                ("state", encoded_state.as_str()),
                ("prompt", "consent"),
            ],
        )
        .map_err(|e| {
            AuthError::Configuration(format!(
                "Invalid authorization endpoint {}: {}",
                self.authorization_endpoint, e
            ))
        })?;
        Ok(url.into())
    }
}

/// State of one interactive login attempt
pub struct PendingAuthorization {
    auth_url: String,
    callback_url: String,
    csrf: String,
    local_addr: SocketAddr,
    completion: oneshot::Receiver<Completion>,
    guard: ListenerGuard,
}

impl PendingAuthorization {
    /// URL the user has to open to log in
    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    /// Loopback URL the relay redirects back to
    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    pub fn csrf(&self) -> &str {
        &self.csrf
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the callback to settle the flow
    ///
    /// Cancel-safe: dropping this future (e.g. when a timeout wins the race)
    /// leaves the listener to be closed by the guard.
    pub async fn wait(&mut self) -> Result<Credential, AuthError> {
        match (&mut self.completion).await {
            Ok(outcome) => outcome.map_err(AuthError::from),
            Err(_) => Err(ProtocolError::Malformed(
                "callback listener stopped before completing".to_string(),
            )
            .into()),
        }
    }

    /// Stop the listener now
    pub fn close(mut self) {
        self.guard.shutdown();
    }
}

impl std::fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("callback_url", &self.callback_url)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Shuts the listener down when the pending login goes away
struct ListenerGuard {
    shutdown: Arc<Notify>,
    server: Option<JoinHandle<()>>,
}

impl ListenerGuard {
    fn shutdown(&mut self) {
        self.shutdown.notify_one();

        let Some(mut server) = self.server.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if tokio::time::timeout(SHUTDOWN_GRACE, &mut server)
                        .await
                        .is_err()
                    {
                        tracing::debug!("Callback listener did not drain in time, aborting");
                        server.abort();
                    }
                });
            }
            Err(_) => server.abort(),
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct CallbackState {
    csrf: String,
    requested_scopes: Vec<String>,
    completion: Mutex<Option<oneshot::Sender<Completion>>>,
    shutdown: Arc<Notify>,
}

impl CallbackState {
    /// Claim the right to settle the flow; only the first caller gets it
    fn claim(&self) -> Option<oneshot::Sender<Completion>> {
        self.completion.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Deliver the outcome, then ask the server to stop
    fn settle(&self, sender: oneshot::Sender<Completion>, outcome: Completion) {
        if sender.send(outcome).is_err() {
            tracing::debug!("Login flow was abandoned before the callback arrived");
        }
        self.shutdown.notify_one();
    }

    fn reject_unexpected(&self, request: String) -> Response {
        tracing::warn!("Unexpected request to callback listener: {}", request);
        if let Some(sender) = self.claim() {
            self.settle(sender, Err(ProtocolError::UnexpectedRequest(request)));
        }
        (StatusCode::NOT_FOUND, "Not found").into_response()
    }
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    method: Method,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if method != Method::GET {
        return state.reject_unexpected(format!("{} {}", method, uri.path()));
    }

    let Some(sender) = state.claim() else {
        tracing::debug!("Ignoring callback for an already settled login");
        return (StatusCode::GONE, Html(FAILURE_PAGE)).into_response();
    };

    let outcome = decode_callback(&state.csrf, &state.requested_scopes, &params);
    let response = match &outcome {
        Ok(_) => {
            tracing::info!("Received OAuth callback");
            (StatusCode::OK, Html(SUCCESS_PAGE)).into_response()
        }
        Err(e) => {
            tracing::warn!("Rejected OAuth callback: {}", e);
            (StatusCode::BAD_REQUEST, Html(FAILURE_PAGE)).into_response()
        }
    };
    state.settle(sender, outcome);
    response
}

async fn handle_unexpected(State(state): State<Arc<CallbackState>>, uri: Uri) -> Response {
    state.reject_unexpected(uri.path().to_string())
}

/// Turn the redirect query into a credential
fn decode_callback(
    csrf: &str,
    requested_scopes: &[String],
    params: &HashMap<String, String>,
) -> Completion {
    let received_state = params
        .get("state")
        .ok_or(ProtocolError::CsrfMismatch)?;
    verify_state(csrf, received_state)?;

    if let Some(code) = params.get("error") {
        return Err(ProtocolError::ProviderError {
            code: code.clone(),
            description: non_empty(params.get("error_description")),
        });
    }

    let access_token =
        non_empty(params.get("access_token")).ok_or(ProtocolError::MissingField("access_token"))?;
    let expiry_raw = params
        .get("expiry_date")
        .ok_or(ProtocolError::MissingField("expiry_date"))?;
    let expiry_date = parse_epoch_millis(expiry_raw)
        .ok_or_else(|| ProtocolError::Malformed(format!("expiry_date={}", expiry_raw)))?;

    let scope = non_empty(params.get("scope")).or_else(|| {
        (!requested_scopes.is_empty()).then(|| requested_scopes.join(" "))
    });

    Ok(Credential {
        access_token,
        refresh_token: non_empty(params.get("refresh_token")),
        token_type: non_empty(params.get("token_type")),
        scope,
        expiry_date,
    })
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_epoch_millis(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    raw.parse::<i64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| v as i64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credential::now_millis;

    fn listener(port: Option<u16>) -> CallbackListener {
        let callback = CallbackConfig {
            host: "127.0.0.1".to_string(),
            port,
            path: "/oauth2callback".to_string(),
        };
        let oauth = OAuthConfig {
            authorization_endpoint: "https://accounts.example.com/o/oauth2/auth".to_string(),
            client_id: "client-123".to_string(),
            relay_redirect_uri: "https://relay.example.com/oauth2callback".to_string(),
            ..OAuthConfig::default()
        };
        CallbackListener::new(&callback, &oauth, vec!["read".to_string()])
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_decode_success_with_optional_fields_missing() {
        let csrf = "token";
        let expiry = (now_millis() + 3_600_000).to_string();
        let cred = decode_callback(
            csrf,
            &["read".to_string()],
            &params(&[
                ("state", csrf),
                ("access_token", "AT1"),
                ("expiry_date", &expiry),
            ]),
        )
        .unwrap();

        assert_eq!(cred.access_token, "AT1");
        assert!(cred.refresh_token.is_none());
        assert!(cred.token_type.is_none());
        assert_eq!(cred.scope.as_deref(), Some("read"));
    }

    #[test]
    fn test_decode_requires_access_token_and_expiry() {
        let err = decode_callback(
            "t",
            &[],
            &params(&[("state", "t"), ("expiry_date", "1")]),
        )
        .unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("access_token"));

        let err = decode_callback(
            "t",
            &[],
            &params(&[("state", "t"), ("access_token", "AT")]),
        )
        .unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("expiry_date"));

        let err = decode_callback(
            "t",
            &[],
            &params(&[("state", "t"), ("access_token", "AT"), ("expiry_date", "soon")]),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_decode_checks_csrf_before_anything_else() {
        let err = decode_callback(
            "expected",
            &[],
            &params(&[("state", "forged"), ("access_token", "AT"), ("expiry_date", "1")]),
        )
        .unwrap_err();
        assert_eq!(err, ProtocolError::CsrfMismatch);

        let err = decode_callback("expected", &[], &params(&[("error", "access_denied")]))
            .unwrap_err();
        assert_eq!(err, ProtocolError::CsrfMismatch);
    }

    #[test]
    fn test_decode_provider_error() {
        let err = decode_callback(
            "t",
            &[],
            &params(&[
                ("state", "t"),
                ("error", "access_denied"),
                ("error_description", "User denied access"),
            ]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ProviderError {
                code: "access_denied".to_string(),
                description: Some("User denied access".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_epoch_millis() {
        assert_eq!(parse_epoch_millis("1700000000000"), Some(1_700_000_000_000));
        assert_eq!(parse_epoch_millis(" 1700000000000.0 "), Some(1_700_000_000_000));
        assert_eq!(parse_epoch_millis("NaN"), None);
        assert_eq!(parse_epoch_millis("tomorrow"), None);
    }

    #[tokio::test]
    async fn test_authorization_url_parameters() {
        let pending = listener(None).start(false).await.unwrap();
        let url = url::Url::parse(pending.auth_url()).unwrap();
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();

        assert_eq!(url.host_str(), Some("accounts.example.com"));
        assert_eq!(query["client_id"], "client-123");
        assert_eq!(query["redirect_uri"], "https://relay.example.com/oauth2callback");
        assert_eq!(query["access_type"], "offline");
        assert_eq!(query["prompt"], "consent");
        assert_eq!(query["scope"], "read");

        let state = AuthState::decode(&query["state"]).unwrap();
        assert_eq!(state.csrf, pending.csrf());
        assert_eq!(state.uri, pending.callback_url());
        assert!(!state.manual);
        assert!(pending
            .callback_url()
            .ends_with(&format!(":{}/oauth2callback", pending.local_addr().port())));
    }

    #[tokio::test]
    async fn test_callback_settles_once_and_closes() {
        let mut pending = listener(None).start(true).await.unwrap();
        let expiry = (now_millis() + 3_600_000).to_string();
        let url = format!(
            "{}?state={}&access_token=AT1&refresh_token=RT1&expiry_date={}",
            pending.callback_url(),
            pending.csrf(),
            expiry
        );

        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(response.text().await.unwrap().contains("successful"));

        let cred = pending.wait().await.unwrap();
        assert_eq!(cred.access_token, "AT1");
        assert_eq!(cred.refresh_token.as_deref(), Some("RT1"));

        // The listener shuts itself down after the first request
        let addr = pending.local_addr();
        let mut closed = false;
        for _ in 0..50 {
            if tokio::net::TcpStream::connect(addr).await.is_err() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(closed, "listener still accepting connections");
    }

    #[tokio::test]
    async fn test_forged_state_is_rejected() {
        let mut pending = listener(None).start(false).await.unwrap();
        let url = format!(
            "{}?state=forged&access_token=EVIL&expiry_date=1",
            pending.callback_url()
        );

        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body = response.text().await.unwrap();
        assert!(!body.contains("EVIL"));

        let err = pending.wait().await.unwrap_err();
        assert!(err.is_csrf_mismatch());
    }

    #[tokio::test]
    async fn test_unexpected_path_rejects_flow() {
        let mut pending = listener(None).start(false).await.unwrap();
        let addr = pending.local_addr();

        let response = reqwest::get(format!("http://{}/favicon.ico", addr))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Protocol(ProtocolError::UnexpectedRequest(ref path)) if path == "/favicon.ico"
        ));
    }

    #[tokio::test]
    async fn test_non_get_callback_rejects_flow() {
        for method in [reqwest::Method::HEAD, reqwest::Method::POST] {
            let mut pending = listener(None).start(false).await.unwrap();
            let url = format!("{}?state={}", pending.callback_url(), pending.csrf());

            let response = reqwest::Client::new()
                .request(method.clone(), &url)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

            let expected = format!("{} /oauth2callback", method);
            let err = pending.wait().await.unwrap_err();
            assert!(
                matches!(
                    err,
                    AuthError::Protocol(ProtocolError::UnexpectedRequest(ref request)) if *request == expected
                ),
                "{method}: {err}"
            );
        }
    }

    #[test]
    fn test_completion_can_be_claimed_once() {
        let (tx, _rx) = oneshot::channel();
        let state = CallbackState {
            csrf: "csrf".to_string(),
            requested_scopes: Vec::new(),
            completion: Mutex::new(Some(tx)),
            shutdown: Arc::new(Notify::new()),
        };

        assert!(state.claim().is_some());
        assert!(state.claim().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_callbacks_get_one_success_page() {
        let mut pending = listener(None).start(false).await.unwrap();
        let expiry = (now_millis() + 3_600_000).to_string();
        let url = format!(
            "{}?state={}&access_token=AT1&expiry_date={}",
            pending.callback_url(),
            pending.csrf(),
            expiry
        );

        let client = reqwest::Client::new();
        let (first, second) = tokio::join!(client.get(&url).send(), client.get(&url).send());
        let successes = [first, second]
            .into_iter()
            .filter(|r| matches!(r, Ok(resp) if resp.status() == reqwest::StatusCode::OK))
            .count();

        assert_eq!(successes, 1);
        assert_eq!(pending.wait().await.unwrap().access_token, "AT1");
    }

    #[tokio::test]
    async fn test_explicit_port_is_used() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let pending = listener(Some(port)).start(false).await.unwrap();
        assert_eq!(pending.local_addr().port(), port);
        pending.close();
    }

    #[tokio::test]
    async fn test_dropping_pending_closes_listener() {
        let pending = listener(None).start(false).await.unwrap();
        let addr = pending.local_addr();
        drop(pending);

        let mut closed = false;
        for _ in 0..50 {
            if tokio::net::TcpStream::connect(addr).await.is_err() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(closed, "listener leaked after drop");
    }
}
