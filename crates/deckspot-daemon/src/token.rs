//! Token lifecycle: PKCE authorization, code exchange, and single-flight
//! refresh. Tokens are owned here and persisted opaquely through the
//! settings store; nothing else in the daemon writes them.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use deckspot_proto::settings::SettingsStore;

use crate::error::DaemonError;

pub const SPOTIFY_AUTH_URL: &str = "https://accounts.spotify.com/authorize";
pub const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
pub const SPOTIFY_SCOPES: &str = "user-read-currently-playing user-read-playback-state user-modify-playback-state playlist-read-private playlist-read-collaborative user-library-read user-follow-read";

/// Bumped whenever SPOTIFY_SCOPES grows. A token stored under an older
/// version still works but the UI should offer re-authorization.
pub const CURRENT_SCOPES_VERSION: u32 = 4;

/// Tokens are treated as expired this long before the server-side expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct AuthFlow {
    verifier: String,
    redirect_uri: String,
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    /// Absolute expiry, epoch seconds. 0 means expired.
    expires_at: u64,
    flow: Option<AuthFlow>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

pub struct TokenManager {
    http: reqwest::Client,
    authorize_url: String,
    token_url: String,
    store: Arc<dyn SettingsStore>,
    state: Mutex<TokenState>,
    /// Serializes the refresh path: at most one network refresh in flight.
    refresh_lock: tokio::sync::Mutex<()>,
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// High-entropy URL-safe verifier plus its S256 challenge.
fn generate_pkce_pair() -> (String, String) {
    let mut bytes = [0u8; 64];
    rand::thread_rng().fill(&mut bytes[..]);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let digest = Sha256::digest(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(digest);
    (verifier, challenge)
}

impl TokenManager {
    pub fn new(store: Arc<dyn SettingsStore>) -> anyhow::Result<Self> {
        let settings = store.snapshot();
        let state = TokenState {
            access_token: settings.access_token,
            refresh_token: settings.refresh_token,
            expires_at: settings.token_expires_at.unwrap_or(0),
            flow: None,
        };
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .connect_timeout(Duration::from_secs(10))
                .build()?,
            authorize_url: SPOTIFY_AUTH_URL.to_string(),
            token_url: SPOTIFY_TOKEN_URL.to_string(),
            store,
            state: Mutex::new(state),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Point the manager at a different token endpoint. Test hook.
    #[cfg(test)]
    pub fn with_token_url(mut self, url: &str) -> Self {
        self.token_url = url.to_string();
        self
    }

    /// Build the authorization URL for a fresh PKCE flow, remembering the
    /// verifier until the matching callback arrives.
    pub fn begin_authorization(&self, client_id: &str, redirect_uri: &str) -> String {
        let (verifier, challenge) = generate_pkce_pair();
        {
            let mut state = self.state.lock().expect("token state lock poisoned");
            state.flow = Some(AuthFlow {
                verifier,
                redirect_uri: redirect_uri.to_string(),
            });
        }
        format!(
            "{}?client_id={}&response_type=code&redirect_uri={}&scope={}&code_challenge_method=S256&code_challenge={}",
            self.authorize_url,
            urlencoding::encode(client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(SPOTIFY_SCOPES),
            challenge,
        )
    }

    /// Exchange the authorization code for tokens using the stored
    /// verifier, then persist them. Consumes the in-flight flow.
    pub async fn complete_authorization(&self, code: &str) -> Result<(), DaemonError> {
        let flow = {
            let state = self.state.lock().expect("token state lock poisoned");
            state.flow.clone()
        }
        .ok_or_else(|| {
            DaemonError::TokenExchangeFailed("no authorization flow in progress".to_string())
        })?;

        let client_id = self.store.snapshot().spotify_client_id.trim().to_string();
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", flow.redirect_uri.as_str()),
            ("client_id", client_id.as_str()),
            ("code_verifier", flow.verifier.as_str()),
        ];

        let token = self.token_request(&params).await?;
        self.apply_token_response(token, true)
            .map_err(|e| DaemonError::TokenExchangeFailed(e.to_string()))?;

        let mut state = self.state.lock().expect("token state lock poisoned");
        state.flow = None;
        info!("authorization complete, tokens saved");
        Ok(())
    }

    /// Current access token, refreshing it first when expired. Concurrent
    /// callers on an expired token collapse into a single refresh: the
    /// expiry is re-checked after the lock is acquired.
    pub async fn ensure_valid_token(&self) -> Option<String> {
        let refresh_token = {
            let state = self.state.lock().expect("token state lock poisoned");
            let access = state.access_token.as_ref()?;
            if now_epoch() < state.expires_at {
                return Some(access.clone());
            }
            state.refresh_token.clone()?
        };

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        {
            let state = self.state.lock().expect("token state lock poisoned");
            if let Some(access) = state.access_token.as_ref() {
                if now_epoch() < state.expires_at {
                    return Some(access.clone());
                }
            }
        }

        let client_id = self.store.snapshot().spotify_client_id.trim().to_string();
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", client_id.as_str()),
        ];

        match self.token_request(&params).await {
            Ok(token) => {
                let access = token.access_token.clone();
                if let Err(e) = self.apply_token_response(token, false) {
                    warn!("failed to persist refreshed token: {}", e);
                }
                info!("access token refreshed");
                Some(access)
            }
            Err(e) => {
                warn!("token refresh failed: {}", e);
                None
            }
        }
    }

    /// Treat the cached token as expired so the next caller refreshes.
    /// Used when the remote API answers 401.
    pub fn force_expire(&self) {
        let mut state = self.state.lock().expect("token state lock poisoned");
        state.expires_at = 0;
    }

    pub fn is_authenticated(&self) -> bool {
        let state = self.state.lock().expect("token state lock poisoned");
        state.access_token.is_some() && state.refresh_token.is_some()
    }

    /// (authenticated, needs_reauth). A stored scopes version older than
    /// the current one is advisory only.
    pub fn auth_status(&self) -> (bool, bool) {
        if !self.is_authenticated() {
            return (false, false);
        }
        let needs_reauth = self.store.snapshot().scopes_version < CURRENT_SCOPES_VERSION;
        (true, needs_reauth)
    }

    /// Drop all token state and the cached client id. Idempotent.
    pub fn logout(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().expect("token state lock poisoned");
            *state = TokenState::default();
        }
        self.store.update(&mut |s| {
            s.access_token = None;
            s.refresh_token = None;
            s.token_expires_at = None;
            s.spotify_client_id.clear();
        })?;
        info!("logged out, tokens and client id cleared");
        Ok(())
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, DaemonError> {
        let resp = self
            .http
            .post(&self.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| DaemonError::TokenExchangeFailed(e.to_string()))?;

        let status = resp.status();
        let raw = resp
            .text()
            .await
            .map_err(|e| DaemonError::TokenExchangeFailed(e.to_string()))?;
        if !status.is_success() {
            return Err(DaemonError::TokenExchangeFailed(format!(
                "token endpoint returned {status}: {raw}"
            )));
        }
        serde_json::from_str(&raw)
            .map_err(|e| DaemonError::TokenExchangeFailed(format!("invalid token response: {e}")))
    }

    /// Install a token response into memory and the store. A refresh
    /// response without a new refresh token keeps the old one.
    fn apply_token_response(
        &self,
        token: TokenResponse,
        set_scopes_version: bool,
    ) -> anyhow::Result<()> {
        let lifetime = token.expires_in.unwrap_or(3600);
        let expires_at = now_epoch() + lifetime.saturating_sub(EXPIRY_MARGIN.as_secs());
        let refresh_token = {
            let mut state = self.state.lock().expect("token state lock poisoned");
            state.access_token = Some(token.access_token.clone());
            if token.refresh_token.is_some() {
                state.refresh_token = token.refresh_token.clone();
            }
            state.expires_at = expires_at;
            state.refresh_token.clone()
        };
        self.store.update(&mut |s| {
            s.access_token = Some(token.access_token.clone());
            s.refresh_token = refresh_token.clone();
            s.token_expires_at = Some(expires_at);
            if set_scopes_version {
                s.scopes_version = CURRENT_SCOPES_VERSION;
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deckspot_proto::settings::{MemorySettingsStore, Settings};

    fn manager_with(settings: Settings) -> TokenManager {
        TokenManager::new(Arc::new(MemorySettingsStore::new(settings))).unwrap()
    }

    #[test]
    fn test_pkce_challenge_is_s256_of_verifier() {
        let (verifier, challenge) = generate_pkce_pair();
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        assert_eq!(challenge, expected);
        assert!(!challenge.contains('='));
        assert!(!challenge.contains('+'));
        assert!(!challenge.contains('/'));
        // 64 random bytes base64url-encoded
        assert!(verifier.len() >= 43);
    }

    #[test]
    fn test_pkce_pairs_are_unique() {
        let (v1, _) = generate_pkce_pair();
        let (v2, _) = generate_pkce_pair();
        assert_ne!(v1, v2);
    }

    #[test]
    fn test_authorization_url_carries_pkce_params() {
        let mgr = manager_with(Settings::default());
        let url = mgr.begin_authorization("my-client", "https://deck.local:39281/callback");
        assert!(url.starts_with(SPOTIFY_AUTH_URL));
        assert!(url.contains("client_id=my-client"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("code_challenge="));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fdeck.local%3A39281%2Fcallback"));
        assert!(url.contains("response_type=code"));
    }

    #[tokio::test]
    async fn test_unexpired_token_returned_without_refresh() {
        let mgr = manager_with(Settings {
            access_token: Some("live".to_string()),
            refresh_token: Some("r".to_string()),
            token_expires_at: Some(now_epoch() + 300),
            ..Settings::default()
        });
        assert_eq!(mgr.ensure_valid_token().await.as_deref(), Some("live"));
    }

    #[tokio::test]
    async fn test_no_tokens_yields_none() {
        let mgr = manager_with(Settings::default());
        assert!(mgr.ensure_valid_token().await.is_none());
        assert_eq!(mgr.auth_status(), (false, false));
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_yields_none() {
        let mgr = manager_with(Settings {
            access_token: Some("stale".to_string()),
            refresh_token: None,
            token_expires_at: Some(0),
            ..Settings::default()
        });
        assert!(mgr.ensure_valid_token().await.is_none());
    }

    #[test]
    fn test_force_expire_marks_token_stale() {
        let mgr = manager_with(Settings {
            access_token: Some("live".to_string()),
            refresh_token: Some("r".to_string()),
            token_expires_at: Some(now_epoch() + 300),
            ..Settings::default()
        });
        mgr.force_expire();
        let state = mgr.state.lock().unwrap();
        assert_eq!(state.expires_at, 0);
    }

    #[test]
    fn test_logout_is_idempotent() {
        let store = Arc::new(MemorySettingsStore::new(Settings {
            access_token: Some("t".to_string()),
            refresh_token: Some("r".to_string()),
            spotify_client_id: "cid".to_string(),
            ..Settings::default()
        }));
        let mgr = TokenManager::new(store.clone()).unwrap();
        mgr.logout().unwrap();
        mgr.logout().unwrap();
        let settings = store.snapshot();
        assert!(settings.access_token.is_none());
        assert!(settings.refresh_token.is_none());
        assert!(settings.spotify_client_id.is_empty());
        assert!(!mgr.is_authenticated());
    }

    /// Canned token endpoint on an ephemeral port, counting how many
    /// requests actually arrive.
    async fn mock_token_endpoint(
        status_line: &'static str,
        body: &'static str,
        hits: Arc<std::sync::atomic::AtomicUsize>,
    ) -> String {
        use std::sync::atomic::Ordering;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let hits = hits.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    hits.fetch_add(1, Ordering::SeqCst);
                    let resp = format!(
                        "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len(),
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}/api/token")
    }

    fn expired_settings() -> Settings {
        Settings {
            spotify_client_id: "cid".to_string(),
            access_token: Some("stale".to_string()),
            refresh_token: Some("r1".to_string()),
            token_expires_at: Some(0),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_concurrent_refresh_collapses_to_one_request() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let url = mock_token_endpoint(
            "200 OK",
            r#"{"access_token":"fresh","refresh_token":"r2","expires_in":3600}"#,
            hits.clone(),
        )
        .await;

        let store = Arc::new(MemorySettingsStore::new(expired_settings()));
        let mgr = Arc::new(
            TokenManager::new(store.clone())
                .unwrap()
                .with_token_url(&url),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move { mgr.ensure_valid_token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().as_deref(), Some("fresh"));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let saved = store.snapshot();
        assert_eq!(saved.access_token.as_deref(), Some("fresh"));
        assert_eq!(saved.refresh_token.as_deref(), Some("r2"));
        // Expiry lands one hour out, minus the safety margin.
        let expected = now_epoch() + 3600 - EXPIRY_MARGIN.as_secs();
        let expires_at = saved.token_expires_at.unwrap();
        assert!(expires_at.abs_diff(expected) <= 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_yields_none_and_keeps_refresh_token() {
        use std::sync::atomic::AtomicUsize;

        let hits = Arc::new(AtomicUsize::new(0));
        let url = mock_token_endpoint(
            "400 Bad Request",
            r#"{"error":"invalid_grant"}"#,
            hits.clone(),
        )
        .await;

        let store = Arc::new(MemorySettingsStore::new(expired_settings()));
        let mgr = TokenManager::new(store.clone())
            .unwrap()
            .with_token_url(&url);
        assert!(mgr.ensure_valid_token().await.is_none());
        // A failed refresh does not destroy state; the next tick retries.
        assert_eq!(store.snapshot().refresh_token.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_refresh_without_rotated_refresh_token_keeps_old_one() {
        use std::sync::atomic::AtomicUsize;

        let hits = Arc::new(AtomicUsize::new(0));
        let url = mock_token_endpoint(
            "200 OK",
            r#"{"access_token":"fresh","expires_in":120}"#,
            hits.clone(),
        )
        .await;

        let store = Arc::new(MemorySettingsStore::new(expired_settings()));
        let mgr = TokenManager::new(store.clone())
            .unwrap()
            .with_token_url(&url);
        assert_eq!(mgr.ensure_valid_token().await.as_deref(), Some("fresh"));
        assert_eq!(store.snapshot().refresh_token.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_code_exchange_persists_tokens_and_scopes_version() {
        use std::sync::atomic::AtomicUsize;

        let hits = Arc::new(AtomicUsize::new(0));
        let url = mock_token_endpoint(
            "200 OK",
            r#"{"access_token":"a1","refresh_token":"r1","expires_in":3600}"#,
            hits.clone(),
        )
        .await;

        let store = Arc::new(MemorySettingsStore::new(Settings {
            spotify_client_id: "cid".to_string(),
            ..Settings::default()
        }));
        let mgr = TokenManager::new(store.clone())
            .unwrap()
            .with_token_url(&url);
        mgr.begin_authorization("cid", "https://deck.local:39281/callback");
        mgr.complete_authorization("the-code").await.unwrap();

        let saved = store.snapshot();
        assert_eq!(saved.access_token.as_deref(), Some("a1"));
        assert_eq!(saved.scopes_version, CURRENT_SCOPES_VERSION);
        assert!(mgr.is_authenticated());

        // The flow is consumed; a second callback has no verifier to use.
        assert!(mgr.complete_authorization("another").await.is_err());
    }

    #[test]
    fn test_stale_scopes_version_flags_reauth() {
        let mgr = manager_with(Settings {
            access_token: Some("t".to_string()),
            refresh_token: Some("r".to_string()),
            token_expires_at: Some(now_epoch() + 300),
            scopes_version: CURRENT_SCOPES_VERSION - 1,
            ..Settings::default()
        });
        assert_eq!(mgr.auth_status(), (true, true));
    }
}
