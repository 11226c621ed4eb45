//! OAuth token management for HTTP downstreams.
//!
//! OAuth is latent: nothing here runs until a downstream answers `401`
//! with a `WWW-Authenticate: Bearer` challenge. On activation the
//! manager serves a cached access token, refreshes an expired one via
//! the `refresh_token` grant, or — when no usable token exists —
//! surfaces the authorization URL (with a fresh PKCE pair) for the
//! operator to complete out-of-band. The interactive browser flow
//! itself is not the gateway's business.
//!
//! Tokens are cached on disk per downstream URL, keyed by a hash of the
//! URL, with owner-only permissions. Concurrent refreshes for the same
//! URL coalesce behind a per-URL lock so a refresh token is never
//! consumed twice.

use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);
/// Tokens this close to expiry are refreshed eagerly.
const EXPIRY_SKEW_SECS: i64 = 30;

/// Cached token material for one downstream URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl TokenSet {
    /// Whether the access token is still usable (with expiry skew).
    pub fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(at) => at - ChronoDuration::seconds(EXPIRY_SKEW_SECS) > Utc::now(),
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProtectedResourceMeta {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

/// Authorization server metadata relevant to the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMeta {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Compute the PKCE S256 challenge for a verifier.
pub fn pkce_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Generate a fresh PKCE `(verifier, challenge)` pair.
pub fn pkce_pair() -> (String, String) {
    let verifier = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    let challenge = pkce_challenge(&verifier);
    (verifier, challenge)
}

/// Per-URL token cache with coalesced refresh.
pub struct OAuthManager {
    http: reqwest::Client,
    cache_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OAuthManager {
    /// Create a manager caching tokens under `cache_dir`.
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            http: reqwest::Client::new(),
            cache_dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The on-disk cache directory for one downstream URL.
    pub fn cache_slot(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        self.cache_dir.join(&hex::encode(digest)[..16])
    }

    fn tokens_path(&self, url: &str) -> PathBuf {
        self.cache_slot(url).join("tokens.json")
    }

    async fn lock_for(&self, url: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(url.to_string()).or_default().clone()
    }

    /// Load cached tokens for a URL, if any.
    pub async fn load(&self, url: &str) -> Option<TokenSet> {
        let content = tokio::fs::read_to_string(self.tokens_path(url)).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(tokens) => Some(tokens),
            Err(e) => {
                warn!(url, error = %e, "discarding unreadable token cache");
                None
            }
        }
    }

    /// Persist tokens for a URL with owner-only permissions.
    pub async fn save(&self, url: &str, tokens: &TokenSet) -> std::io::Result<()> {
        let slot = self.cache_slot(url);
        tokio::fs::create_dir_all(&slot).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&slot, std::fs::Permissions::from_mode(0o700)).await?;
        }
        let path = self.tokens_path(url);
        tokio::fs::write(&path, serde_json::to_vec_pretty(tokens)?).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }

    /// Drop cached tokens for a URL.
    pub async fn clear(&self, url: &str) {
        let _ = tokio::fs::remove_file(self.tokens_path(url)).await;
    }

    /// Produce a usable bearer token for `url`, refreshing if needed.
    ///
    /// At most one refresh is in flight per URL; concurrent callers
    /// wait on the per-URL lock and then reuse the freshly cached
    /// token. The error is a human-readable message; callers wrap it
    /// with the server name.
    pub async fn bearer_token(&self, url: &str) -> Result<String, String> {
        let lock = self.lock_for(url).await;
        let _guard = lock.lock().await;

        if let Some(tokens) = self.load(url).await {
            if tokens.is_fresh() {
                debug!(url, "using cached access token");
                return Ok(tokens.access_token);
            }
            if tokens.refresh_token.is_some() {
                let refreshed = self.refresh(url, tokens).await?;
                return Ok(refreshed.access_token);
            }
        }

        Err(self.authorization_required(url).await)
    }

    async fn refresh(&self, url: &str, tokens: TokenSet) -> Result<TokenSet, String> {
        let meta = self.discover(url).await?;
        let refresh_token = tokens
            .refresh_token
            .clone()
            .ok_or_else(|| "no refresh token cached".to_string())?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
        ];
        if let Some(client_id) = &tokens.client_id {
            form.push(("client_id", client_id.clone()));
        }

        let send = self
            .http
            .post(meta.token_endpoint.as_str())
            .form(&form)
            .send();
        let resp = tokio::time::timeout(REFRESH_TIMEOUT, send)
            .await
            .map_err(|_| "token refresh timed out".to_string())?
            .map_err(|e| format!("token refresh failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if body.contains("invalid_grant") {
                // Refresh token revoked; a stale cache would loop forever.
                self.clear(url).await;
                return Err("refresh token rejected; re-authorization required".to_string());
            }
            return Err(format!("token endpoint returned {status}"));
        }

        let token_resp: TokenResponse = resp
            .json()
            .await
            .map_err(|e| format!("bad token response: {e}"))?;

        let refreshed = TokenSet {
            access_token: token_resp.access_token,
            refresh_token: token_resp.refresh_token.or(tokens.refresh_token),
            expires_at: token_resp
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
            token_type: token_resp.token_type.unwrap_or_else(|| "Bearer".to_string()),
            client_id: tokens.client_id,
        };
        if let Err(e) = self.save(url, &refreshed).await {
            warn!(url, error = %e, "failed to persist refreshed tokens");
        }
        info!(url, "access token refreshed");
        Ok(refreshed)
    }

    /// Discover the authorization server for a protected resource.
    pub async fn discover(&self, url: &str) -> Result<AuthServerMeta, String> {
        let origin = origin_of(url)?;

        let mut auth_base = origin.clone();
        let prm_url = format!("{origin}/.well-known/oauth-protected-resource");
        if let Ok(resp) = self.http.get(prm_url.as_str()).send().await {
            if resp.status().is_success() {
                if let Ok(meta) = resp.json::<ProtectedResourceMeta>().await {
                    if let Some(first) = meta.authorization_servers.first() {
                        auth_base = first.trim_end_matches('/').to_string();
                    }
                }
            }
        }

        let meta_url = format!("{auth_base}/.well-known/oauth-authorization-server");
        let resp = self
            .http
            .get(meta_url.as_str())
            .send()
            .await
            .map_err(|e| format!("metadata fetch failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("no authorization server metadata at {meta_url}"));
        }
        resp.json::<AuthServerMeta>()
            .await
            .map_err(|e| format!("bad authorization server metadata: {e}"))
    }

    async fn authorization_required(&self, url: &str) -> String {
        match self.discover(url).await {
            Ok(meta) => {
                let (verifier, challenge) = pkce_pair();
                let state = Uuid::new_v4().simple().to_string();
                format!(
                    "authorization required; no cached token for {url}. Start the flow at \
                     {}?response_type=code&code_challenge={challenge}&code_challenge_method=S256\
                     &state={state}&resource={url} (code_verifier: {verifier})",
                    meta.authorization_endpoint
                )
            }
            Err(e) => format!("authorization required for {url}, and discovery failed: {e}"),
        }
    }
}

fn origin_of(url: &str) -> Result<String, String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("bad url {url}: {e}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| format!("url {url} has no host"))?;
    match parsed.port() {
        Some(port) => Ok(format!("{}://{host}:{port}", parsed.scheme())),
        None => Ok(format!("{}://{host}", parsed.scheme())),
    }
}
