//! OAuth 2.0 subsystem: interactive authorization-code flow with PKCE and
//! refresh-token handling.
//!
//! The interactive flow binds a loopback callback server, opens the user's
//! browser at the authorization URL, validates the returned `state`, and
//! exchanges the code at the token endpoint. Refreshes are serialized per
//! credential: a caller that wins the mutex re-checks expiry before issuing
//! the request, so concurrent callers never double-refresh.

pub mod callback;
pub mod pkce;
pub mod storage;

pub use callback::{CallbackServer, CALLBACK_TIMEOUT};
pub use pkce::PkceParams;
pub use storage::{EncryptedFileTokenStorage, MemoryTokenStorage, StoredTokens, TokenStorage};

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Tokens are refreshed when within this window of their expiry.
pub const EXPIRY_SKEW_SECS: i64 = 300;

/// Outbound timeout for token-endpoint requests.
const OAUTH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("callback state mismatch: possible CSRF")]
    StateMismatch,

    #[error("timed out waiting for the OAuth callback")]
    CallbackTimeout,

    #[error("authorization server returned an error: {0}")]
    Authorization(String),

    #[error("no authorization code in the callback")]
    MissingCode,

    #[error("could not bind the callback server: {0}")]
    BindFailed(String),

    #[error("token exchange failed: {0}")]
    Exchange(String),

    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token storage failed: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("no refresh token available")]
    NoRefreshToken,
}

/// Static description of one provider's OAuth endpoints.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    /// Empty for public clients.
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
}

/// In-memory token state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds.
    pub expires_at: i64,
    pub token_type: String,
}

impl OAuthTokens {
    /// Expired means within [`EXPIRY_SKEW_SECS`] of the stored expiry.
    pub fn is_expired(&self) -> bool {
        chrono::Utc::now().timestamp() >= self.expires_at - EXPIRY_SKEW_SECS
    }

    pub fn from_stored(stored: &StoredTokens) -> Self {
        Self {
            access_token: stored.access_token.clone(),
            refresh_token: stored.refresh_token.clone(),
            expires_at: stored.expires_at,
            token_type: stored.token_type.clone(),
        }
    }

    pub fn to_stored(&self) -> StoredTokens {
        StoredTokens {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at,
            token_type: self.token_type.clone(),
        }
    }
}

/// Wire shape of a token-endpoint response.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Merge with the previous refresh token (refresh responses often omit
    /// it) and stamp an absolute expiry.
    pub fn into_tokens(self, previous_refresh: Option<&str>) -> OAuthTokens {
        OAuthTokens {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous_refresh.map(|r| r.to_string()))
                .unwrap_or_default(),
            expires_at: chrono::Utc::now().timestamp() + self.expires_in.unwrap_or(3600),
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
        }
    }
}

/// HTTP client configured for token-endpoint traffic.
pub fn oauth_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(OAUTH_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Exchange a refresh token for a new access token.
pub async fn refresh_access_token(
    http: &reqwest::Client,
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<TokenResponse, OAuthError> {
    if refresh_token.is_empty() {
        return Err(OAuthError::NoRefreshToken);
    }
    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
    ];
    if !client_secret.is_empty() {
        form.push(("client_secret", client_secret));
    }
    let response = http.post(token_url).form(&form).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::Exchange(format!("HTTP {status}: {body}")));
    }
    Ok(response.json::<TokenResponse>().await?)
}

/// Interactive + refresh OAuth client for one provider credential.
pub struct OAuthClient {
    provider: String,
    config: OAuthConfig,
    http: reqwest::Client,
    tokens: Mutex<Option<OAuthTokens>>,
    storage: Arc<dyn TokenStorage>,
}

impl OAuthClient {
    pub fn new(provider: impl Into<String>, config: OAuthConfig, storage: Arc<dyn TokenStorage>) -> Self {
        Self {
            provider: provider.into(),
            config,
            http: oauth_http_client(),
            tokens: Mutex::new(None),
            storage,
        }
    }

    /// Build the authorization URL for one flow.
    pub fn authorization_url(&self, redirect_url: &str, pkce: &PkceParams) -> String {
        let scope = self.config.scopes.join(" ");
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256",
            self.config.auth_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(redirect_url),
            urlencoding::encode(&scope),
            urlencoding::encode(&pkce.state),
            urlencoding::encode(&pkce.challenge),
        )
    }

    /// Run the full interactive authorization-code flow: loopback server,
    /// browser, callback validation, code exchange, persistence.
    pub async fn authorize_interactive(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OAuthTokens, OAuthError> {
        let pkce = PkceParams::generate();
        let mut server = CallbackServer::bind().await?;
        let redirect_url = server.redirect_url();
        let auth_url = self.authorization_url(&redirect_url, &pkce);

        if let Err(err) = open_browser(&auth_url) {
            tracing::warn!(error = %err, "could not open a browser");
            println!("Open this URL to authorize {}:\n{}", self.provider, auth_url);
        }

        let params = server.wait_for_callback(cancel).await?;
        let code = validate_callback(params, &pkce.state)?;

        let tokens = self
            .exchange_code(&code, &redirect_url, &pkce.verifier)
            .await?;
        self.storage
            .save(&self.provider, &tokens.to_stored())
            .await?;
        *self.tokens.lock().await = Some(tokens.clone());
        Ok(tokens)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_url: &str,
        verifier: &str,
    ) -> Result<OAuthTokens, OAuthError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_url),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", verifier),
        ];
        if !self.config.client_secret.is_empty() {
            form.push(("client_secret", self.config.client_secret.as_str()));
        }
        let response = self.http.post(&self.config.token_url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Exchange(format!("HTTP {status}: {body}")));
        }
        let parsed = response.json::<TokenResponse>().await?;
        Ok(parsed.into_tokens(None))
    }

    /// Return a valid access token, refreshing when within the expiry skew.
    ///
    /// The whole check-and-refresh runs under the token mutex, so at most
    /// one exchange is in flight per credential; late arrivals observe the
    /// refreshed token on the double check and return immediately.
    pub async fn access_token(&self) -> Result<String, OAuthError> {
        let mut tokens = self.tokens.lock().await;

        if tokens.is_none() {
            if let Some(stored) = self.storage.load(&self.provider).await? {
                *tokens = Some(OAuthTokens::from_stored(&stored));
            }
        }

        let current = tokens.as_ref().ok_or(OAuthError::NoRefreshToken)?;
        if !current.is_expired() {
            return Ok(current.access_token.clone());
        }

        let response = refresh_access_token(
            &self.http,
            &self.config.token_url,
            &self.config.client_id,
            &self.config.client_secret,
            &current.refresh_token,
        )
        .await?;
        let refreshed = response.into_tokens(Some(&current.refresh_token));
        self.storage
            .save(&self.provider, &refreshed.to_stored())
            .await?;
        let access = refreshed.access_token.clone();
        *tokens = Some(refreshed);
        Ok(access)
    }
}

/// Check a callback against the flow that initiated it and extract the
/// authorization code. A state mismatch is rejected before the code is
/// looked at, and no token is ever exchanged or persisted for it.
fn validate_callback(
    params: callback::CallbackParams,
    expected_state: &str,
) -> Result<String, OAuthError> {
    if let Some(error) = params.error {
        return Err(OAuthError::Authorization(error));
    }
    if params.state.as_deref() != Some(expected_state) {
        return Err(OAuthError::StateMismatch);
    }
    params.code.ok_or(OAuthError::MissingCode)
}

/// Best-effort browser launch; callers print the URL when this fails.
pub fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    let command = "open";
    #[cfg(target_os = "windows")]
    let command = "explorer";
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let command = "xdg-open";

    std::process::Command::new(command)
        .arg(url)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map(|_| ())
}
