//! OAuth 2.0 token acquisition and caching.
//!
//! Tokens live in a single JSON file so repeated runs stay
//! non-interactive. [`FileTokenSource`] resolves in this order: in-memory
//! token, cache file, silent refresh, interactive authorization. A 401
//! from the API invalidates the source and the caller retries once.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::FitbitError;

/// Clock skew subtracted from the expiry when judging validity.
const EXPIRY_SKEW_SECS: i64 = 10;

/// Access tokens are requested with a 30 day lifetime so there is ample
/// room to refresh before they expire.
const REQUESTED_TOKEN_LIFETIME_SECS: u64 = 2_592_000;

/// An OAuth 2.0 token. This struct is also the exact JSON shape of the
/// cache file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl Token {
    pub fn is_valid(&self) -> bool {
        !self.access_token.is_empty() && !self.is_expired()
    }

    /// A token without an expiry never expires.
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(expiry) => Utc::now() >= expiry - Duration::seconds(EXPIRY_SKEW_SECS),
            None => false,
        }
    }
}

/// Body of a token endpoint reply; `expires_in` seconds are turned into
/// an absolute expiry as soon as the reply is decoded.
#[derive(Debug, Deserialize)]
struct TokenReply {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenReply {
    fn into_token(self, now: DateTime<Utc>) -> Token {
        Token {
            access_token: self.access_token,
            token_type: self.token_type,
            refresh_token: self.refresh_token,
            expiry: self.expires_in.map(|secs| now + Duration::seconds(secs)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OauthConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
}

impl OauthConfig {
    /// Authorization URL the user opens in a browser.
    pub fn authorize_url(&self, state: &str) -> Result<String, FitbitError> {
        let mut params: Vec<(&str, String)> = vec![
            ("response_type", "code".into()),
            ("client_id", self.client_id.clone()),
            ("scope", self.scopes.join(" ")),
            ("state", state.to_string()),
            ("expires_in", REQUESTED_TOKEN_LIFETIME_SECS.to_string()),
        ];
        if let Some(uri) = &self.redirect_uri {
            params.push(("redirect_uri", uri.clone()));
        }
        let url = reqwest::Url::parse_with_params(&self.auth_url, &params)
            .map_err(|e| FitbitError::Config(format!("invalid auth url {:?}: {e}", self.auth_url)))?;
        Ok(url.to_string())
    }

    /// Exchange an authorization code for a token.
    pub async fn exchange_code(
        &self,
        http: &reqwest::Client,
        code: &str,
    ) -> Result<Token, FitbitError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", &self.client_id),
        ];
        if let Some(uri) = &self.redirect_uri {
            form.push(("redirect_uri", uri));
        }
        self.token_request(http, &form).await
    }

    /// Trade a refresh token for a fresh access token.
    pub async fn refresh(
        &self,
        http: &reqwest::Client,
        refresh_token: &str,
    ) -> Result<Token, FitbitError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.token_request(http, &form).await
    }

    // Fitbit authenticates token endpoint calls with client basic auth.
    async fn token_request(
        &self,
        http: &reqwest::Client,
        form: &[(&str, &str)],
    ) -> Result<Token, FitbitError> {
        let resp = http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(self.client_secret.expose_secret()))
            .form(form)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(256).collect();
            return Err(FitbitError::Token(format!(
                "token endpoint returned {}: {snippet}",
                status.as_u16()
            )));
        }
        let reply: TokenReply = resp.json().await?;
        Ok(reply.into_token(Utc::now()))
    }
}

/// Random `state` parameter for the authorization request.
pub fn random_state() -> String {
    use rand::RngExt as _;
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    (0..32)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect()
}

#[derive(Debug, Error)]
enum CacheError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid token")]
    Invalid,
}

enum Cached {
    Valid(Token),
    /// Expired is not an error: the refresh token inside may still be good.
    Expired(Token),
}

fn load_cached_token(path: &Path) -> Result<Cached, CacheError> {
    let data = std::fs::read(path)?;
    let token: Token = serde_json::from_slice(&data)?;
    if token.is_valid() {
        return Ok(Cached::Valid(token));
    }
    if token.is_expired() {
        return Ok(Cached::Expired(token));
    }
    Err(CacheError::Invalid)
}

fn store_token(path: &Path, token: &Token) -> Result<(), FitbitError> {
    let data = serde_json::to_vec(token)
        .map_err(|e| FitbitError::Token(format!("could not encode token as json: {e}")))?;
    write_private(path, &data).map_err(|e| {
        FitbitError::Token(format!("could not cache token in {}: {e}", path.display()))
    })
}

// The cache holds a live credential; keep it owner-readable only.
#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write as _;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}

/// Obtains an authorization code once the user has visited the
/// authorization URL.
#[async_trait]
pub trait CodePrompt: Send + Sync {
    async fn obtain_code(&self, authorize_url: &str) -> Result<String, FitbitError>;
}

/// Prints the authorization URL and reads the code from stdin. Accepts
/// either the bare code or the entire redirect URL.
pub struct StdinPrompt;

#[async_trait]
impl CodePrompt for StdinPrompt {
    async fn obtain_code(&self, authorize_url: &str) -> Result<String, FitbitError> {
        // Instructions go to stderr so redirected stdout stays clean.
        eprintln!("Get auth code from:");
        eprintln!("{authorize_url}");
        eprintln!("Enter auth code (or the entire redirect URL):");
        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await
        .map_err(|e| FitbitError::Config(format!("stdin reader task failed: {e}")))??;
        let code = extract_code(line.trim());
        if code.is_empty() {
            return Err(FitbitError::Auth("no authorization code entered".into()));
        }
        Ok(code)
    }
}

fn extract_code(input: &str) -> String {
    if let Ok(url) = reqwest::Url::parse(input) {
        if let Some((_, code)) = url.query_pairs().find(|(k, _)| k == "code") {
            if !code.is_empty() {
                return code.into_owned();
            }
        }
    }
    input.to_string()
}

/// Waits for the browser redirect on a local TCP listener and pulls the
/// code out of the callback query string.
pub struct LoopbackPrompt {
    listener: tokio::net::TcpListener,
    expected_state: String,
}

impl LoopbackPrompt {
    pub async fn bind(
        addr: std::net::SocketAddr,
        expected_state: impl Into<String>,
    ) -> Result<Self, FitbitError> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            expected_state: expected_state.into(),
        })
    }

    /// Redirect URI to register in the authorization request, e.g.
    /// `http://127.0.0.1:7319/`.
    pub fn redirect_uri(&self) -> Result<String, FitbitError> {
        let addr = self.listener.local_addr()?;
        Ok(format!("http://{addr}/"))
    }
}

#[async_trait]
impl CodePrompt for LoopbackPrompt {
    async fn obtain_code(&self, authorize_url: &str) -> Result<String, FitbitError> {
        eprintln!("Open the following URL to authorize:");
        eprintln!("{authorize_url}");
        loop {
            let (mut stream, peer) = self.listener.accept().await?;
            tracing::debug!("oauth callback connection from {peer}");

            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await?;
            let request = String::from_utf8_lossy(&buf[..n]);
            let Some(target) = request
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(1))
            else {
                respond(&mut stream, "400 Bad Request", "Malformed request.").await?;
                continue;
            };
            // Browsers also ask for /favicon.ico; only the query matters.
            let Ok(url) = reqwest::Url::parse(&format!("http://localhost{target}")) else {
                respond(&mut stream, "400 Bad Request", "Malformed request target.").await?;
                continue;
            };
            let query: std::collections::HashMap<String, String> =
                url.query_pairs().into_owned().collect();

            let code = match query.get("code") {
                Some(code) if !code.is_empty() => code.clone(),
                _ => {
                    respond(&mut stream, "404 Not Found", "Missing code parameter.").await?;
                    continue;
                }
            };
            if query.get("state").map(String::as_str) != Some(self.expected_state.as_str()) {
                respond(&mut stream, "400 Bad Request", "State mismatch.").await?;
                return Err(FitbitError::Auth("state mismatch in oauth callback".into()));
            }

            respond(&mut stream, "200 OK", "Authorized. You can close this window.").await?;
            return Ok(code);
        }
    }
}

async fn respond(
    stream: &mut tokio::net::TcpStream,
    status: &str,
    body: &str,
) -> std::io::Result<()> {
    let reply = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(reply.as_bytes()).await?;
    stream.shutdown().await
}

/// Hands out a credential for API requests.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn token(&self) -> Result<Token, FitbitError>;

    /// Drop any cached credential so the next `token()` call starts over.
    async fn invalidate(&self);
}

/// Wraps a token supplied directly on the command line. `invalidate` is a
/// no-op: there is nothing to re-acquire, so a second auth failure is
/// surfaced to the caller.
pub struct StaticTokenSource {
    token: Token,
}

impl StaticTokenSource {
    pub fn new(token: Token) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<Token, FitbitError> {
        Ok(self.token.clone())
    }

    async fn invalidate(&self) {}
}

/// Token source backed by a JSON cache file with an interactive fallback.
pub struct FileTokenSource {
    oauth: OauthConfig,
    cache_path: Option<PathBuf>,
    prompt: Box<dyn CodePrompt>,
    state: String,
    http: reqwest::Client,
    cached: Mutex<Option<Token>>,
}

impl FileTokenSource {
    pub fn new(
        oauth: OauthConfig,
        cache_path: Option<PathBuf>,
        prompt: Box<dyn CodePrompt>,
        state: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("reqwest client build should not fail");
        Self {
            oauth,
            cache_path,
            prompt,
            state: state.into(),
            http,
            cached: Mutex::new(None),
        }
    }

    fn persist(&self, token: &Token) -> Result<(), FitbitError> {
        match &self.cache_path {
            Some(path) => store_token(path, token),
            None => Ok(()),
        }
    }

    async fn refresh_or_authorize(
        &self,
        refresh_token: Option<String>,
    ) -> Result<Token, FitbitError> {
        if let Some(refresh) = refresh_token {
            match self.oauth.refresh(&self.http, &refresh).await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    tracing::warn!("token refresh failed, re-authorizing interactively: {e}");
                }
            }
        }
        let authorize_url = self.oauth.authorize_url(&self.state)?;
        let code = self.prompt.obtain_code(&authorize_url).await?;
        self.oauth.exchange_code(&self.http, &code).await
    }
}

#[async_trait]
impl TokenSource for FileTokenSource {
    async fn token(&self) -> Result<Token, FitbitError> {
        let mut cached = self.cached.lock().await;
        let mut refreshable = None;

        if let Some(token) = cached.as_ref() {
            if token.is_valid() {
                return Ok(token.clone());
            }
            refreshable = token.refresh_token.clone();
        }

        if let Some(path) = &self.cache_path {
            match load_cached_token(path) {
                Ok(Cached::Valid(token)) => {
                    *cached = Some(token.clone());
                    return Ok(token);
                }
                Ok(Cached::Expired(token)) => {
                    // Routine on runs spaced more than 30 days apart.
                    refreshable = token.refresh_token.or(refreshable);
                }
                Err(CacheError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("could not read token cache {}: {e}", path.display());
                }
            }
        }

        let token = self.refresh_or_authorize(refreshable).await?;
        self.persist(&token)?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        *cached = None;
        if let Some(path) = &self.cache_path {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("could not remove token cache {}: {e}", path.display());
                }
            }
        }
    }
}
