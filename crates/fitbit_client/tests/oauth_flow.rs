use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fitbit_client::FitbitError;
use fitbit_client::oauth::{
    CodePrompt, FileTokenSource, LoopbackPrompt, OauthConfig, Token, TokenSource,
};
use secrecy::SecretString;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn oauth_config(server: &MockServer) -> OauthConfig {
    OauthConfig {
        client_id: "228XTZ".into(),
        client_secret: SecretString::new("sekrit".into()),
        auth_url: format!("{}/oauth2/authorize", server.uri()),
        token_url: format!("{}/oauth2/token", server.uri()),
        redirect_uri: None,
        scopes: vec!["weight".into()],
    }
}

fn token_reply(access: &str, refresh: &str) -> serde_json::Value {
    serde_json::json!({
        "access_token": access,
        "token_type": "Bearer",
        "refresh_token": refresh,
        "expires_in": 2_592_000,
        "scope": "weight",
        "user_id": "ABC123"
    })
}

/// Hands out a fixed code and counts how often it was asked.
struct FakePrompt {
    code: String,
    calls: AtomicU32,
}

impl FakePrompt {
    fn new(code: &str) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            code: code.into(),
            calls: AtomicU32::new(0),
        })
    }
}

/// Orphan-rule-safe handle: the trait cannot be implemented for
/// `Arc<FakePrompt>` from this crate, so a local newtype delegates.
#[derive(Clone)]
struct SharedPrompt(std::sync::Arc<FakePrompt>);

#[async_trait]
impl CodePrompt for SharedPrompt {
    async fn obtain_code(&self, _authorize_url: &str) -> Result<String, FitbitError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.0.code.clone())
    }
}

#[tokio::test]
async fn exchange_code_posts_form_with_client_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=c0de"))
        .and(body_string_contains("client_id=228XTZ"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_reply("acc", "ref")))
        .mount(&server)
        .await;

    let config = oauth_config(&server);
    let http = reqwest::Client::new();
    let token = config.exchange_code(&http, "c0de").await.expect("token");

    assert_eq!(token.access_token, "acc");
    assert_eq!(token.refresh_token.as_deref(), Some("ref"));
    assert!(token.expiry.expect("expiry") > Utc::now() + Duration::days(29));

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let auth = received[0]
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(auth.starts_with("Basic "));
}

#[tokio::test]
async fn refresh_posts_refresh_grant() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=old-refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_reply("acc2", "ref2")))
        .mount(&server)
        .await;

    let config = oauth_config(&server);
    let http = reqwest::Client::new();
    let token = config.refresh(&http, "old-refresh").await.expect("token");
    assert_eq!(token.access_token, "acc2");
}

#[tokio::test]
async fn token_endpoint_failure_is_a_token_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .mount(&server)
        .await;

    let config = oauth_config(&server);
    let http = reqwest::Client::new();
    let err = config.refresh(&http, "bad").await.unwrap_err();
    match err {
        FitbitError::Token(msg) => assert!(msg.contains("invalid_grant")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn valid_cache_is_used_without_any_request() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = dir.path().join("token.json");

    let cached = Token {
        access_token: "cached".into(),
        token_type: "Bearer".into(),
        refresh_token: Some("ref".into()),
        expiry: Some(Utc::now() + Duration::days(10)),
    };
    std::fs::write(&cache, serde_json::to_vec(&cached).unwrap()).unwrap();

    let prompt = FakePrompt::new("unused");
    let source = FileTokenSource::new(
        oauth_config(&server),
        Some(cache),
        Box::new(SharedPrompt(prompt.clone())),
        "state",
    );
    let token = source.token().await.expect("token");
    assert_eq!(token.access_token, "cached");
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(prompt.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn expired_cache_refreshes_silently_and_persists() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=stale-refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_reply("fresh", "ref2")))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let cache = dir.path().join("token.json");
    let stale = Token {
        access_token: "stale".into(),
        token_type: "Bearer".into(),
        refresh_token: Some("stale-refresh".into()),
        expiry: Some(Utc::now() - Duration::days(1)),
    };
    std::fs::write(&cache, serde_json::to_vec(&stale).unwrap()).unwrap();

    let prompt = FakePrompt::new("unused");
    let source = FileTokenSource::new(
        oauth_config(&server),
        Some(cache.clone()),
        Box::new(SharedPrompt(prompt.clone())),
        "state",
    );
    let token = source.token().await.expect("token");
    assert_eq!(token.access_token, "fresh");

    // The interactive prompt never ran and the new token was written back.
    assert_eq!(prompt.calls.load(Ordering::SeqCst), 0);
    let persisted: Token =
        serde_json::from_slice(&std::fs::read(&cache).unwrap()).expect("persisted token");
    assert_eq!(persisted.access_token, "fresh");
    assert_eq!(persisted.refresh_token.as_deref(), Some("ref2"));
}

#[tokio::test]
async fn missing_cache_runs_interactive_flow_and_persists() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=c0de"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_reply("brand-new", "ref")))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let cache = dir.path().join("token.json");

    let prompt = FakePrompt::new("c0de");
    let source = FileTokenSource::new(
        oauth_config(&server),
        Some(cache.clone()),
        Box::new(SharedPrompt(prompt.clone())),
        "state",
    );
    let token = source.token().await.expect("token");
    assert_eq!(token.access_token, "brand-new");
    assert!(cache.exists());
    assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);

    // A second call reuses the in-memory token: no further requests.
    let again = source.token().await.expect("token");
    assert_eq!(again.access_token, "brand-new");
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_refresh_falls_back_to_interactive() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_reply("via-code", "ref")))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let cache = dir.path().join("token.json");
    let stale = Token {
        access_token: "stale".into(),
        token_type: "Bearer".into(),
        refresh_token: Some("dead-refresh".into()),
        expiry: Some(Utc::now() - Duration::days(1)),
    };
    std::fs::write(&cache, serde_json::to_vec(&stale).unwrap()).unwrap();

    let source = FileTokenSource::new(
        oauth_config(&server),
        Some(cache),
        Box::new(SharedPrompt(FakePrompt::new("c0de"))),
        "state",
    );
    let token = source.token().await.expect("token");
    assert_eq!(token.access_token, "via-code");
}

#[tokio::test]
async fn invalidate_clears_memory_and_cache_file() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = dir.path().join("token.json");
    let cached = Token {
        access_token: "cached".into(),
        token_type: "Bearer".into(),
        refresh_token: None,
        expiry: None,
    };
    std::fs::write(&cache, serde_json::to_vec(&cached).unwrap()).unwrap();

    let prompt = FakePrompt::new("c0de");
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_reply("fresh", "ref")))
        .mount(&server)
        .await;

    let source = FileTokenSource::new(
        oauth_config(&server),
        Some(cache.clone()),
        Box::new(SharedPrompt(prompt.clone())),
        "state",
    );
    assert_eq!(source.token().await.expect("token").access_token, "cached");

    source.invalidate().await;
    assert!(!cache.exists());

    // Starting over goes through the interactive exchange again.
    assert_eq!(source.token().await.expect("token").access_token, "fresh");
}

#[tokio::test]
async fn loopback_prompt_captures_code_from_redirect() {
    let prompt = LoopbackPrompt::bind("127.0.0.1:0".parse().unwrap(), "st4te")
        .await
        .expect("bind");
    let callback = format!("{}?code=xyz&state=st4te", prompt.redirect_uri().expect("uri"));

    let (code, resp) = tokio::join!(
        prompt.obtain_code("https://example.com/authorize"),
        reqwest::get(callback)
    );
    assert_eq!(code.expect("code"), "xyz");
    assert!(resp.expect("resp").status().is_success());
}

#[tokio::test]
async fn loopback_prompt_rejects_state_mismatch() {
    let prompt = LoopbackPrompt::bind("127.0.0.1:0".parse().unwrap(), "st4te")
        .await
        .expect("bind");
    let callback = format!("{}?code=xyz&state=wrong", prompt.redirect_uri().expect("uri"));

    let (code, resp) = tokio::join!(
        prompt.obtain_code("https://example.com/authorize"),
        reqwest::get(callback)
    );
    assert!(matches!(code, Err(FitbitError::Auth(_))));
    assert_eq!(resp.expect("resp").status().as_u16(), 400);
}
