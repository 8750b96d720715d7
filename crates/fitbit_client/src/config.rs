use std::path::PathBuf;

use secrecy::SecretString;

use crate::FitbitError;
use crate::oauth::OauthConfig;

pub const DEFAULT_API_BASE_URL: &str = "https://api.fitbit.com";
pub const DEFAULT_AUTH_URL: &str = "https://www.fitbit.com/oauth2/authorize";
pub const DEFAULT_TOKEN_URL: &str = "https://api.fitbit.com/oauth2/token";

/// The only scope this tool needs.
pub const WEIGHT_SCOPE: &str = "weight";

#[derive(Clone, Debug)]
pub struct Config {
    pub client_id: String,
    pub client_secret: SecretString,
    /// Path of the JSON token cache. `None` disables persistence and the
    /// interactive flow runs on every invocation.
    pub token_cache: Option<PathBuf>,
    /// When set, the OAuth flow is skipped entirely.
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub api_base_url: String,
    pub auth_url: String,
    pub token_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, FitbitError> {
        Self::from_env_with(|k| std::env::var(k).ok())
    }

    /// Testable helper that reads configuration values using the provided
    /// function. This avoids mutating global environment in tests and keeps
    /// `from_env()` small and safe.
    pub fn from_env_with<F>(mut get: F) -> Result<Self, FitbitError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let client_id = get("FITBIT_CLIENT_ID")
            .ok_or_else(|| FitbitError::Config("FITBIT_CLIENT_ID missing".into()))?;
        let client_secret = get("FITBIT_CLIENT_SECRET").ok_or_else(|| {
            FitbitError::Config(
                "FITBIT_CLIENT_SECRET missing. Register an app at https://dev.fitbit.com to get one"
                    .into(),
            )
        })?;
        Ok(Self {
            client_id,
            client_secret: SecretString::new(client_secret.into()),
            token_cache: get("FITBIT_TOKEN_CACHE").map(PathBuf::from),
            access_token: get("FITBIT_ACCESS_TOKEN").map(|t| SecretString::new(t.into())),
            refresh_token: get("FITBIT_REFRESH_TOKEN").map(|t| SecretString::new(t.into())),
            api_base_url: get("FITBIT_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.into()),
            auth_url: get("FITBIT_AUTH_URL").unwrap_or_else(|| DEFAULT_AUTH_URL.into()),
            token_url: get("FITBIT_TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.into()),
        })
    }

    /// OAuth endpoint configuration for the interactive flow. The redirect
    /// URI is filled in later when a loopback listener is used.
    pub fn oauth(&self) -> OauthConfig {
        OauthConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            auth_url: self.auth_url.clone(),
            token_url: self.token_url.clone(),
            redirect_uri: None,
            scopes: vec![WEIGHT_SCOPE.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_missing_client_secret() {
        let get = |k: &str| match k {
            "FITBIT_CLIENT_ID" => Some("228XTZ".into()),
            _ => None,
        };
        let res = Config::from_env_with(get);
        assert!(res.is_err());
    }

    #[test]
    fn from_env_reads_values_and_defaults() {
        let get = |k: &str| match k {
            "FITBIT_CLIENT_ID" => Some("228XTZ".into()),
            "FITBIT_CLIENT_SECRET" => Some("sekrit".into()),
            "FITBIT_TOKEN_CACHE" => Some("/tmp/token.json".into()),
            _ => None,
        };
        let cfg = Config::from_env_with(get).expect("cfg");
        assert_eq!(cfg.client_id, "228XTZ");
        assert_eq!(cfg.token_cache, Some(PathBuf::from("/tmp/token.json")));
        assert_eq!(cfg.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(cfg.token_url, DEFAULT_TOKEN_URL);
        assert!(cfg.access_token.is_none());
    }

    #[test]
    fn oauth_config_carries_weight_scope() {
        let get = |k: &str| match k {
            "FITBIT_CLIENT_ID" => Some("228XTZ".into()),
            "FITBIT_CLIENT_SECRET" => Some("sekrit".into()),
            _ => None,
        };
        let cfg = Config::from_env_with(get).expect("cfg");
        let oauth = cfg.oauth();
        assert_eq!(oauth.scopes, vec!["weight".to_string()]);
        assert_eq!(oauth.auth_url, DEFAULT_AUTH_URL);
        assert!(oauth.redirect_uri.is_none());
    }
}
