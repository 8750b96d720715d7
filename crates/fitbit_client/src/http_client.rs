//! HTTP client for the Fitbit web API.
//!
//! This module provides a reqwest-based implementation of the
//! [`FitbitApi`](crate::FitbitApi) trait.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::oauth::TokenSource;
use crate::{FitbitApi, FitbitError, TimeSeriesEntry, WeightEntry};

/// Client for the Fitbit API using reqwest.
#[derive(Clone)]
pub struct ReqwestFitbitClient {
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    client: reqwest::Client,
}

impl ReqwestFitbitClient {
    /// Create a new client instance.
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the Fitbit API (e.g., "https://api.fitbit.com")
    /// * `tokens` - Source of the bearer credential for each request
    pub fn new(base_url: &str, tokens: Arc<dyn TokenSource>) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("reqwest client build should not fail");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            client,
        }
    }

    /// GET `url` with a bearer token and decode the JSON reply. An auth
    /// rejection invalidates the token source and the request is retried
    /// exactly once; any other failure is returned as is.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, FitbitError> {
        match self.get_json_once(url).await {
            Err(FitbitError::Auth(reason)) => {
                tracing::info!("authorization rejected ({reason}); re-authorizing and retrying once");
                self.tokens.invalidate().await;
                self.get_json_once(url).await
            }
            other => other,
        }
    }

    async fn get_json_once<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, FitbitError> {
        let token = self.tokens.token().await?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(&token.access_token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(256).collect();
            return Err(match status.as_u16() {
                401 | 403 => FitbitError::Auth(snippet),
                s => FitbitError::Api {
                    status: s,
                    body: snippet,
                },
            });
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl FitbitApi for ReqwestFitbitClient {
    async fn get_weight_timeseries(&self) -> Result<Vec<TimeSeriesEntry>, FitbitError> {
        let url = format!("{}/1/user/-/body/weight/date/today/max.json", self.base_url);
        let reply: crate::TimeSeriesReply = self.get_json(&url).await?;
        Ok(reply.entries)
    }

    async fn get_weight_log(&self, end_date: NaiveDate) -> Result<Vec<WeightEntry>, FitbitError> {
        let url = format!(
            "{}/1/user/-/body/log/weight/date/{}/30d.json",
            self.base_url,
            end_date.format("%Y-%m-%d")
        );
        let reply: crate::WeightLogReply = self.get_json(&url).await?;
        Ok(reply.weights)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::ReqwestFitbitClient;
    use crate::oauth::{StaticTokenSource, Token};

    fn static_source() -> Arc<StaticTokenSource> {
        Arc::new(StaticTokenSource::new(Token {
            access_token: "tok".into(),
            token_type: "Bearer".into(),
            refresh_token: None,
            expiry: None,
        }))
    }

    #[tokio::test]
    async fn client_new_trims_trailing_slash() {
        let client = ReqwestFitbitClient::new("http://localhost/", static_source());
        assert_eq!(client.base_url, "http://localhost");
    }
}
