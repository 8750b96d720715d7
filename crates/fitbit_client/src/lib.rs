//! Fitbit body-weight export client: OAuth token management, API access
//! and the date-window export loop.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;

pub mod config;
pub mod export;
pub mod http_client;
pub mod oauth;

#[derive(Debug, Error)]
pub enum FitbitError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("authorization rejected: {0}")]
    Auth(String),
    #[error("api error (status {status}): {body}")]
    Api { status: u16, body: String },
    #[error("token error: {0}")]
    Token(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One day of the daily-aggregated body-weight time series.
///
/// The time-series endpoint returns only dates, no times, and averages
/// multiple measurements taken on the same day, so this reply is only
/// good for locating the oldest recorded entry.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TimeSeriesEntry {
    #[serde(rename = "dateTime")]
    pub date_time: String, // YYYY-MM-DD
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TimeSeriesReply {
    #[serde(rename = "body-weight", default)]
    pub entries: Vec<TimeSeriesEntry>,
}

/// A raw body-weight log entry with a full timestamp.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WeightEntry {
    #[serde(default)]
    pub bmi: Option<f64>,
    pub date: String, // YYYY-MM-DD
    // The API spells this `logId`; older replies used `logid`.
    #[serde(rename = "logId", alias = "logid", default)]
    pub log_id: Option<u64>,
    pub time: String, // HH:MM:SS
    pub weight: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WeightLogReply {
    #[serde(rename = "weight", default)]
    pub weights: Vec<WeightEntry>,
}

#[async_trait]
pub trait FitbitApi: Send + Sync + 'static {
    /// Daily-aggregated series over the account's full history.
    async fn get_weight_timeseries(&self) -> Result<Vec<TimeSeriesEntry>, FitbitError>;

    /// Raw timestamped entries for the 30-day window ending on `end_date`.
    async fn get_weight_log(
        &self,
        end_date: NaiveDate,
    ) -> Result<Vec<WeightEntry>, FitbitError>;
}
