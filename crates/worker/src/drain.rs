//! Client for the API's retry-queue drain endpoint

use std::time::Duration;

use serde::Deserialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

const DRAIN_PATH: &str = "/internal/retry-queue/drain";

#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    /// Network failure or 5xx; worth another attempt
    #[error("transient drain failure: {0}")]
    Transient(String),

    /// The API refused the call (bad secret, bad route); retrying will not help
    #[error("drain rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl DrainError {
    fn is_transient(&self) -> bool {
        matches!(self, DrainError::Transient(_))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessedItem {
    pub event_id: String,
    pub outcome: String,
}

/// Body returned by the drain endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct DrainSummary {
    #[serde(default)]
    pub processed: Vec<ProcessedItem>,
    pub remaining: usize,
    pub dead_letter: usize,
}

impl DrainSummary {
    pub fn count(&self, outcome: &str) -> usize {
        self.processed.iter().filter(|p| p.outcome == outcome).count()
    }

    /// Event ids of the items that ended with `outcome`
    pub fn event_ids(&self, outcome: &str) -> Vec<&str> {
        self.processed
            .iter()
            .filter(|p| p.outcome == outcome)
            .map(|p| p.event_id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DrainConfig {
    pub api_base_url: String,
    pub secret: String,
    pub request_timeout: Duration,
    pub max_attempts: usize,
}

impl DrainConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_base_url = std::env::var("API_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
        let secret = std::env::var("RETRY_DRAIN_SECRET")
            .map_err(|_| anyhow::anyhow!("RETRY_DRAIN_SECRET must be set"))?;
        let max_attempts = std::env::var("RETRY_DRAIN_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4);

        Ok(Self {
            api_base_url,
            secret,
            request_timeout: Duration::from_secs(30),
            max_attempts,
        })
    }
}

#[derive(Clone)]
pub struct DrainClient {
    http: reqwest::Client,
    url: String,
    secret: String,
    max_attempts: usize,
}

impl DrainClient {
    pub fn new(config: DrainConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            url: format!("{}{}", config.api_base_url.trim_end_matches('/'), DRAIN_PATH),
            secret: config.secret,
            max_attempts: config.max_attempts.max(1),
        })
    }

    /// One drain invocation, retried with jittered exponential backoff on
    /// transient failures
    pub async fn drain(&self) -> Result<DrainSummary, DrainError> {
        // 200ms, 2s, then capped at 5s
        let strategy = ExponentialBackoff::from_millis(10)
            .factor(20)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.max_attempts - 1);

        RetryIf::start(strategy, || self.drain_once(), DrainError::is_transient).await
    }

    async fn drain_once(&self) -> Result<DrainSummary, DrainError> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.secret)
            .send()
            .await
            .map_err(|e| DrainError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            tracing::warn!(status = %status, "Drain endpoint returned server error");
            return Err(DrainError::Transient(format!("status {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DrainError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<DrainSummary>()
            .await
            .map_err(|e| DrainError::Transient(e.to_string()))
    }
}
