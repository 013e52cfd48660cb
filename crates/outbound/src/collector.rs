//! Collector transport and the retry policy wrapped around it.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Header carrying the organisation key on every collector request.
pub const ORG_KEY_HEADER: &str = "razee-org-key";

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("encode: {0}")]
    Encode(String),
}

/// POST a JSON body to a path relative to the collector base URL and report
/// the HTTP status. Non-2xx statuses are not errors at this layer.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn post(&self, path: &str, body: &Value) -> Result<u16, DeliveryError>;
}

/// [`Collector`] over reqwest with keep-alive connections.
pub struct HttpCollector {
    client: reqwest::Client,
    base_url: reqwest::Url,
    org_key: Option<String>,
}

impl HttpCollector {
    pub fn new(base_url: &str, org_key: Option<String>) -> anyhow::Result<Self> {
        let base_url = reqwest::Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| anyhow::anyhow!("invalid collector url {}: {}", base_url, e))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { client, base_url, org_key })
    }

    pub fn base_url(&self) -> &str { self.base_url.as_str() }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn post(&self, path: &str, body: &Value) -> Result<u16, DeliveryError> {
        let mut req = self.client.post(self.url_for(path)).json(body);
        if let Some(key) = &self.org_key {
            req = req.header(ORG_KEY_HEADER, key);
        }
        let resp = req.send().await.map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(resp.status().as_u16())
    }
}

/// Fixed-delay retry, applied to 5xx answers and transport errors only.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_attempts: 5, delay: Duration::from_secs(5) } }
}

impl RetryPolicy {
    pub fn retryable(outcome: &Result<u16, DeliveryError>) -> bool {
        match outcome {
            Ok(status) => *status >= 500,
            Err(DeliveryError::Transport(_)) => true,
            Err(DeliveryError::Encode(_)) => false,
        }
    }
}

/// POST with retries; returns the last outcome.
pub async fn deliver(collector: &dyn Collector, policy: &RetryPolicy, path: &str, body: &Value) -> Result<u16, DeliveryError> {
    let mut attempt = 1;
    loop {
        let outcome = collector.post(path, body).await;
        if attempt >= policy.max_attempts || !RetryPolicy::retryable(&outcome) {
            return outcome;
        }
        debug!(path = %path, attempt, outcome = ?outcome, "collector post failed; retrying");
        attempt += 1;
        tokio::time::sleep(policy.delay).await;
    }
}
