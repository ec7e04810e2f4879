//! Outbound HTTP for downstream hooks (scoring service, read-layer cache),
//! with retry classification and capped exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    Transient,
    Permanent,
}

impl Retry {
    /// Request timeouts, throttling and 5xx are worth another attempt.
    pub fn for_status(status: StatusCode) -> Self {
        match status {
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Retry::Transient,
            status if status.is_server_error() => Retry::Transient,
            _ => Retry::Permanent,
        }
    }

    pub fn for_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Retry::Transient
        } else {
            Retry::Permanent
        }
    }
}

/// Capped doubling delay. Paces in-request hook retries and pushes back the
/// `run_after` of failed queue jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry`, counting from zero.
    pub fn delay(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .map(|factor| self.base_delay.saturating_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// How long a queue job waits after failing its `attempts`-th run.
    pub fn for_job_attempt(&self, attempts: u32) -> chrono::Duration {
        let delay = self.delay(attempts.saturating_sub(1));
        chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("judgment-intake/{}", env!("CARGO_PKG_VERSION"))),
            concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed reply from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("hook client is shutting down")]
    Closed,
}

impl HookError {
    pub fn retry(&self) -> Retry {
        match self {
            HookError::Request(err) => Retry::for_transport(err),
            HookError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(Retry::for_status)
                .unwrap_or(Retry::Permanent),
            HookError::Decode { .. } | HookError::Closed => Retry::Permanent,
        }
    }
}

#[derive(Debug)]
pub struct HookClient {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HookClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// POST a JSON body, retrying transient failures, and decode the JSON reply
    /// (`Value::Null` for an empty body).
    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, HookError> {
        let _permit = self.limit.acquire().await.map_err(|_| HookError::Closed)?;
        let span = info_span!("hook_post", url);

        async {
            let mut attempt: u32 = 0;
            loop {
                match self.post_once(url, body).await {
                    Ok(value) => return Ok(value),
                    Err(err)
                        if err.retry() == Retry::Transient
                            && (attempt as usize) < self.backoff.max_retries =>
                    {
                        let delay = self.backoff.delay(attempt);
                        warn!(attempt, ?delay, error = %err, "retrying hook call");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn post_once(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, HookError> {
        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HookError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let url = resp.url().to_string();
        let bytes = resp.bytes().await?;
        debug!(status = status.as_u16(), bytes = bytes.len(), "hook replied");
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|source| HookError::Decode { url, source })
    }
}
