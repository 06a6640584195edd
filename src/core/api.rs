//! Client for the Test Engine upload endpoint.
//!
//! Upload problems never fail the run: every batch yields `Some(response)` on
//! a 2xx answer and `None` otherwise, with a warning logged.

use crate::core::ConfigProvider;
use crate::domain::model::Payload;
use crate::utils::error::Result;
use crate::utils::validation::usable_token;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://analytics-api.buildkite.com/v1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct UploadResponse {
    pub status: u16,
    pub body: Value,
}

impl UploadResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn queued(&self) -> Option<u64> {
        self.body.get("queued").and_then(Value::as_u64)
    }

    pub fn run_url(&self) -> Option<&str> {
        self.body.get("run_url").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    max_retries: u32,
    retry_delay: Duration,
}

enum Attempt {
    Done(Option<UploadResponse>),
    Retry(Duration),
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(str::to_string),
            max_retries: 0,
            retry_delay: Duration::from_millis(500),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn from_config<C: ConfigProvider>(config: &C) -> Result<Self> {
        Ok(
            Self::new(config.api_url(), config.token(), config.request_timeout())?
                .with_retries(config.max_retries(), config.retry_delay()),
        )
    }

    pub fn uploads_url(&self) -> String {
        format!("{}/uploads", self.base_url)
    }

    /// Uploads the payload in batches of `batch_size`, returning one outcome
    /// per batch in order. A missing token short-circuits to a single `None`.
    pub async fn submit(&self, payload: Payload, batch_size: usize) -> Vec<Option<UploadResponse>> {
        let Some(token) = usable_token(self.token.as_deref()) else {
            tracing::warn!(
                "buildkite-test-collector - No usable BUILDKITE_ANALYTICS_TOKEN set; results will not be uploaded"
            );
            return vec![None];
        };

        let batches = payload.into_batches(batch_size);
        let total = batches.len();
        let mut outcomes = Vec::with_capacity(total);

        for (index, batch) in batches.into_iter().enumerate() {
            tracing::debug!(
                "Uploading batch {}/{} ({} tests) to {}",
                index + 1,
                total,
                batch.data.len(),
                self.uploads_url()
            );
            outcomes.push(self.submit_batch(token, &batch).await);
        }

        outcomes
    }

    async fn submit_batch(&self, token: &str, batch: &Payload) -> Option<UploadResponse> {
        let body = batch.as_json();
        let mut attempt = 0;

        loop {
            match self.attempt(token, &body, attempt).await {
                Attempt::Done(outcome) => return outcome,
                Attempt::Retry(delay) => {
                    attempt += 1;
                    tracing::info!(
                        "Retrying upload in {:?} (attempt {}/{})",
                        delay,
                        attempt,
                        self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(&self, token: &str, body: &Value, attempt: u32) -> Attempt {
        let can_retry = attempt < self.max_retries;

        let response = self
            .client
            .post(self.uploads_url())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Token token=\"{}\"", token))
            .json(body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if can_retry => {
                tracing::debug!("{}: {}", error_kind(&e), e);
                return Attempt::Retry(self.backoff(attempt));
            }
            Err(e) => {
                tracing::warn!("{}", transport_warning(&e));
                return Attempt::Done(None);
            }
        };

        let status = response.status();
        if status.is_success() {
            let body = read_body(response).await;
            return Attempt::Done(Some(UploadResponse {
                status: status.as_u16(),
                body,
            }));
        }

        if can_retry && is_retryable(status) {
            let delay = retry_after(&response)
                .map(|d| d.min(MAX_BACKOFF))
                .unwrap_or_else(|| self.backoff(attempt));
            tracing::debug!("Upload answered {}", status);
            return Attempt::Retry(delay);
        }

        let body = read_body(response).await;
        tracing::warn!(
            "buildkite-test-collector - Upload rejected with HTTP {}: {}",
            status,
            body
        );
        Attempt::Done(None)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn read_body(response: reqwest::Response) -> Value {
    match response.text().await {
        Ok(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        Err(e) => {
            tracing::debug!("Could not read response body: {}", e);
            Value::Null
        }
    }
}

/// Short name for a transport failure, as shown in warnings.
pub fn error_kind(error: &reqwest::Error) -> &'static str {
    if error.is_connect() && error.is_timeout() {
        "ConnectTimeout"
    } else if error.is_timeout() {
        "ReadTimeout"
    } else if error.is_connect() {
        "ConnectionError"
    } else if error.is_body() || error.is_decode() {
        "InvalidResponse"
    } else {
        "RequestError"
    }
}

/// The warning logged when a batch is given up on after a transport error.
pub fn transport_warning(error: &reqwest::Error) -> String {
    format!("buildkite-test-collector - {}: {}", error_kind(error), error)
}
