//! Polling the position feed.
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ingest::RawSnapshot;
use tracing::{info, warn};

use crate::error::{ConfigError, FetchError, StageResult};
use crate::retry::{execute_with_retry_async, RetryConfig};

/// Source of raw feed snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self) -> Result<RawSnapshot, FetchError>;
}

/// Polls a JSON endpoint over HTTP GET.
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    retry: RetryConfig,
}

impl HttpSnapshotSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| ConfigError::Client(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_once(&self) -> Result<RawSnapshot, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        RawSnapshot::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout.as_secs())
        } else if let Some(status) = err.status() {
            FetchError::Status(status.as_u16())
        } else if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self) -> Result<RawSnapshot, FetchError> {
        execute_with_retry_async(
            &self.retry,
            |_| self.fetch_once(),
            FetchError::is_transient,
        )
        .await
        .into_result()
    }
}

/// Fetch one snapshot, converting the outcome into a stage result.
pub async fn fetch_stage(source: &dyn SnapshotSource) -> StageResult<RawSnapshot> {
    let start = Instant::now();
    match source.fetch().await {
        Ok(snapshot) => {
            info!(
                elapsed_micros = start.elapsed().as_micros() as u64,
                "fetch_success"
            );
            Ok(snapshot)
        }
        Err(err) => {
            warn!(
                error = %err,
                transient = err.is_transient(),
                elapsed_micros = start.elapsed().as_micros() as u64,
                "fetch_failure"
            );
            Err(err.into())
        }
    }
}
