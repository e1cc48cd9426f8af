//! Classification provider: document-level sentiment for a post's linked url.

use std::time::Duration;

use async_trait::async_trait;
use hnsync_storage::RetryDisposition;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentReading {
    pub score: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    Service(String),
    #[error("sentiment provider is not configured")]
    NotConfigured,
}

impl ProviderError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            ProviderError::RateLimited(_) | ProviderError::Service(_) => RetryDisposition::Retryable,
            ProviderError::NotConfigured => RetryDisposition::NonRetryable,
        }
    }
}

#[async_trait]
pub trait SentimentProvider: Send + Sync {
    async fn classify(&self, url: &str) -> Result<SentimentReading, ProviderError>;
}

/// Stand-in used when no provider credentials are present. Every call fails terminally.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredProvider;

#[async_trait]
impl SentimentProvider for UnconfiguredProvider {
    async fn classify(&self, _url: &str) -> Result<SentimentReading, ProviderError> {
        Err(ProviderError::NotConfigured)
    }
}

#[derive(Debug, Clone)]
pub struct WatsonNluConfig {
    pub api_key: String,
    pub service_url: String,
    pub version: String,
    pub timeout: Duration,
}

/// IBM Watson Natural Language Understanding `analyze` endpoint, sentiment feature only.
#[derive(Debug, Clone)]
pub struct WatsonNluProvider {
    client: reqwest::Client,
    config: WatsonNluConfig,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    sentiment: AnalyzeSentiment,
}

#[derive(Debug, Deserialize)]
struct AnalyzeSentiment {
    document: SentimentReading,
}

#[derive(Debug, Deserialize)]
struct AnalyzeError {
    error: String,
}

impl WatsonNluProvider {
    pub fn new(config: WatsonNluConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn analyze_url(&self) -> String {
        format!(
            "{}/v1/analyze?version={}",
            self.config.service_url.trim_end_matches('/'),
            self.config.version
        )
    }
}

#[async_trait]
impl SentimentProvider for WatsonNluProvider {
    async fn classify(&self, url: &str) -> Result<SentimentReading, ProviderError> {
        let resp = self
            .client
            .post(self.analyze_url())
            .basic_auth("apikey", Some(&self.config.api_key))
            .json(&json!({ "url": url, "features": { "sentiment": {} } }))
            .send()
            .await
            .map_err(|e| ProviderError::Service(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            let body: AnalyzeResponse = resp
                .json()
                .await
                .map_err(|e| ProviderError::Service(format!("invalid analyze response: {e}")))?;
            return Ok(body.sentiment.document);
        }

        let message = match resp.json::<AnalyzeError>().await {
            Ok(body) => body.error,
            Err(_) => format!("analyze failed with http status {}", status.as_u16()),
        };
        if status == StatusCode::TOO_MANY_REQUESTS {
            Err(ProviderError::RateLimited(message))
        } else {
            Err(ProviderError::Service(message))
        }
    }
}
