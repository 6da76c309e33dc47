//! HTTP-backed provider adapter.
//!
//! Serves both remote API backends (structured status-code rate-limit
//! detection) and fully local HTTP backends such as an Ollama endpoint
//! (no rate limiting, always-false classification). The request shape is a
//! minimal JSON generation call; the backend's internals stay opaque.

use crate::error::{ConfigError, ProviderError};
use crate::packet::{ArtifactBundle, TaskPacket};
use crate::provider::{ProviderAdapter, ProviderDescriptor, RateLimitStrategy};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

const DEFAULT_TIMEOUT_SECS: u64 = 300;
const AVAILABILITY_PROBE_SECS: u64 = 5;

pub struct HttpAdapter {
    name: String,
    endpoint: Url,
    health_url: Url,
    model: Option<String>,
    strategy: RateLimitStrategy,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    files_modified: Vec<String>,
    #[serde(default)]
    diff_summary: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpAdapter {
    pub fn new(descriptor: &ProviderDescriptor) -> Result<Self, ConfigError> {
        let raw_endpoint = descriptor.settings.endpoint.clone().ok_or_else(|| {
            ConfigError::InvalidProvider {
                name: descriptor.name.clone(),
                reason: "http provider requires settings.endpoint".to_string(),
            }
        })?;

        let endpoint = Url::parse(&raw_endpoint).map_err(|e| ConfigError::InvalidProvider {
            name: descriptor.name.clone(),
            reason: format!("invalid endpoint url '{}': {}", raw_endpoint, e),
        })?;

        let health_url = match &descriptor.settings.health_path {
            Some(path) => endpoint
                .join(path)
                .map_err(|e| ConfigError::InvalidProvider {
                    name: descriptor.name.clone(),
                    reason: format!("invalid health path '{}': {}", path, e),
                })?,
            // Default probe hits the endpoint origin.
            None => {
                let mut base = endpoint.clone();
                base.set_path("/");
                base
            }
        };

        let timeout = Duration::from_secs(
            descriptor.settings.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
        );
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidProvider {
                name: descriptor.name.clone(),
                reason: format!("failed to build http client: {}", e),
            })?;

        Ok(Self {
            name: descriptor.name.clone(),
            endpoint,
            health_url,
            model: descriptor.settings.model.clone(),
            strategy: descriptor.rate_limit_strategy,
            client,
        })
    }

    fn classify_status(&self, status: StatusCode, retry_after: Option<u64>) -> ProviderError {
        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                ProviderError::RateLimited {
                    message: format!("backend returned {}", status),
                    retry_after: retry_after
                        .map(|secs| Utc::now() + ChronoDuration::seconds(secs as i64)),
                }
            }
            s if s.is_server_error() => {
                ProviderError::Unavailable(format!("backend returned {}", s))
            }
            s => ProviderError::ExecutionFailed {
                detail: format!("backend rejected request with {}", s),
                logs: None,
            },
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    async fn generate(
        &self,
        packet: &TaskPacket,
        guidance: &[String],
    ) -> Result<ArtifactBundle, ProviderError> {
        let prompt = packet.render_prompt(guidance);
        let started = Instant::now();

        let body = serde_json::json!({
            "task_id": packet.id,
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        debug!(provider = %self.name, task_id = %packet.id, endpoint = %self.endpoint,
               "dispatching generation request");

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        secs: started.elapsed().as_secs(),
                    }
                } else if e.is_connect() {
                    ProviderError::Unavailable(format!("cannot reach {}: {}", self.endpoint, e))
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(self.classify_status(status, retry_after));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(error) = parsed.error {
            return Err(ProviderError::ExecutionFailed {
                detail: error,
                logs: parsed.response,
            });
        }

        let mut bundle = ArtifactBundle::new(packet.id, &self.name, duration_ms);
        bundle.logs = parsed.response;
        bundle.files_modified = parsed.files_modified;
        bundle.diff_summary = parsed.diff_summary;
        Ok(bundle)
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(self.health_url.clone())
            .timeout(Duration::from_secs(AVAILABILITY_PROBE_SECS))
            .send()
            .await
            .map(|r| !r.status().is_server_error())
            .unwrap_or(false)
    }

    fn detect_rate_limit(&self, err: &ProviderError) -> bool {
        match self.strategy {
            RateLimitStrategy::None => false,
            _ => err.is_definitely_provider_fault(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
