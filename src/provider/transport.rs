//! Shared HTTP transport for all vendor adapters.
//!
//! Epistemic foundation:
//! - K_i: Every vendor speaks HTTPS + JSON, streaming over SSE
//! - B_i: API will respond within timeout (might fail)
//! - B_i: Error bodies carry a vendor message (might not)
//! - I^B: Network availability unknowable → surfaced as retryable errors,
//!   never retried here

use super::{ErrorClassifier, HealthCheckResult, HealthStatus};
use crate::models::{LlmuxError, ProviderKind, Result};
use crate::stream::ByteStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use std::time::{Duration, Instant};
use tracing::debug;

/// HTTP client with the per-call wall-clock timeout baked in.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    /// Overall timeout per call, body included
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport.
    ///
    /// # Arguments
    /// - `timeout`: overall per-call timeout (connect, headers and body)
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmuxError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, timeout })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST builder with the JSON content type set.
    pub fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.get(url)
    }

    /// Send a streaming request and hand back its body.
    ///
    /// Non-success statuses are classified by the adapter; a success with an
    /// empty body is `NoResponseBody`.
    pub async fn open_stream(
        &self,
        provider: ProviderKind,
        request: reqwest::RequestBuilder,
        classifier: &dyn ErrorClassifier,
    ) -> Result<ByteStream> {
        let request = request.header(ACCEPT, HeaderValue::from_static("text/event-stream"));
        let response = self.send(provider, request, classifier).await?;

        if response.content_length() == Some(0) {
            return Err(LlmuxError::NoResponseBody);
        }

        let timeout = self.timeout;
        let body = response
            .bytes_stream()
            .map(move |segment| segment.map_err(|e| LlmuxError::from_transport(&e, timeout)));
        Ok(Box::pin(body))
    }

    /// Send a request and decode a JSON response.
    pub async fn get_json(
        &self,
        provider: ProviderKind,
        request: reqwest::RequestBuilder,
        classifier: &dyn ErrorClassifier,
    ) -> Result<serde_json::Value> {
        let response = self.send(provider, request, classifier).await?;
        let timeout = self.timeout;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| LlmuxError::from_transport(&e, timeout))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| LlmuxError::Parsing(format!("Failed to parse response: {e}")))
    }

    async fn send(
        &self,
        provider: ProviderKind,
        request: reqwest::RequestBuilder,
        classifier: &dyn ErrorClassifier,
    ) -> Result<reqwest::Response> {
        let start = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| LlmuxError::from_transport(&e, self.timeout))?;

        let status = response.status().as_u16();
        debug!(
            provider = %provider,
            status = status,
            latency_ms = start.elapsed().as_millis() as u64,
            "Response headers received"
        );

        if response.status().is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<f64>().ok());
        let reason = response
            .status()
            .canonical_reason()
            .unwrap_or("unknown status")
            .to_string();
        let body = response.text().await.unwrap_or_default();

        Err(classifier.classify_http_error(status, retry_after, &body, &reason))
    }

    /// Health check: send a cheap authenticated GET.
    ///
    /// K_i: endpoint is reachable and responding
    /// B_i: endpoint is healthy if it returns 2xx
    pub async fn ping(&self, provider: ProviderKind, request: reqwest::RequestBuilder) -> HealthCheckResult {
        let start = Instant::now();

        match request.timeout(Duration::from_secs(10)).send().await {
            Ok(response) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                if response.status().is_success() {
                    HealthCheckResult {
                        provider,
                        status: HealthStatus::Healthy,
                        latency_ms: Some(latency_ms),
                        error: None,
                    }
                } else {
                    HealthCheckResult {
                        provider,
                        status: HealthStatus::Unhealthy,
                        latency_ms: Some(latency_ms),
                        error: Some(format!("HTTP {}", response.status().as_u16())),
                    }
                }
            }
            Err(e) => HealthCheckResult {
                provider,
                status: HealthStatus::Unreachable,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Build an `Http` error from a status and an optional vendor message.
pub fn http_error(
    status: u16,
    message: Option<String>,
    retry_after: Option<f64>,
    details: Option<serde_json::Value>,
    reason: &str,
) -> LlmuxError {
    LlmuxError::Http {
        status,
        message: message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| reason.to_string()),
        retry_after_secs: retry_after,
        details,
    }
}
