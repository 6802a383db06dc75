//! Vendor adapters.
//!
//! Responsibilities:
//! - Hide each vendor's authentication placement (header, custom header +
//!   version header, or query parameter)
//! - Build the vendor request body and endpoint
//! - Parse vendor frames into normalized chunks
//! - Classify vendor HTTP errors into the shared taxonomy
//! - Validate configs before any network contact
//!
//! Adapters never retry. Retry is the caller's call, guided by
//! `LlmuxError::is_retryable`.

mod anthropic;
mod google;
mod openai;
mod transport;

pub use anthropic::{AnthropicAdapter, AnthropicFrameParser};
pub use google::{GoogleAdapter, GoogleFrameParser};
pub use openai::{OpenAiAdapter, OpenAiFrameParser};
pub use transport::{HttpTransport, http_error};

use crate::models::{
    AvailableModelsResult, InferenceRequest, LlmuxError, ProviderConfig, ProviderKind, Result,
};
use crate::stream::{ChunkStream, FrameParser};
use crate::validation::ConfigRules;
use async_trait::async_trait;
use std::sync::Arc;

/// The capability every vendor adapter provides.
///
/// Implementations must be Send + Sync so they can be shared across request
/// tasks via Arc.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which vendor this adapter speaks to.
    fn kind(&self) -> ProviderKind;

    /// Validation rules for this vendor's configs.
    fn rules(&self) -> &ConfigRules;

    /// Frame parser for this vendor's stream format.
    fn frame_parser(&self) -> Arc<dyn FrameParser>;

    /// Check a config before any network use.
    ///
    /// B_i(config valid) → Result, always non-retryable on failure
    fn validate_config(&self, config: &ProviderConfig) -> Result<ProviderConfig> {
        if config.provider != self.kind() {
            return Err(LlmuxError::config_validation(
                "provider",
                format!(
                    "config targets {} but was given to the {} adapter",
                    config.provider,
                    self.kind()
                ),
            ));
        }

        self.rules().validate(config).map_err(|issue| {
            let field = issue.field_name().unwrap_or("config").to_string();
            LlmuxError::ConfigValidation {
                field,
                message: issue.message,
                details: issue.details,
            }
        })
    }

    /// Open the vendor stream for a request.
    ///
    /// Errors before the first byte (network, HTTP status, timeout, empty
    /// body) are returned here; later ones arrive in the stream.
    async fn send_streaming_request(&self, request: &InferenceRequest) -> Result<ChunkStream>;

    /// Model listing, cached for five minutes per credential and base URL.
    ///
    /// Never fails: a stale cache entry or the static list stands in for a
    /// failed fetch.
    async fn get_available_models(&self, api_key: &str, base_url: Option<&str>) -> AvailableModelsResult;

    /// Ping the vendor with the given credentials.
    async fn health_check(&self, config: &ProviderConfig) -> HealthCheckResult;
}

/// Maps a non-success HTTP response to an error.
pub trait ErrorClassifier: Send + Sync {
    /// # Arguments
    /// - `status`: HTTP status code
    /// - `retry_after`: parsed `retry-after` header, in seconds
    /// - `body`: raw response body (may be empty or non-JSON)
    /// - `reason`: canonical status reason, the last-resort message
    fn classify_http_error(
        &self,
        status: u16,
        retry_after: Option<f64>,
        body: &str,
        reason: &str,
    ) -> LlmuxError;
}

/// Raw error body, trimmed so a whole HTML error page is not echoed back.
pub(crate) fn body_excerpt(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(300).collect())
}

/// Health check result.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub provider: ProviderKind,
    pub status: HealthStatus,
    /// Latency in milliseconds (if reachable)
    pub latency_ms: Option<u64>,
    /// Error message (if unhealthy or unreachable)
    pub error: Option<String>,
}

/// Health status of a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Endpoint is responding normally
    Healthy,
    /// Endpoint is responding but with errors
    Unhealthy,
    /// Endpoint is not reachable
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}
