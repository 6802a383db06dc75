//! Error types for llmux.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (invalid config, unknown provider)
//! - I^B materialized: Infrastructure failures (network, timeout, HTTP status)
//! - K_i violated: Internal invariant violations (bugs)

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for llmux.
#[derive(Debug, Error)]
pub enum LlmuxError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Invalid configuration ({field}): {message}")]
    ConfigValidation {
        field: String,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("Provider not registered: {0}")]
    ProviderNotRegistered(String),

    #[error("Settings error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Parse error: {0}")]
    Parsing(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after_secs: Option<f64>,
        details: Option<serde_json::Value>,
    },

    #[error("Response has no readable body")]
    NoResponseBody,

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LlmuxError {
    /// Create a config validation error for a single field.
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Map a transport failure onto the taxonomy.
    ///
    /// reqwest reports the client-wide timeout as a regular error, so it has
    /// to be pulled out here to stay retryable as `TimeoutError`.
    pub fn from_transport(err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else {
            Self::Network(err.to_string())
        }
    }

    /// Provider-neutral error code.
    pub fn code(&self) -> String {
        match self {
            Self::ConfigValidation { .. } => "ConfigValidationError".to_string(),
            Self::ProviderNotRegistered(_) => "ProviderNotRegistered".to_string(),
            Self::Config(_) => "ConfigError".to_string(),
            Self::Parsing(_) => "ParsingError".to_string(),
            Self::Network(_) => "NetworkError".to_string(),
            Self::Timeout(_) => "TimeoutError".to_string(),
            Self::Http { status, .. } => format!("HTTPError_{status}"),
            Self::NoResponseBody => "NoResponseBody".to_string(),
            Self::Internal(_) => "InternalError".to_string(),
        }
    }

    /// HTTP status, if the error came from one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// Whether this error is an upstream throttling signal.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Http { status: 429, .. })
    }

    /// Get retry delay hint in seconds, if applicable.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::Http {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }

    /// Convert into the provider-neutral shape handed to callers.
    pub fn normalize(&self) -> NormalizedError {
        let details = match self {
            Self::ConfigValidation { details, .. } | Self::Http { details, .. } => details.clone(),
            _ => None,
        };
        let message = match self {
            Self::Http { message, .. } => message.clone(),
            other => other.to_string(),
        };

        NormalizedError {
            code: self.code(),
            message,
            retryable: self.is_retryable(),
            status: self.status(),
            details,
        }
    }
}

/// 5xx, 429 and 408 are worth another attempt; everything else is final.
pub fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

/// Provider-neutral error as seen by callers.
///
/// K_i: Never carries vendor-specific codes; `details` is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<LlmuxError> for NormalizedError {
    fn from(err: LlmuxError) -> Self {
        err.normalize()
    }
}

impl std::fmt::Display for NormalizedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Result type alias for llmux.
pub type Result<T> = std::result::Result<T, LlmuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> LlmuxError {
        LlmuxError::Http {
            status,
            message: "boom".to_string(),
            retry_after_secs: None,
            details: None,
        }
    }

    #[test]
    fn test_http_retryability_follows_status() {
        assert!(http(500).is_retryable());
        assert!(http(503).is_retryable());
        assert!(http(429).is_retryable());
        assert!(http(408).is_retryable());
        assert!(!http(400).is_retryable());
        assert!(!http(401).is_retryable());
        assert!(!http(404).is_retryable());
    }

    #[test]
    fn test_codes() {
        assert_eq!(http(429).code(), "HTTPError_429");
        assert_eq!(
            LlmuxError::config_validation("model", "empty").code(),
            "ConfigValidationError"
        );
        assert_eq!(LlmuxError::NoResponseBody.code(), "NoResponseBody");
        assert_eq!(
            LlmuxError::Timeout(Duration::from_secs(30)).code(),
            "TimeoutError"
        );
    }

    #[test]
    fn test_non_retryable_kinds() {
        assert!(!LlmuxError::config_validation("api_key", "bad").is_retryable());
        assert!(!LlmuxError::ProviderNotRegistered("x".into()).is_retryable());
        assert!(!LlmuxError::Parsing("bad frame".into()).is_retryable());
        assert!(!LlmuxError::NoResponseBody.is_retryable());
        assert!(LlmuxError::Network("reset".into()).is_retryable());
    }

    #[test]
    fn test_normalize_keeps_vendor_message_and_status() {
        let err = LlmuxError::Http {
            status: 503,
            message: "overloaded".to_string(),
            retry_after_secs: Some(2.0),
            details: Some(serde_json::json!({"type": "overloaded_error"})),
        };
        let normalized = err.normalize();
        assert_eq!(normalized.code, "HTTPError_503");
        assert_eq!(normalized.message, "overloaded");
        assert!(normalized.retryable);
        assert_eq!(normalized.status, Some(503));
        assert!(normalized.details.is_some());
        assert_eq!(err.retry_after(), Some(2.0));
    }
}
