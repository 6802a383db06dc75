//! Request, chunk and model-listing types.
//!
//! K_i: These types represent the core data flow from admission to the caller.

use super::ProviderConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An admitted inference request.
///
/// K_i: Immutable once created; the config inside has already been validated.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub id: RequestId,
    /// Fully substituted prompt text
    pub prompt: String,
    pub config: ProviderConfig,
    pub created_at: DateTime<Utc>,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>, config: ProviderConfig) -> Self {
        Self {
            id: RequestId::new(),
            prompt: prompt.into(),
            config,
            created_at: Utc::now(),
        }
    }
}

/// One normalized content delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub request_id: RequestId,
    /// Content delta (may be empty)
    pub content: String,
    /// True only on the terminal chunk
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
}

impl StreamChunk {
    /// Non-terminal content chunk.
    pub fn delta(request_id: RequestId, content: impl Into<String>) -> Self {
        Self {
            request_id,
            content: content.into(),
            is_complete: false,
            token_count: None,
        }
    }

    /// Terminal chunk with empty content.
    pub fn terminal(request_id: RequestId, token_count: Option<u32>) -> Self {
        Self {
            request_id,
            content: String::new(),
            is_complete: true,
            token_count,
        }
    }
}

/// One model offered by a vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            context_window: None,
        }
    }
}

/// Model listing handed to model-selection callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableModelsResult {
    pub models: Vec<ModelInfo>,
    /// True when served from the cache (fresh or stale)
    pub cached: bool,
    /// When the listed models were fetched
    pub fetched_at: DateTime<Utc>,
}
