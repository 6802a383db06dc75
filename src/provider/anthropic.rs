//! Anthropic messages adapter.
//!
//! Epistemic foundation:
//! - K_i: Auth is `x-api-key` plus a pinned `anthropic-version` header
//! - K_i: Frames are typed (`event:` line + `type` field); `message_stop` ends
//! - B_i: `message_start` carries no content but opens the response
//! - I^B: Unknown event types may appear → dropped, never fatal

use super::{ErrorClassifier, HealthCheckResult, HttpTransport, ProviderAdapter, body_excerpt, http_error};
use crate::client::{ModelCache, ModelCacheKey};
use crate::models::{
    AvailableModelsResult, InferenceRequest, LlmuxError, ModelInfo, ProviderConfig, ProviderKind,
    Result,
};
use crate::stream::{ChunkStream, FrameOutcome, FrameParser, SseFrame, StreamProcessor};
use crate::validation::{ConfigRules, ModelPolicy, Schema, validate_json, validate_value};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Pinned API version header value.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Sent when the config leaves `max_tokens` unset; the API requires one.
const DEFAULT_MAX_TOKENS: u32 = 4096;

const STOP_EVENT: &str = "message_stop";

static CREDENTIAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sk-ant-[A-Za-z0-9_\-]{20,}$").expect("static regex"));

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

/// Messages API request payload.
///
/// Frequency and presence penalties have no Anthropic equivalent and are
/// not sent.
#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

impl<'a> MessagesRequest<'a> {
    fn from_request(request: &'a InferenceRequest) -> Self {
        let config = &request.config;
        Self {
            model: &config.model,
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
            stream: true,
            system: config.system_message.as_deref().filter(|s| !s.is_empty()),
            temperature: config.temperature,
            top_p: config.top_p,
        }
    }
}

/// Streamed event, discriminated by its `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageDelta {
        usage: Option<OutputUsage>,
    },
    MessageStop {},
    Error {
        error: VendorError,
    },
    #[serde(other)]
    Unknown,
}

impl Schema for StreamEvent {}

#[derive(Debug, Deserialize)]
struct StartMessage {
    usage: Option<OutputUsage>,
}

#[derive(Debug, Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, Serialize)]
struct VendorError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: VendorError,
}

impl Schema for ErrorEnvelope {}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    display_name: Option<String>,
}

impl Schema for ModelList {}

/// HTTP status equivalent of an in-stream error type.
fn status_for_error_type(kind: &str) -> u16 {
    match kind {
        "invalid_request_error" => 400,
        "authentication_error" => 401,
        "permission_error" => 403,
        "not_found_error" => 404,
        "request_too_large" => 413,
        "rate_limit_error" => 429,
        "overloaded_error" => 529,
        _ => 500,
    }
}

// ============================================================================
// Frame parser
// ============================================================================

/// Parses Anthropic typed stream events.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnthropicFrameParser;

impl FrameParser for AnthropicFrameParser {
    fn parse_frame(&self, frame: &SseFrame) -> FrameOutcome {
        if frame.event.as_deref() == Some(STOP_EVENT) {
            return FrameOutcome::end();
        }

        let event = match validate_json::<StreamEvent>(&frame.data) {
            Ok(event) => event,
            Err(issue) => {
                debug!(provider = "anthropic", code = %issue.code, error = %issue.message, "Skipping frame");
                return FrameOutcome::Skip;
            }
        };

        match event {
            // opens the response; surfaced as an empty chunk
            StreamEvent::MessageStart { message } => FrameOutcome::Delta {
                content: String::new(),
                token_count: message.usage.map(|u| u.output_tokens),
            },
            StreamEvent::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
            } => FrameOutcome::delta(text),
            StreamEvent::ContentBlockDelta {
                delta: BlockDelta::Other,
            } => FrameOutcome::Skip,
            StreamEvent::MessageDelta { usage: Some(usage) } => {
                FrameOutcome::Usage(usage.output_tokens)
            }
            StreamEvent::MessageDelta { usage: None } => FrameOutcome::Skip,
            StreamEvent::MessageStop {} => FrameOutcome::end(),
            StreamEvent::Error { error } => FrameOutcome::Failed {
                status: status_for_error_type(&error.kind),
                message: error.message,
            },
            StreamEvent::Unknown => FrameOutcome::Skip,
        }
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Adapter for the Anthropic messages API.
pub struct AnthropicAdapter {
    transport: Arc<HttpTransport>,
    models: Arc<ModelCache>,
    rules: ConfigRules,
}

impl AnthropicAdapter {
    pub fn new(transport: Arc<HttpTransport>, models: Arc<ModelCache>) -> Self {
        Self {
            transport,
            models,
            rules: Self::default_rules(),
        }
    }

    pub fn default_rules() -> ConfigRules {
        ConfigRules {
            credential_pattern: CREDENTIAL_RE.clone(),
            credential_hint: "an Anthropic key (sk-ant-...)",
            max_output_tokens: 64_000,
            temperature: (0.0, 1.0),
            top_p: (0.0, 1.0),
            penalty: (-2.0, 2.0),
            models: ModelPolicy::PassThrough {
                prefixes: &["claude-"],
            },
        }
    }

    pub fn fallback_models() -> Vec<ModelInfo> {
        [
            ("claude-opus-4-1", "Claude Opus 4.1"),
            ("claude-sonnet-4-5", "Claude Sonnet 4.5"),
            ("claude-3-7-sonnet-latest", "Claude Sonnet 3.7"),
            ("claude-3-5-haiku-latest", "Claude Haiku 3.5"),
        ]
        .into_iter()
        .map(|(id, name)| ModelInfo {
            id: id.to_string(),
            display_name: Some(name.to_string()),
            context_window: Some(200_000),
        })
        .collect()
    }

    fn authorize(&self, builder: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    async fn fetch_models(&self, api_key: &str, base_url: &str) -> Result<Vec<ModelInfo>> {
        let request = self.authorize(self.transport.get(&format!("{base_url}/models")), api_key);
        let value = self.transport.get_json(self.kind(), request, self).await?;
        let list: ModelList = validate_value(value)
            .map_err(|issue| LlmuxError::Parsing(format!("model list: {issue}")))?;

        Ok(list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                display_name: m.display_name,
                context_window: Some(200_000),
            })
            .collect())
    }
}

impl ErrorClassifier for AnthropicAdapter {
    fn classify_http_error(
        &self,
        status: u16,
        retry_after: Option<f64>,
        body: &str,
        reason: &str,
    ) -> LlmuxError {
        match validate_json::<ErrorEnvelope>(body) {
            Ok(envelope) => {
                let details = serde_json::to_value(&envelope.error).ok();
                http_error(status, Some(envelope.error.message), retry_after, details, reason)
            }
            Err(_) => http_error(status, body_excerpt(body), retry_after, None, reason),
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn rules(&self) -> &ConfigRules {
        &self.rules
    }

    fn frame_parser(&self) -> Arc<dyn FrameParser> {
        Arc::new(AnthropicFrameParser)
    }

    async fn send_streaming_request(&self, request: &InferenceRequest) -> Result<ChunkStream> {
        let config = self.validate_config(&request.config)?;
        let url = format!("{}/messages", config.effective_base_url());

        debug!(
            provider = %self.kind(),
            request_id = %request.id,
            model = %config.model,
            "Opening stream"
        );

        let builder = self
            .authorize(self.transport.post(&url), &config.api_key)
            .json(&MessagesRequest::from_request(request));
        let body = self.transport.open_stream(self.kind(), builder, self).await?;

        Ok(StreamProcessor::new(self.frame_parser()).process(request.id.clone(), body))
    }

    async fn get_available_models(&self, api_key: &str, base_url: Option<&str>) -> AvailableModelsResult {
        let base_url = base_url
            .unwrap_or(self.kind().default_base_url())
            .trim_end_matches('/');
        let key = ModelCacheKey::new(self.kind(), api_key, base_url);
        self.models
            .get_or_fetch(key, self.fetch_models(api_key, base_url), Self::fallback_models)
            .await
    }

    async fn health_check(&self, config: &ProviderConfig) -> HealthCheckResult {
        let url = format!("{}/models", config.effective_base_url());
        let request = self.authorize(self.transport.get(&url), &config.api_key);
        self.transport.ping(self.kind(), request).await
    }
}
