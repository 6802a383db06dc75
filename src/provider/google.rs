//! Google Gemini adapter.
//!
//! Epistemic foundation:
//! - K_i: The key travels as the `key` query parameter, never in a header
//! - K_i: A frame carrying `finishReason` is the last one
//! - B_i: Only the listed models are served on this API surface

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

static CREDENTIAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^AIza[0-9A-Za-z_\-]{35}$").expect("static regex"));

/// Models accepted by config validation, with their input windows.
const SUPPORTED_MODELS: &[(&str, &str, u32)] = &[
    ("gemini-2.5-pro", "Gemini 2.5 Pro", 1_048_576),
    ("gemini-2.5-flash", "Gemini 2.5 Flash", 1_048_576),
    ("gemini-2.5-flash-lite", "Gemini 2.5 Flash-Lite", 1_048_576),
    ("gemini-2.0-flash", "Gemini 2.0 Flash", 1_048_576),
    ("gemini-2.0-flash-lite", "Gemini 2.0 Flash-Lite", 1_048_576),
    ("gemini-1.5-pro", "Gemini 1.5 Pro", 2_097_152),
    ("gemini-1.5-flash", "Gemini 1.5 Flash", 1_048_576),
];

/// Ids from `SUPPORTED_MODELS`, the allow-list used by config validation.
static ALLOWED_MODELS: LazyLock<Vec<&'static str>> =
    LazyLock::new(|| SUPPORTED_MODELS.iter().map(|(id, _, _)| *id).collect());

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
}

/// `streamGenerateContent` request payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    generation_config: GenerationConfig,
}

impl<'a> GenerateContentRequest<'a> {
    fn from_request(request: &'a InferenceRequest) -> Self {
        let config = &request.config;
        Self {
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part {
                    text: &request.prompt,
                }],
            }],
            system_instruction: config
                .system_message
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(|text| Content {
                    role: None,
                    parts: vec![Part { text }],
                }),
            generation_config: GenerationConfig {
                temperature: config.temperature,
                top_p: config.top_p,
                max_output_tokens: config.max_tokens,
                frequency_penalty: config.frequency_penalty,
                presence_penalty: config.presence_penalty,
            },
        }
    }
}

/// One streamed `GenerateContentResponse`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateFrame {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    error: Option<VendorError>,
}

impl Schema for GenerateFrame {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize)]
struct VendorError {
    code: Option<u16>,
    message: String,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: VendorError,
}

impl Schema for ErrorEnvelope {}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    name: String,
    display_name: Option<String>,
    input_token_limit: Option<u32>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

impl Schema for ModelList {}

// ============================================================================
// Frame parser
// ============================================================================

/// Parses Gemini SSE frames (`alt=sse`).
#[derive(Debug, Default, Clone, Copy)]
pub struct GoogleFrameParser;

impl FrameParser for GoogleFrameParser {
    fn parse_frame(&self, frame: &SseFrame) -> FrameOutcome {
        let parsed = match validate_json::<GenerateFrame>(&frame.data) {
            Ok(parsed) => parsed,
            Err(issue) => {
                debug!(provider = "google", code = %issue.code, error = %issue.message, "Skipping frame");
                return FrameOutcome::Skip;
            }
        };

        if let Some(error) = parsed.error {
            return FrameOutcome::Failed {
                status: error.code.unwrap_or(500),
                message: error.message,
            };
        }

        let token_count = parsed
            .usage_metadata
            .and_then(|u| u.candidates_token_count);
        let Some(candidate) = parsed.candidates.into_iter().next() else {
            return token_count.map_or(FrameOutcome::Skip, FrameOutcome::Usage);
        };

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if candidate.finish_reason.is_some() {
            return FrameOutcome::End {
                content: Some(text).filter(|t| !t.is_empty()),
                token_count,
            };
        }

        match (text.is_empty(), token_count) {
            (false, token_count) => FrameOutcome::Delta {
                content: text,
                token_count,
            },
            (true, Some(tokens)) => FrameOutcome::Usage(tokens),
            (true, None) => FrameOutcome::Skip,
        }
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Adapter for the Gemini `generativelanguage` API.
pub struct GoogleAdapter {
    transport: Arc<HttpTransport>,
    models: Arc<ModelCache>,
    rules: ConfigRules,
}

impl GoogleAdapter {
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
            credential_hint: "a Google API key (AIza...)",
            max_output_tokens: 8192,
            temperature: (0.0, 2.0),
            top_p: (0.0, 1.0),
            penalty: (-2.0, 2.0),
            models: ModelPolicy::AllowList(ALLOWED_MODELS.as_slice()),
        }
    }

    pub fn fallback_models() -> Vec<ModelInfo> {
        SUPPORTED_MODELS
            .iter()
            .map(|(id, name, window)| ModelInfo {
                id: id.to_string(),
                display_name: Some(name.to_string()),
                context_window: Some(*window),
            })
            .collect()
    }

    async fn fetch_models(&self, api_key: &str, base_url: &str) -> Result<Vec<ModelInfo>> {
        let request = self
            .transport
            .get(&format!("{base_url}/models"))
            .query(&[("key", api_key)]);
        let value = self.transport.get_json(self.kind(), request, self).await?;
        let list: ModelList = validate_value(value)
            .map_err(|issue| LlmuxError::Parsing(format!("model list: {issue}")))?;

        Ok(list
            .models
            .into_iter()
            .filter(|m| {
                m.supported_generation_methods
                    .iter()
                    .any(|method| method == "generateContent")
            })
            .map(|m| ModelInfo {
                id: m
                    .name
                    .strip_prefix("models/")
                    .unwrap_or(&m.name)
                    .to_string(),
                display_name: m.display_name,
                context_window: m.input_token_limit,
            })
            .collect())
    }
}

impl ErrorClassifier for GoogleAdapter {
    fn classify_http_error(
        &self,
        status: u16,
        retry_after: Option<f64>,
        body: &str,
        reason: &str,
    ) -> LlmuxError {
        // error bodies may arrive as a one-element array
        let body = body.trim();
        let unwrapped = match serde_json::from_str::<Vec<serde_json::Value>>(body) {
            Ok(mut items) if items.len() == 1 => items.remove(0).to_string(),
            _ => body.to_string(),
        };

        match validate_json::<ErrorEnvelope>(&unwrapped) {
            Ok(envelope) => {
                let details = serde_json::to_value(&envelope.error).ok();
                http_error(status, Some(envelope.error.message), retry_after, details, reason)
            }
            Err(_) => http_error(status, body_excerpt(body), retry_after, None, reason),
        }
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn rules(&self) -> &ConfigRules {
        &self.rules
    }

    fn frame_parser(&self) -> Arc<dyn FrameParser> {
        Arc::new(GoogleFrameParser)
    }

    async fn send_streaming_request(&self, request: &InferenceRequest) -> Result<ChunkStream> {
        let config = self.validate_config(&request.config)?;
        let url = format!(
            "{}/models/{}:streamGenerateContent",
            config.effective_base_url(),
            config.model
        );

        debug!(
            provider = %self.kind(),
            request_id = %request.id,
            model = %config.model,
            "Opening stream"
        );

        let builder = self
            .transport
            .post(&url)
            .query(&[("alt", "sse"), ("key", config.api_key.as_str())])
            .json(&GenerateContentRequest::from_request(request));
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
        let request = self
            .transport
            .get(&format!("{}/models", config.effective_base_url()))
            .query(&[("key", config.api_key.as_str())]);
        self.transport.ping(self.kind(), request).await
    }
}
