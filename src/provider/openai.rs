//! OpenAI chat completions adapter.
//!
//! Epistemic foundation:
//! - K_i: Auth is `Authorization: Bearer <key>`
//! - K_i: Stream ends with the literal `data: [DONE]`
//! - B_i: Usage arrives in a final choice-less frame (only when requested)
//! - I^B: New model names appear without notice → prefix pass-through

use super::{ErrorClassifier, HealthCheckResult, HttpTransport, ProviderAdapter, body_excerpt, http_error};
use crate::client::{ModelCache, ModelCacheKey};
use crate::models::{
    AvailableModelsResult, InferenceRequest, LlmuxError, ModelInfo, ProviderConfig, ProviderKind,
    Result,
};
use crate::stream::{ChunkStream, FrameOutcome, FrameParser, SseFrame, StreamProcessor};
use crate::validation::{
    ConfigRules, IssueCode, ModelPolicy, Schema, ValidationIssue, validate_json, validate_value,
};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Literal end-of-stream token.
const DONE_SENTINEL: &str = "[DONE]";

static CREDENTIAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sk-[A-Za-z0-9_\-]{20,}$").expect("static regex"));

const MODEL_PREFIXES: &[&str] = &["gpt-", "o1", "o3", "o4", "chatgpt-"];

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// Chat completion request payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
}

impl<'a> ChatCompletionRequest<'a> {
    fn from_request(request: &'a InferenceRequest) -> Self {
        let config = &request.config;
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = config.system_message.as_deref().filter(|s| !s.is_empty()) {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        Self {
            model: &config.model,
            messages,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: config.top_p,
            frequency_penalty: config.frequency_penalty,
            presence_penalty: config.presence_penalty,
        }
    }
}

/// One streamed `chat.completion.chunk`.
#[derive(Debug, Deserialize)]
struct CompletionFrame {
    #[serde(default)]
    choices: Vec<FrameChoice>,
    usage: Option<FrameUsage>,
    error: Option<VendorError>,
}

#[derive(Debug, Deserialize)]
struct FrameChoice {
    #[serde(default)]
    delta: FrameDelta,
}

#[derive(Debug, Default, Deserialize)]
struct FrameDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FrameUsage {
    completion_tokens: u32,
}

impl Schema for CompletionFrame {
    fn check(&self) -> std::result::Result<(), ValidationIssue> {
        if self.choices.is_empty() && self.usage.is_none() && self.error.is_none() {
            return Err(ValidationIssue::new(
                IssueCode::ConstraintViolation,
                "frame carries neither choices, usage nor error",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct VendorError {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: VendorError,
}

impl Schema for ErrorEnvelope {}

impl VendorError {
    /// HTTP status the error would have carried outside a stream.
    ///
    /// `code` is more specific than `type` when both are present.
    fn status(&self) -> u16 {
        let code = self.code.as_ref().and_then(|c| c.as_str());
        code.into_iter()
            .chain(self.kind.as_deref())
            .find_map(status_for_error_type)
            .unwrap_or(500)
    }
}

fn status_for_error_type(kind: &str) -> Option<u16> {
    let status = match kind {
        "invalid_request_error" | "context_length_exceeded" | "invalid_api_key_format" => 400,
        "authentication_error" | "invalid_api_key" => 401,
        "permission_error" => 403,
        "not_found_error" | "model_not_found" => 404,
        "rate_limit_exceeded" | "insufficient_quota" | "requests" | "tokens" => 429,
        "server_error" => 500,
        _ => return None,
    };
    Some(status)
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl Schema for ModelList {}

// ============================================================================
// Frame parser
// ============================================================================

/// Parses OpenAI `chat.completion.chunk` frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAiFrameParser;

impl FrameParser for OpenAiFrameParser {
    fn parse_frame(&self, frame: &SseFrame) -> FrameOutcome {
        let data = frame.data.trim();
        if data == DONE_SENTINEL {
            return FrameOutcome::end();
        }

        let parsed = match validate_json::<CompletionFrame>(data) {
            Ok(parsed) => parsed,
            Err(issue) => {
                debug!(provider = "openai", code = %issue.code, error = %issue.message, "Skipping frame");
                return FrameOutcome::Skip;
            }
        };

        if let Some(error) = parsed.error {
            return FrameOutcome::Failed {
                status: error.status(),
                message: error.message,
            };
        }

        let token_count = parsed.usage.map(|u| u.completion_tokens);
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|c| !c.is_empty());

        match (content, token_count) {
            (Some(content), token_count) => FrameOutcome::Delta {
                content,
                token_count,
            },
            (None, Some(tokens)) => FrameOutcome::Usage(tokens),
            (None, None) => FrameOutcome::Skip,
        }
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Adapter for the OpenAI chat completions API.
pub struct OpenAiAdapter {
    transport: Arc<HttpTransport>,
    models: Arc<ModelCache>,
    rules: ConfigRules,
}

impl OpenAiAdapter {
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
            credential_hint: "an OpenAI key (sk-...)",
            max_output_tokens: 16_384,
            temperature: (0.0, 2.0),
            top_p: (0.0, 1.0),
            penalty: (-2.0, 2.0),
            models: ModelPolicy::PassThrough {
                prefixes: MODEL_PREFIXES,
            },
        }
    }

    /// Static list used when no model list was ever fetched.
    pub fn fallback_models() -> Vec<ModelInfo> {
        [
            ("gpt-4o", "GPT-4o", 128_000),
            ("gpt-4o-mini", "GPT-4o mini", 128_000),
            ("gpt-4.1", "GPT-4.1", 1_047_576),
            ("gpt-4.1-mini", "GPT-4.1 mini", 1_047_576),
            ("o3-mini", "o3-mini", 200_000),
        ]
        .into_iter()
        .map(|(id, name, window)| ModelInfo {
            id: id.to_string(),
            display_name: Some(name.to_string()),
            context_window: Some(window),
        })
        .collect()
    }

    async fn fetch_models(&self, api_key: &str, base_url: &str) -> Result<Vec<ModelInfo>> {
        let request = self
            .transport
            .get(&format!("{base_url}/models"))
            .bearer_auth(api_key);
        let value = self.transport.get_json(self.kind(), request, self).await?;
        let list: ModelList = validate_value(value)
            .map_err(|issue| LlmuxError::Parsing(format!("model list: {issue}")))?;

        let mut models: Vec<ModelInfo> = list
            .data
            .into_iter()
            .filter(|m| self.rules.models.accepts(&m.id))
            .map(|m| ModelInfo::new(m.id))
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }
}

impl ErrorClassifier for OpenAiAdapter {
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
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn rules(&self) -> &ConfigRules {
        &self.rules
    }

    fn frame_parser(&self) -> Arc<dyn FrameParser> {
        Arc::new(OpenAiFrameParser)
    }

    async fn send_streaming_request(&self, request: &InferenceRequest) -> Result<ChunkStream> {
        let config = self.validate_config(&request.config)?;
        let url = format!("{}/chat/completions", config.effective_base_url());

        debug!(
            provider = %self.kind(),
            request_id = %request.id,
            model = %config.model,
            "Opening stream"
        );

        let builder = self
            .transport
            .post(&url)
            .bearer_auth(&config.api_key)
            .json(&ChatCompletionRequest::from_request(request));
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
            .bearer_auth(&config.api_key);
        self.transport.ping(self.kind(), request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RequestId;

    fn parse(data: &str) -> FrameOutcome {
        OpenAiFrameParser.parse_frame(&SseFrame::data(data))
    }

    #[test]
    fn test_content_delta() {
        let outcome = parse(r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#);
        assert_eq!(outcome, FrameOutcome::delta("Hi"));
    }

    #[test]
    fn test_done_sentinel_ends_stream() {
        assert_eq!(parse("[DONE]"), FrameOutcome::end());
    }

    #[test]
    fn test_role_only_delta_is_skipped() {
        let outcome = parse(r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#);
        assert_eq!(outcome, FrameOutcome::Skip);
    }

    #[test]
    fn test_usage_only_frame() {
        let outcome = parse(r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":12,"total_tokens":15}}"#);
        assert_eq!(outcome, FrameOutcome::Usage(12));
    }

    #[test]
    fn test_malformed_and_empty_frames_are_skipped() {
        assert_eq!(parse("{not json"), FrameOutcome::Skip);
        assert_eq!(parse(r#"{"id":"chatcmpl-1"}"#), FrameOutcome::Skip);
        assert_eq!(parse(r#"{"choices":"nope"}"#), FrameOutcome::Skip);
    }

    #[test]
    fn test_error_frame_fails_stream() {
        let outcome = parse(r#"{"error":{"message":"server overloaded","type":"server_error"}}"#);
        assert_eq!(
            outcome,
            FrameOutcome::Failed {
                status: 500,
                message: "server overloaded".into()
            }
        );
    }

    #[test]
    fn test_error_frame_status_follows_error_type() {
        let outcome = parse(
            r#"{"error":{"message":"max_tokens is too large","type":"invalid_request_error","code":null}}"#,
        );
        let FrameOutcome::Failed { status, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(status, 400);
        assert!(!crate::models::is_retryable_status(status));

        let outcome = parse(
            r#"{"error":{"message":"slow down","type":"requests","code":"rate_limit_exceeded"}}"#,
        );
        assert!(matches!(outcome, FrameOutcome::Failed { status: 429, .. }));

        let outcome = parse(r#"{"error":{"message":"boom","type":"something_new"}}"#);
        assert!(matches!(outcome, FrameOutcome::Failed { status: 500, .. }));
    }

    #[test]
    fn test_request_body_shape() {
        let mut config = ProviderConfig::new(ProviderKind::OpenAi, "sk-test", "gpt-4o-mini");
        config.system_message = Some("Be brief".into());
        config.temperature = Some(0.2);
        let request = InferenceRequest {
            id: RequestId::from("r"),
            prompt: "Hello".into(),
            config,
            created_at: chrono::Utc::now(),
        };

        let body = serde_json::to_value(ChatCompletionRequest::from_request(&request)).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hello");
        assert_eq!(body["temperature"], 0.2);
        assert!(body.get("max_tokens").is_none());
    }

    fn adapter() -> OpenAiAdapter {
        let transport = Arc::new(HttpTransport::new(std::time::Duration::from_secs(5)).unwrap());
        OpenAiAdapter::new(transport, Arc::new(ModelCache::new()))
    }

    #[test]
    fn test_classify_vendor_error_body() {
        let err = adapter().classify_http_error(
            429,
            Some(2.0),
            r#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"}}"#,
            "Too Many Requests",
        );
        assert_eq!(err.code(), "HTTPError_429");
        assert_eq!(err.retry_after(), Some(2.0));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("Rate limit reached"));
    }

    #[test]
    fn test_classify_non_json_body_falls_back() {
        let a = adapter();
        let err = a.classify_http_error(502, None, "<html>bad gateway</html>", "Bad Gateway");
        assert!(err.to_string().contains("<html>bad gateway</html>"));

        let err = a.classify_http_error(401, None, "", "Unauthorized");
        assert!(err.to_string().contains("Unauthorized"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validate_config_rejects_wrong_provider_and_bad_key() {
        let a = adapter();
        let config = ProviderConfig::new(ProviderKind::Anthropic, "sk-abcdefghijklmnopqrstuvwx", "gpt-4o");
        assert!(matches!(
            a.validate_config(&config),
            Err(LlmuxError::ConfigValidation { ref field, .. }) if field == "provider"
        ));

        let config = ProviderConfig::new(ProviderKind::OpenAi, "not-a-key", "gpt-4o");
        let err = a.validate_config(&config).unwrap_err();
        assert_eq!(err.code(), "ConfigValidationError");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validate_config_model_pass_through() {
        let a = adapter();
        let key = "sk-abcdefghijklmnopqrstuvwx";
        assert!(a.validate_config(&ProviderConfig::new(ProviderKind::OpenAi, key, "gpt-5-preview")).is_ok());
        assert!(a.validate_config(&ProviderConfig::new(ProviderKind::OpenAi, key, "claude-3")).is_err());

        let mut config = ProviderConfig::new(ProviderKind::OpenAi, key, "gpt-4o");
        config.max_tokens = Some(20_000);
        assert!(a.validate_config(&config).is_err());
    }
}
