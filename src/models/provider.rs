//! Provider identity and per-request provider configuration.
//!
//! K_i: The set of vendors is closed and known at compile time.
//! B_i: A `ProviderConfig` is only trusted after `validate_config` accepted it.

use super::LlmuxError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported LLM vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI chat completions (bearer token)
    #[serde(rename = "openai")]
    OpenAi,
    /// Anthropic messages API (x-api-key + version header)
    Anthropic,
    /// Google Gemini (key query parameter)
    #[serde(alias = "gemini")]
    Google,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Google,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
        }
    }

    /// Public API base URL used when the config does not override it.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::Google => "https://generativelanguage.googleapis.com/v1beta",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = LlmuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "google" | "gemini" => Ok(ProviderKind::Google),
            other => Err(LlmuxError::ProviderNotRegistered(other.to_string())),
        }
    }
}

/// Everything an adapter needs to talk to one vendor for one request.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Which vendor this config targets
    pub provider: ProviderKind,

    /// Credential (bearer token, x-api-key, or query key depending on vendor)
    pub api_key: String,

    /// Base URL override (defaults to the vendor's public API)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Model identifier
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Maximum output tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,

    /// System message prepended to the conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
}

impl ProviderConfig {
    /// Minimal config; sampling parameters are left to the vendor defaults.
    pub fn new(provider: ProviderKind, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            base_url: None,
            model: model.into(),
            temperature: None,
            max_tokens: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            system_message: None,
        }
    }

    /// Base URL with any trailing slash removed.
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    /// Last characters of the credential, safe to log or use as a cache key.
    pub fn credential_suffix(&self) -> String {
        credential_suffix(&self.api_key)
    }
}

/// Last eight characters of a credential.
pub fn credential_suffix(api_key: &str) -> String {
    let chars: Vec<char> = api_key.chars().collect();
    let start = chars.len().saturating_sub(8);
    chars[start..].iter().collect()
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider", &self.provider)
            .field("api_key", &format_args!("…{}", self.credential_suffix()))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("top_p", &self.top_p)
            .field("frequency_penalty", &self.frequency_penalty)
            .field("presence_penalty", &self.presence_penalty)
            .field("system_message", &self.system_message)
            .finish()
    }
}
