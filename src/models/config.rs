//! Settings file for llmux.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use super::{ProviderConfig, ProviderKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Top-level settings for llmux.
///
/// I^R resolved: All configurable parameters are explicit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP transport settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Per-provider connection settings, keyed by provider name
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,

    /// Per-provider rate limit overrides, merged over provider defaults
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitOverrides>,
}

/// HTTP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Overall wall-clock timeout per call, in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
        }
    }
}

/// Connection and sampling defaults for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// API key; may contain ${ENV_VAR} placeholders
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Base URL override
    #[serde(default)]
    pub base_url: Option<String>,

    /// Default model
    pub model: String,

    #[serde(default)]
    pub temperature: Option<f64>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub top_p: Option<f64>,

    #[serde(default)]
    pub frequency_penalty: Option<f64>,

    #[serde(default)]
    pub presence_penalty: Option<f64>,

    #[serde(default)]
    pub system_message: Option<String>,
}

/// Caller overrides for a provider's rate limits.
///
/// Unset fields keep the provider default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitOverrides {
    #[serde(default)]
    pub max_requests_per_minute: Option<u32>,
    #[serde(default)]
    pub max_concurrent_requests: Option<u32>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
}

impl Settings {
    /// Load settings from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml_str(&content).map_err(|source| match source {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source: e,
        })
    }

    /// Per-call timeout.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http.timeout_secs)
    }

    /// Providers that have a settings entry, in name order.
    ///
    /// Entries whose name is not a known provider are skipped here and
    /// reported by [`Settings::unknown_providers`].
    pub fn configured_providers(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self
            .providers
            .keys()
            .filter_map(|name| name.parse().ok())
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    /// Section names under [providers] or [rate_limits] that name no known provider.
    pub fn unknown_providers(&self) -> Vec<String> {
        self.providers
            .keys()
            .chain(self.rate_limits.keys())
            .filter(|name| name.parse::<ProviderKind>().is_err())
            .cloned()
            .collect()
    }

    fn provider_settings(&self, kind: ProviderKind) -> Result<&ProviderSettings, ConfigError> {
        self.providers
            .iter()
            .find(|(name, _)| name.parse::<ProviderKind>().ok() == Some(kind))
            .map(|(_, settings)| settings)
            .ok_or(ConfigError::ProviderNotConfigured(kind))
    }

    /// Resolve API key from settings or environment for a provider.
    ///
    /// B_i(api key available) → Result
    pub fn resolve_api_key(&self, kind: ProviderKind) -> Result<String, ConfigError> {
        let provider = self.provider_settings(kind)?;

        // First check explicit api_key in settings
        if let Some(key) = &provider.api_key {
            return Ok(expand_env_vars(key));
        }

        // Then check environment variable
        let env_var = provider
            .api_key_env
            .clone()
            .unwrap_or_else(|| default_api_key_env(kind).to_string());
        std::env::var(&env_var).map_err(|_| ConfigError::MissingApiKey {
            provider: kind,
            env_var,
        })
    }

    /// Build the `ProviderConfig` for a provider from its settings entry.
    ///
    /// The result is not validated yet; adapters do that before use.
    pub fn resolve_provider_config(&self, kind: ProviderKind) -> Result<ProviderConfig, ConfigError> {
        let provider = self.provider_settings(kind)?;
        let api_key = self.resolve_api_key(kind)?;

        Ok(ProviderConfig {
            provider: kind,
            api_key,
            base_url: provider.base_url.as_deref().map(expand_env_vars),
            model: provider.model.clone(),
            temperature: provider.temperature,
            max_tokens: provider.max_tokens,
            top_p: provider.top_p,
            frequency_penalty: provider.frequency_penalty,
            presence_penalty: provider.presence_penalty,
            system_message: provider.system_message.clone(),
        })
    }

    /// Rate limit overrides for a provider (empty when not configured).
    pub fn rate_limit_overrides(&self, kind: ProviderKind) -> RateLimitOverrides {
        self.rate_limits
            .iter()
            .find(|(name, _)| name.parse::<ProviderKind>().ok() == Some(kind))
            .map(|(_, overrides)| *overrides)
            .unwrap_or_default()
    }
}

/// Conventional API key variable for each provider.
pub fn default_api_key_env(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "OPENAI_API_KEY",
        ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        ProviderKind::Google => "GOOGLE_API_KEY",
    }
}

static ENV_VAR_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in ENV_VAR_RE.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Settings errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Missing required values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read settings file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse settings {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key for provider '{provider}': set {env_var} env var or api_key in settings")]
    MissingApiKey {
        provider: ProviderKind,
        env_var: String,
    },

    #[error("Provider '{0}' has no [providers.{0}] section in settings")]
    ProviderNotConfigured(ProviderKind),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[http]
timeout_secs = 10

[providers.openai]
api_key = "sk-inline-key-000000000000"
model = "gpt-4o-mini"
temperature = 0.3

[providers.anthropic]
api_key_env = "LLMUX_TEST_ANTHROPIC_KEY_UNSET"
model = "claude-3-5-haiku-latest"

[rate_limits.openai]
max_requests_per_minute = 5
"#;

    #[test]
    fn test_parse_settings() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(settings.http.timeout_secs, 10);
        assert_eq!(
            settings.configured_providers(),
            vec![ProviderKind::OpenAi, ProviderKind::Anthropic]
        );
        assert!(settings.unknown_providers().is_empty());
        assert_eq!(
            settings
                .rate_limit_overrides(ProviderKind::OpenAi)
                .max_requests_per_minute,
            Some(5)
        );
        assert_eq!(
            settings.rate_limit_overrides(ProviderKind::Google),
            RateLimitOverrides::default()
        );
    }

    #[test]
    fn test_default_timeout_is_thirty_seconds() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.timeout(), std::time::Duration::from_secs(30));
    }

    #[test]
    fn test_resolve_provider_config() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let config = settings
            .resolve_provider_config(ProviderKind::OpenAi)
            .unwrap();
        assert_eq!(config.api_key, "sk-inline-key-000000000000");
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.temperature, Some(0.3));
    }

    #[test]
    fn test_missing_key_and_unconfigured_provider() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert!(matches!(
            settings.resolve_api_key(ProviderKind::Anthropic),
            Err(ConfigError::MissingApiKey { ref env_var, .. }) if env_var == "LLMUX_TEST_ANTHROPIC_KEY_UNSET"
        ));
        assert!(matches!(
            settings.resolve_provider_config(ProviderKind::Google),
            Err(ConfigError::ProviderNotConfigured(ProviderKind::Google))
        ));
    }

    #[test]
    fn test_unknown_provider_sections_are_reported() {
        let settings = Settings::from_toml_str(
            "[providers.mistral]\nmodel = \"mistral-large\"\n\n[providers.gemini]\napi_key = \"k\"\nmodel = \"gemini-2.0-flash\"\n",
        )
        .unwrap();
        assert_eq!(settings.unknown_providers(), vec!["mistral".to_string()]);
        assert_eq!(settings.configured_providers(), vec![ProviderKind::Google]);
        assert!(settings.resolve_provider_config(ProviderKind::Google).is_ok());
    }

    #[test]
    fn test_unset_placeholder_is_left_alone() {
        assert_eq!(
            expand_env_vars("${LLMUX_TEST_DEFINITELY_UNSET}"),
            "${LLMUX_TEST_DEFINITELY_UNSET}"
        );
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let settings = Settings::from_file(file.path()).unwrap();
        assert!(settings.providers.contains_key("anthropic"));

        let missing = Settings::from_file(std::path::Path::new("/nonexistent/llmux.toml"));
        assert!(matches!(missing, Err(ConfigError::FileRead { .. })));
    }
}
