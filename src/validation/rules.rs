//! Configuration rules per vendor.
//! Checks a ProviderConfig against credential shape, numeric bounds and model policy.

use super::{IssueCode, ValidationIssue};
use crate::models::ProviderConfig;
use regex::Regex;

/// Which model names a vendor accepts.
#[derive(Debug, Clone)]
pub enum ModelPolicy {
    /// Only these exact names
    AllowList(&'static [&'static str]),
    /// Anything starting with one of these prefixes, so new model names work
    /// without a release
    PassThrough { prefixes: &'static [&'static str] },
}

impl ModelPolicy {
    pub fn accepts(&self, model: &str) -> bool {
        match self {
            ModelPolicy::AllowList(models) => models.contains(&model),
            ModelPolicy::PassThrough { prefixes } => {
                prefixes.is_empty() || prefixes.iter().any(|p| model.starts_with(p))
            }
        }
    }
}

/// Validation rules for one vendor's configuration.
#[derive(Debug, Clone)]
pub struct ConfigRules {
    pub credential_pattern: Regex,
    /// Human description of the credential shape, used in messages
    pub credential_hint: &'static str,
    pub max_output_tokens: u32,
    pub temperature: (f64, f64),
    pub top_p: (f64, f64),
    pub penalty: (f64, f64),
    pub models: ModelPolicy,
}

impl ConfigRules {
    /// Validate a config, returning it unchanged when every rule holds.
    ///
    /// Stops at the first failing rule.
    pub fn validate(&self, config: &ProviderConfig) -> Result<ProviderConfig, ValidationIssue> {
        // check credential
        if config.api_key.trim().is_empty() {
            return Err(ValidationIssue::field("api_key", "API key is required"));
        }
        if !self.credential_pattern.is_match(&config.api_key) {
            return Err(ValidationIssue::field(
                "api_key",
                format!("API key does not look like {}", self.credential_hint),
            ));
        }

        // check base url
        if let Some(base_url) = &config.base_url {
            if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                return Err(ValidationIssue::field(
                    "base_url",
                    format!("base URL must start with http:// or https://, got {base_url}"),
                ));
            }
        }

        // check model
        if config.model.trim().is_empty() {
            return Err(ValidationIssue::field("model", "model is required"));
        }
        if !self.models.accepts(&config.model) {
            return Err(ValidationIssue {
                code: IssueCode::ConstraintViolation,
                message: format!("unsupported model: {}", config.model),
                details: Some(serde_json::json!({ "field": "model", "value": config.model })),
            });
        }

        // check numeric bounds
        if let Some(max_tokens) = config.max_tokens {
            if max_tokens == 0 || max_tokens > self.max_output_tokens {
                return Err(ValidationIssue::field(
                    "max_tokens",
                    format!(
                        "must be between 1 and {}, got {max_tokens}",
                        self.max_output_tokens
                    ),
                ));
            }
        }
        check_range("temperature", config.temperature, self.temperature)?;
        check_range("top_p", config.top_p, self.top_p)?;
        check_range("frequency_penalty", config.frequency_penalty, self.penalty)?;
        check_range("presence_penalty", config.presence_penalty, self.penalty)?;

        Ok(config.clone())
    }
}

fn check_range(field: &str, value: Option<f64>, (min, max): (f64, f64)) -> Result<(), ValidationIssue> {
    match value {
        Some(v) if !(min..=max).contains(&v) => Err(ValidationIssue::field(
            field,
            format!("must be between {min} and {max}, got {v}"),
        )),
        _ => Ok(()),
    }
}
