//! Provider registry.
//!
//! Epistemic foundation:
//! - K_i: Exactly one adapter per `ProviderKind`
//! - B_i: Providers are reachable (verified via health checks)
//! - I^R: Caller decides which adapters to register

use crate::client::ModelCache;
use crate::models::{LlmuxError, ProviderConfig, ProviderKind, Result};
use crate::provider::{
    AnthropicAdapter, GoogleAdapter, HealthCheckResult, HealthStatus, HttpTransport, OpenAiAdapter,
    ProviderAdapter,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Registry of vendor adapters keyed by provider.
///
/// Thread-safe: adapters are shared as `Arc<dyn ProviderAdapter>`.
///
/// # Example
///
/// ```ignore
/// let registry = ProviderRegistry::with_defaults(transport, models);
/// let adapter = registry.get(ProviderKind::Anthropic)?;
/// let stream = adapter.send_streaming_request(&request).await?;
/// ```
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the OpenAI, Anthropic and Google adapters sharing one
    /// transport and one model cache.
    pub fn with_defaults(transport: Arc<HttpTransport>, models: Arc<ModelCache>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenAiAdapter::new(
            Arc::clone(&transport),
            Arc::clone(&models),
        )));
        registry.register(Arc::new(AnthropicAdapter::new(
            Arc::clone(&transport),
            Arc::clone(&models),
        )));
        registry.register(Arc::new(GoogleAdapter::new(transport, models)));
        registry
    }

    /// Register an adapter, replacing any previous one for the same provider.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.insert(adapter.kind(), adapter)
    }

    /// Get the adapter for a provider.
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| LlmuxError::ProviderNotRegistered(kind.to_string()))
    }

    /// Get an adapter by provider name (`"openai"`, `"anthropic"`, `"google"`).
    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.get(name.parse()?)
    }

    /// Registered providers, sorted.
    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.adapters.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Run health checks for each config against its provider's adapter.
    ///
    /// Configs for unregistered providers are reported as unreachable.
    pub async fn health_check_all(&self, configs: &[ProviderConfig]) -> Vec<HealthCheckResult> {
        let mut results = Vec::with_capacity(configs.len());

        for config in configs {
            let result = match self.get(config.provider) {
                Ok(adapter) => adapter.health_check(config).await,
                Err(e) => HealthCheckResult {
                    provider: config.provider,
                    status: HealthStatus::Unreachable,
                    latency_ms: None,
                    error: Some(e.to_string()),
                },
            };

            match result.status {
                HealthStatus::Healthy => {
                    info!(
                        provider = %result.provider,
                        latency_ms = result.latency_ms.unwrap_or_default(),
                        "Provider healthy"
                    );
                }
                status => {
                    warn!(
                        provider = %result.provider,
                        status = %status,
                        error = result.error.as_deref().unwrap_or("unknown"),
                        "Provider not healthy"
                    );
                }
            }
            results.push(result);
        }

        results
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn defaults() -> ProviderRegistry {
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(5)).unwrap());
        ProviderRegistry::with_defaults(transport, Arc::new(ModelCache::new()))
    }

    #[test]
    fn test_defaults_register_every_provider() {
        let registry = defaults();
        assert_eq!(registry.len(), 3);
        for kind in ProviderKind::ALL {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
        assert_eq!(registry.get_by_name("gemini").unwrap().kind(), ProviderKind::Google);
    }

    #[test]
    fn test_unknown_or_missing_provider_is_not_registered() {
        let registry = defaults();
        let err = registry.get_by_name("mistral").err().unwrap();
        assert_eq!(err.code(), "ProviderNotRegistered");
        assert!(!err.is_retryable());

        let empty = ProviderRegistry::new();
        let err = empty.get(ProviderKind::OpenAi).err().unwrap();
        assert!(matches!(err, LlmuxError::ProviderNotRegistered(ref name) if name == "openai"));
    }

    #[tokio::test]
    async fn test_health_check_for_unregistered_provider() {
        let empty = ProviderRegistry::new();
        let config = ProviderConfig::new(ProviderKind::Anthropic, "sk-ant-x", "claude-3-5-haiku-latest");
        let results = empty.health_check_all(&[config]).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, HealthStatus::Unreachable);
    }
}
