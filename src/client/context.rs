//! Inference context: everything a process needs, built once at startup.
//!
//! Epistemic foundation:
//! - K_i: One transport, one model cache, one manager, one limiter per provider
//! - K_i: Nothing global; two contexts never share state
//! - I^B: Admission may not happen in time → `TimeoutError`, retryable

use crate::client::{ModelCache, ProviderRegistry, RateLimiter, RateLimiterRegistry, RequestManager};
use crate::models::{
    AvailableModelsResult, LlmuxError, ProviderConfig, ProviderKind, Result, Settings,
};
use crate::provider::{HealthCheckResult, HttpTransport};
use crate::stream::ChunkStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Owns the provider registry, request manager, rate limiters and model
/// cache for one process.
///
/// # Example
///
/// ```ignore
/// let context = InferenceContext::new(Settings::from_file(path)?)?;
/// let config = context.resolve_config(ProviderKind::OpenAi)?;
/// let mut stream = context.stream_prompt("Hello", config, Duration::from_secs(30)).await?;
/// while let Some(chunk) = stream.next().await { /* ... */ }
/// context.shutdown();
/// ```
#[derive(Debug)]
pub struct InferenceContext {
    settings: Settings,
    models: Arc<ModelCache>,
    manager: RequestManager,
    limiters: RateLimiterRegistry,
}

impl InferenceContext {
    /// Build a context with the default adapters.
    pub fn new(settings: Settings) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(settings.timeout())?);
        let models = Arc::new(ModelCache::new());
        let registry = ProviderRegistry::with_defaults(transport, Arc::clone(&models));
        Ok(Self::with_registry(settings, registry, models))
    }

    /// Build a context around a caller-assembled registry.
    pub fn with_registry(settings: Settings, registry: ProviderRegistry, models: Arc<ModelCache>) -> Self {
        let limiters = RateLimiterRegistry::from_settings(&settings);
        info!(
            providers = ?registry.kinds(),
            timeout_secs = settings.http.timeout_secs,
            "Inference context ready"
        );
        Self {
            settings,
            models,
            manager: RequestManager::new(Arc::new(registry)),
            limiters,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn manager(&self) -> &RequestManager {
        &self.manager
    }

    pub fn registry(&self) -> &ProviderRegistry {
        self.manager.registry()
    }

    pub fn limiters(&self) -> &RateLimiterRegistry {
        &self.limiters
    }

    pub fn limiter(&self, kind: ProviderKind) -> Arc<RateLimiter> {
        self.limiters.get(kind)
    }

    pub fn models(&self) -> &ModelCache {
        &self.models
    }

    /// Provider config from settings (API key resolved).
    pub fn resolve_config(&self, kind: ProviderKind) -> Result<ProviderConfig> {
        Ok(self.settings.resolve_provider_config(kind)?)
    }

    /// Validate, wait for admission, then stream.
    ///
    /// The admission slot is held until the terminal chunk or error, or until
    /// the stream is dropped. A 429 puts the provider's limiter into backoff;
    /// the first chunk clears it.
    pub async fn stream_prompt(
        &self,
        prompt: impl Into<String>,
        config: ProviderConfig,
        admission_timeout: Duration,
    ) -> Result<ChunkStream> {
        let request = self.manager.create_request(prompt, config)?;
        let limiter = self.limiter(request.config.provider);
        let permit = AdmissionPermit::acquire(Arc::clone(&limiter), admission_timeout).await?;

        let stream = self.manager.send_streaming_request(request);
        let mut permit = Some(permit);
        let mut succeeded = false;

        Ok(Box::pin(stream.map(move |item| {
            match &item {
                Ok(chunk) => {
                    if !succeeded {
                        succeeded = true;
                        limiter.handle_successful_request();
                    }
                    if chunk.is_complete {
                        permit.take();
                    }
                }
                Err(e) => {
                    if e.is_rate_limited() {
                        limiter.handle_rate_limit_response(e.retry_after());
                    }
                    permit.take();
                }
            }
            item
        })))
    }

    /// Model list for a config's provider, credential and base URL.
    pub async fn available_models(&self, config: &ProviderConfig) -> Result<AvailableModelsResult> {
        let adapter = self.registry().get(config.provider)?;
        Ok(adapter
            .get_available_models(&config.api_key, config.base_url.as_deref())
            .await)
    }

    /// Health check every provider configured in settings.
    ///
    /// Providers whose config cannot be resolved are skipped with a warning.
    pub async fn health_check_configured(&self) -> Vec<HealthCheckResult> {
        let configs: Vec<ProviderConfig> = self
            .settings
            .configured_providers()
            .into_iter()
            .filter_map(|kind| match self.resolve_config(kind) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(provider = %kind, error = %e, "Skipping health check");
                    None
                }
            })
            .collect();
        self.registry().health_check_all(&configs).await
    }

    /// Cancel every in-flight request and drop cached model lists.
    ///
    /// Returns how many requests were cancelled.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.manager.cancel_all_requests();
        self.models.clear();
        info!(cancelled = cancelled, "Inference context shut down");
        cancelled
    }
}

/// One admitted request slot; released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    limiter: Arc<RateLimiter>,
}

impl AdmissionPermit {
    /// Wait up to `timeout` for the limiter to admit one request.
    pub async fn acquire(limiter: Arc<RateLimiter>, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            if limiter.acquire_request() {
                debug!(provider = %limiter.provider(), "Request admitted");
                return Ok(Self { limiter });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !limiter.wait_for_availability(remaining).await {
                warn!(
                    provider = %limiter.provider(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Admission timed out"
                );
                return Err(LlmuxError::Timeout(timeout));
            }
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.limiter.release_request();
    }
}
