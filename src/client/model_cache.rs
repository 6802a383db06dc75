//! Model listing cache.
//!
//! Epistemic foundation:
//! - K_i: Model lists change rarely → 5 minute TTL
//! - B_i: A stale list is more useful than a static one
//! - I^B: Listing endpoint availability unknowable → never an error to callers

use crate::models::{AvailableModelsResult, ModelInfo, ProviderKind, Result, credential_suffix};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long a fetched list is served without refetching.
pub const MODEL_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Cache key: provider, credential suffix and base URL.
///
/// Only the last eight characters of the credential are kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelCacheKey {
    provider: ProviderKind,
    credential_suffix: String,
    base_url: String,
}

impl ModelCacheKey {
    pub fn new(provider: ProviderKind, api_key: &str, base_url: &str) -> Self {
        Self {
            provider,
            credential_suffix: credential_suffix(api_key),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedModels {
    models: Vec<ModelInfo>,
    fetched_at: DateTime<Utc>,
    stored_at: Instant,
}

/// Shared model list cache for every adapter.
#[derive(Debug)]
pub struct ModelCache {
    entries: DashMap<ModelCacheKey, CachedModels>,
    ttl: Duration,
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelCache {
    pub fn new() -> Self {
        Self::with_ttl(MODEL_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Serve a fresh entry, or run `fetch` and store its result.
    ///
    /// On fetch failure: a stale entry is served if one exists, otherwise
    /// `fallback()` is returned without being stored.
    pub async fn get_or_fetch<Fut>(
        &self,
        key: ModelCacheKey,
        fetch: Fut,
        fallback: fn() -> Vec<ModelInfo>,
    ) -> AvailableModelsResult
    where
        Fut: Future<Output = Result<Vec<ModelInfo>>>,
    {
        // guard dropped before the fetch is awaited
        let cached = self.entries.get(&key).map(|entry| entry.clone());

        if let Some(entry) = cached.as_ref().filter(|e| e.stored_at.elapsed() < self.ttl) {
            debug!(provider = %key.provider, "Model list served from cache");
            return AvailableModelsResult {
                models: entry.models.clone(),
                cached: true,
                fetched_at: entry.fetched_at,
            };
        }

        match fetch.await {
            Ok(models) => {
                let fetched_at = Utc::now();
                debug!(provider = %key.provider, count = models.len(), "Model list fetched");
                self.entries.insert(
                    key,
                    CachedModels {
                        models: models.clone(),
                        fetched_at,
                        stored_at: Instant::now(),
                    },
                );
                AvailableModelsResult {
                    models,
                    cached: false,
                    fetched_at,
                }
            }
            Err(e) => match cached {
                Some(stale) => {
                    warn!(provider = %key.provider, error = %e, "Model fetch failed, serving stale list");
                    AvailableModelsResult {
                        models: stale.models,
                        cached: true,
                        fetched_at: stale.fetched_at,
                    }
                }
                None => {
                    warn!(provider = %key.provider, error = %e, "Model fetch failed, using static list");
                    AvailableModelsResult {
                        models: fallback(),
                        cached: false,
                        fetched_at: Utc::now(),
                    }
                }
            },
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LlmuxError;

    fn fallback() -> Vec<ModelInfo> {
        vec![ModelInfo::new("static-model")]
    }

    fn key() -> ModelCacheKey {
        ModelCacheKey::new(ProviderKind::OpenAi, "sk-abcdefgh12345678", "https://api.example.com/v1/")
    }

    async fn fetched(ids: &[&str]) -> Result<Vec<ModelInfo>> {
        Ok(ids.iter().map(|id| ModelInfo::new(*id)).collect())
    }

    async fn failed() -> Result<Vec<ModelInfo>> {
        Err(LlmuxError::Network("down".into()))
    }

    #[test]
    fn test_key_uses_suffix_and_normalized_url() {
        assert_eq!(
            key(),
            ModelCacheKey::new(ProviderKind::OpenAi, "sk-other0012345678", "https://api.example.com/v1")
        );
        assert_ne!(
            key(),
            ModelCacheKey::new(ProviderKind::OpenAi, "sk-abcdefgh12345679", "https://api.example.com/v1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_entry_is_served_without_fetch() {
        let cache = ModelCache::new();
        let first = cache.get_or_fetch(key(), fetched(&["a"]), fallback).await;
        assert!(!first.cached);

        let second = cache.get_or_fetch(key(), failed(), fallback).await;
        assert!(second.cached);
        assert_eq!(second.models[0].id, "a");
        assert_eq!(second.fetched_at, first.fetched_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_refetched() {
        let cache = ModelCache::new();
        cache.get_or_fetch(key(), fetched(&["a"]), fallback).await;
        tokio::time::advance(MODEL_CACHE_TTL).await;

        let refreshed = cache.get_or_fetch(key(), fetched(&["b"]), fallback).await;
        assert!(!refreshed.cached);
        assert_eq!(refreshed.models[0].id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_served_on_failure() {
        let cache = ModelCache::new();
        cache.get_or_fetch(key(), fetched(&["a"]), fallback).await;
        tokio::time::advance(MODEL_CACHE_TTL * 2).await;

        let stale = cache.get_or_fetch(key(), failed(), fallback).await;
        assert!(stale.cached);
        assert_eq!(stale.models[0].id, "a");
    }

    #[tokio::test]
    async fn test_fallback_only_without_entry_and_not_stored() {
        let cache = ModelCache::new();
        let result = cache.get_or_fetch(key(), failed(), fallback).await;
        assert!(!result.cached);
        assert_eq!(result.models[0].id, "static-model");
        assert!(cache.is_empty());
    }
}
