//! Request manager: admission, routing and cooperative cancellation.
//!
//! Epistemic foundation:
//! - K_i: An id is registered iff it has an outstanding cancellation token
//! - K_i: After cancellation the caller sees exactly one empty terminal chunk
//! - B_i: The adapter stops on its own once dropped (never relied upon)

use crate::client::ProviderRegistry;
use crate::models::{InferenceRequest, LlmuxError, ProviderConfig, RequestId, Result, StreamChunk};
use crate::provider::ProviderAdapter;
use crate::stream::ChunkStream;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type ActiveRequests = Arc<DashMap<RequestId, CancellationToken>>;

/// Issues requests, routes them to adapters and tracks in-flight ones.
#[derive(Debug)]
pub struct RequestManager {
    registry: Arc<ProviderRegistry>,
    active: ActiveRequests,
}

impl RequestManager {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Validate the config with its adapter and build a request.
    ///
    /// Nothing is registered and no network call is made.
    pub fn create_request(&self, prompt: impl Into<String>, config: ProviderConfig) -> Result<InferenceRequest> {
        let adapter = self.registry.get(config.provider)?;
        let config = adapter.validate_config(&config)?;
        Ok(InferenceRequest::new(prompt, config))
    }

    /// Register the request and stream its chunks.
    ///
    /// The id is registered before this returns, so `cancel_request` works
    /// even before the first pull. It is deregistered when the terminal chunk
    /// or error is yielded, on cancellation, or when the stream is dropped.
    pub fn send_streaming_request(&self, request: InferenceRequest) -> ChunkStream {
        let adapter = match self.registry.get(request.config.provider) {
            Ok(adapter) => adapter,
            Err(e) => return single_error(e),
        };

        let token = CancellationToken::new();
        match self.active.entry(request.id.clone()) {
            Entry::Occupied(_) => {
                return single_error(LlmuxError::Internal(format!(
                    "request {} is already in flight",
                    request.id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }

        info!(
            request_id = %request.id,
            provider = %request.config.provider,
            model = %request.config.model,
            "Request started"
        );

        let flow = Flow {
            id: request.id.clone(),
            registration: Some(Registration {
                id: request.id.clone(),
                active: Arc::clone(&self.active),
            }),
            token,
            phase: Phase::Opening { adapter, request },
        };

        Box::pin(futures::stream::unfold(flow, Flow::advance))
    }

    /// Cancel one request. Returns whether it was active.
    pub fn cancel_request(&self, id: &RequestId) -> bool {
        match self.active.remove(id) {
            Some((_, token)) => {
                token.cancel();
                info!(request_id = %id, "Request cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every active request. Returns how many were cancelled.
    pub fn cancel_all_requests(&self) -> usize {
        let ids: Vec<RequestId> = self.active.iter().map(|e| e.key().clone()).collect();
        let cancelled = ids.iter().filter(|id| self.cancel_request(id)).count();
        if cancelled > 0 {
            info!(count = cancelled, "Cancelled all active requests");
        }
        cancelled
    }

    /// Ids of requests currently in flight.
    pub fn active_requests(&self) -> Vec<RequestId> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_active(&self, id: &RequestId) -> bool {
        self.active.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

fn single_error(error: LlmuxError) -> ChunkStream {
    Box::pin(futures::stream::once(async move { Err(error) }))
}

/// Removes the registry entry when dropped.
struct Registration {
    id: RequestId,
    active: ActiveRequests,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

enum Phase {
    Opening {
        adapter: Arc<dyn ProviderAdapter>,
        request: InferenceRequest,
    },
    Streaming(ChunkStream),
    Done,
}

/// Per-request state driven by the consumer's pulls.
struct Flow {
    id: RequestId,
    token: CancellationToken,
    phase: Phase,
    registration: Option<Registration>,
}

impl Flow {
    async fn advance(mut self) -> Option<(Result<StreamChunk>, Self)> {
        loop {
            let phase = std::mem::replace(&mut self.phase, Phase::Done);
            if let Phase::Done = phase {
                return None;
            }
            if self.token.is_cancelled() {
                return Some((Ok(self.cancelled()), self));
            }

            match phase {
                Phase::Opening { adapter, request } => {
                    let opened = tokio::select! {
                        biased;
                        _ = self.token.cancelled() => None,
                        opened = adapter.send_streaming_request(&request) => Some(opened),
                    };
                    match opened {
                        None => return Some((Ok(self.cancelled()), self)),
                        Some(Ok(stream)) => self.phase = Phase::Streaming(stream),
                        Some(Err(e)) => return Some((Err(self.failed(e)), self)),
                    }
                }
                Phase::Streaming(mut inner) => {
                    let next = tokio::select! {
                        biased;
                        _ = self.token.cancelled() => None,
                        item = inner.next() => Some(item),
                    };
                    match next {
                        // cancelled while waiting; the pending read is dropped with `inner`
                        None => return Some((Ok(self.cancelled()), self)),
                        Some(None) => {
                            debug!(request_id = %self.id, "Adapter stream ended without terminal chunk");
                            self.finish();
                            let terminal = StreamChunk::terminal(self.id.clone(), None);
                            return Some((Ok(terminal), self));
                        }
                        Some(Some(Ok(chunk))) => {
                            if self.token.is_cancelled() {
                                return Some((Ok(self.cancelled()), self));
                            }
                            if chunk.is_complete {
                                self.finish();
                            } else {
                                self.phase = Phase::Streaming(inner);
                            }
                            return Some((Ok(chunk), self));
                        }
                        Some(Some(Err(e))) => return Some((Err(self.failed(e)), self)),
                    }
                }
                Phase::Done => return None,
            }
        }
    }

    fn cancelled(&mut self) -> StreamChunk {
        debug!(request_id = %self.id, "Stream stopped by cancellation");
        self.registration = None;
        StreamChunk::terminal(self.id.clone(), None)
    }

    fn finish(&mut self) {
        debug!(request_id = %self.id, "Request completed");
        self.registration = None;
    }

    fn failed(&mut self, error: LlmuxError) -> LlmuxError {
        info!(
            request_id = %self.id,
            code = %error.code(),
            retryable = error.is_retryable(),
            "Request failed"
        );
        self.registration = None;
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AvailableModelsResult, ProviderKind};
    use crate::provider::{HealthCheckResult, HealthStatus};
    use crate::stream::FrameParser;
    use crate::validation::ConfigRules;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Adapter that emits scripted chunks, one every 10 ms, forever if asked.
    struct ScriptedAdapter {
        rules: ConfigRules,
        chunks: usize,
        fail_open: bool,
        omit_terminal: bool,
    }

    impl ScriptedAdapter {
        fn new(chunks: usize) -> Self {
            Self {
                rules: crate::provider::OpenAiAdapter::default_rules(),
                chunks,
                fail_open: false,
                omit_terminal: false,
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        fn rules(&self) -> &ConfigRules {
            &self.rules
        }

        fn frame_parser(&self) -> Arc<dyn FrameParser> {
            Arc::new(crate::provider::OpenAiFrameParser)
        }

        async fn send_streaming_request(&self, request: &InferenceRequest) -> Result<ChunkStream> {
            if self.fail_open {
                return Err(LlmuxError::Http {
                    status: 503,
                    message: "unavailable".into(),
                    retry_after_secs: None,
                    details: None,
                });
            }
            let id = request.id.clone();
            let total = self.chunks;
            let omit_terminal = self.omit_terminal;
            Ok(Box::pin(futures::stream::unfold(0usize, move |n| {
                let id = id.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    if n < total {
                        Some((Ok(StreamChunk::delta(id, format!("c{n}"))), n + 1))
                    } else if n == total && !omit_terminal {
                        Some((Ok(StreamChunk::terminal(id, Some(total as u32))), n + 1))
                    } else {
                        None
                    }
                }
            })))
        }

        async fn get_available_models(&self, _api_key: &str, _base_url: Option<&str>) -> AvailableModelsResult {
            AvailableModelsResult {
                models: vec![],
                cached: false,
                fetched_at: chrono::Utc::now(),
            }
        }

        async fn health_check(&self, config: &ProviderConfig) -> HealthCheckResult {
            HealthCheckResult {
                provider: config.provider,
                status: HealthStatus::Healthy,
                latency_ms: Some(0),
                error: None,
            }
        }
    }

    fn manager(adapter: ScriptedAdapter) -> RequestManager {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(adapter));
        RequestManager::new(Arc::new(registry))
    }

    fn config() -> ProviderConfig {
        ProviderConfig::new(ProviderKind::OpenAi, "sk-abcdefghijklmnopqrstuvwx", "gpt-4o-mini")
    }

    #[test]
    fn test_create_request_validates_without_registering() {
        let manager = manager(ScriptedAdapter::new(1));
        let mut bad = config();
        bad.temperature = Some(9.0);
        let err = manager.create_request("hi", bad).unwrap_err();
        assert_eq!(err.code(), "ConfigValidationError");
        assert_eq!(manager.active_count(), 0);

        let request = manager.create_request("hi", config()).unwrap();
        assert_eq!(request.prompt, "hi");
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_create_request_for_unregistered_provider() {
        let manager = manager(ScriptedAdapter::new(1));
        let config = ProviderConfig::new(ProviderKind::Google, "AIza", "gemini-2.0-flash");
        let err = manager.create_request("hi", config).unwrap_err();
        assert_eq!(err.code(), "ProviderNotRegistered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_stream_deregisters_on_terminal() {
        let manager = manager(ScriptedAdapter::new(2));
        let request = manager.create_request("hi", config()).unwrap();
        let id = request.id.clone();

        let mut stream = manager.send_streaming_request(request);
        assert!(manager.is_active(&id));

        let mut chunks = Vec::new();
        while let Some(item) = stream.next().await {
            let chunk = item.unwrap();
            if chunk.is_complete {
                assert!(!manager.is_active(&id));
            }
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().filter(|c| c.is_complete).count(), 1);
        assert_eq!(chunks[2].token_count, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_end_without_terminal_gets_one() {
        let mut adapter = ScriptedAdapter::new(2);
        adapter.omit_terminal = true;
        let manager = manager(adapter);
        let request = manager.create_request("hi", config()).unwrap();
        let id = request.id.clone();

        let items: Vec<_> = manager.send_streaming_request(request).collect().await;
        let chunks: Vec<StreamChunk> = items.into_iter().map(|item| item.unwrap()).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().filter(|c| c.is_complete).count(), 1);
        assert_eq!(chunks[2], StreamChunk::terminal(id.clone(), None));
        assert!(!manager.is_active(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_stream_yields_one_terminal() {
        let manager = manager(ScriptedAdapter::new(1_000));
        let request = manager.create_request("hi", config()).unwrap();
        let id = request.id.clone();
        let mut stream = manager.send_streaming_request(request);

        assert_eq!(stream.next().await.unwrap().unwrap().content, "c0");
        assert_eq!(stream.next().await.unwrap().unwrap().content, "c1");

        assert!(manager.cancel_request(&id));
        assert!(!manager.cancel_request(&id));
        assert!(!manager.is_active(&id));

        let last = stream.next().await.unwrap().unwrap();
        assert_eq!(last, StreamChunk::terminal(id, None));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_pull() {
        let manager = manager(ScriptedAdapter::new(5));
        let request = manager.create_request("hi", config()).unwrap();
        let id = request.id.clone();
        let stream = manager.send_streaming_request(request);

        assert!(manager.cancel_request(&id));
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap().is_complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_a_pending_pull() {
        let manager = Arc::new(manager(ScriptedAdapter::new(1_000)));
        let request = manager.create_request("hi", config()).unwrap();
        let id = request.id.clone();
        let mut stream = manager.send_streaming_request(request);
        stream.next().await.unwrap().unwrap();

        let canceller = Arc::clone(&manager);
        let cancel_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel_request(&cancel_id);
        });

        let last = stream.next().await.unwrap().unwrap();
        assert!(last.is_complete);
        assert!(last.content.is_empty());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_error_is_single_terminal_error() {
        let mut adapter = ScriptedAdapter::new(1);
        adapter.fail_open = true;
        let manager = manager(adapter);
        let request = manager.create_request("hi", config()).unwrap();
        let id = request.id.clone();

        let items: Vec<_> = manager.send_streaming_request(request).collect().await;
        assert_eq!(items.len(), 1);
        let err = items.into_iter().next().unwrap().unwrap_err();
        assert_eq!(err.code(), "HTTPError_503");
        assert!(err.is_retryable());
        assert!(!manager.is_active(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_and_drop_deregister() {
        let manager = manager(ScriptedAdapter::new(10));
        let a = manager.send_streaming_request(manager.create_request("a", config()).unwrap());
        let b = manager.send_streaming_request(manager.create_request("b", config()).unwrap());
        assert_eq!(manager.active_count(), 2);

        assert_eq!(manager.cancel_all_requests(), 2);
        assert!(manager.active_requests().is_empty());
        drop(a);
        drop(b);

        let c = manager.send_streaming_request(manager.create_request("c", config()).unwrap());
        assert_eq!(manager.active_count(), 1);
        drop(c);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected_without_touching_original() {
        let manager = manager(ScriptedAdapter::new(1));
        let request = manager.create_request("hi", config()).unwrap();
        let id = request.id.clone();
        let _first = manager.send_streaming_request(request.clone());

        let items: Vec<_> = manager.send_streaming_request(request).collect().await;
        assert!(matches!(items[0], Err(LlmuxError::Internal(_))));
        assert!(manager.is_active(&id));
    }
}
