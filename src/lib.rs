//! llmux - Streaming client for multiple LLM vendor APIs.
//!
//! ## Architecture
//!
//! A request flows through five parts:
//! - **Validation**: typed schemas for vendor frames and per-vendor config rules
//! - **Provider adapters**: OpenAI, Anthropic and Google request/response shapes
//! - **Stream processor**: incremental SSE decoding into normalized chunks
//! - **Request manager**: request ids, routing and cooperative cancellation
//! - **Rate limiter**: per-provider window, concurrency and 429 backoff
//!
//! `InferenceContext` builds and owns all of them for one process.
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Network/API uncertainties (retryable errors, backoff)

pub mod client;
pub mod models;
pub mod provider;
pub mod stream;
pub mod validation;

// Re-exports for convenience
pub use client::{
    AdmissionPermit, InferenceContext, ModelCache, ProviderRegistry, RateLimiter,
    RateLimiterRegistry, RequestManager,
};
pub use models::{
    AvailableModelsResult, InferenceRequest, LlmuxError, ModelInfo, NormalizedError,
    ProviderConfig, ProviderKind, RequestId, Result, Settings, StreamChunk,
};
pub use provider::{HealthCheckResult, HealthStatus, ProviderAdapter};
pub use stream::{ChunkStream, StreamProcessor};
