//! Request orchestration: registry, manager, rate limiting, model cache.

mod context;
mod manager;
mod model_cache;
mod rate_limiter;
mod registry;

pub use context::*;
pub use manager::*;
pub use model_cache::*;
pub use rate_limiter::*;
pub use registry::*;
