//! Core data models for llmux.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Settings and config parameters
//! - I^B (Bounded): Error variants with retry hints

mod config;
mod error;
mod provider;
mod request;

pub use config::*;
pub use error::*;
pub use provider::*;
pub use request::*;
