//! Incremental SSE decoding and normalization into `StreamChunk`s.
//!
//! Responsibilities:
//! - Decode a byte-oriented response body into `data:` frames (with the
//!   preceding `event:` name when the vendor sends one)
//! - Hand each frame to the vendor's `FrameParser`
//! - Stop at the vendor's end signal and synthesize exactly one terminal chunk
//! - Skip heartbeats and frames that fail to parse or validate
//! - Surface an in-stream vendor error event as the stream's one terminal error

mod decoder;
mod processor;

pub use decoder::SseDecoder;
pub use processor::StreamProcessor;

use crate::models::{Result, StreamChunk};
use futures::Stream;
use std::pin::Pin;

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    /// Event name from a preceding `event:` line (Anthropic-style streams)
    pub event: Option<String>,
    /// Payload after `data:`
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn with_event(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }
}

/// What a vendor frame means for the normalized stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Not content (ping, structural event, unparseable): drop it
    Skip,
    /// Content delta (possibly empty, e.g. a start-of-message marker)
    Delta {
        content: String,
        token_count: Option<u32>,
    },
    /// Usage report without content
    Usage(u32),
    /// End of stream, optionally carrying last content
    End {
        content: Option<String>,
        token_count: Option<u32>,
    },
    /// Vendor reported an error inside the stream; ends it with an error
    Failed { status: u16, message: String },
}

impl FrameOutcome {
    pub fn delta(content: impl Into<String>) -> Self {
        FrameOutcome::Delta {
            content: content.into(),
            token_count: None,
        }
    }

    pub fn end() -> Self {
        FrameOutcome::End {
            content: None,
            token_count: None,
        }
    }
}

/// Maps one vendor frame to a `FrameOutcome`.
///
/// Implementations must never panic on malformed input; a frame that does not
/// match is `FrameOutcome::Skip`.
pub trait FrameParser: Send + Sync {
    fn parse_frame(&self, frame: &SseFrame) -> FrameOutcome;
}

/// Lazy, finite, non-restartable sequence of chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Raw response body as a stream of byte segments.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes>> + Send>>;
