//! Stream processor.
//!
//! Pulls body segments on demand, decodes them into frames, and maps each
//! frame through the vendor parser. Nothing is read ahead of the consumer:
//! each poll reads at most one body segment.

use super::{ByteStream, ChunkStream, FrameOutcome, FrameParser, SseDecoder, SseFrame};
use crate::models::{LlmuxError, RequestId, StreamChunk};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Turns a response body into a `ChunkStream` for one request.
pub struct StreamProcessor {
    parser: Arc<dyn FrameParser>,
}

impl StreamProcessor {
    pub fn new(parser: Arc<dyn FrameParser>) -> Self {
        Self { parser }
    }

    /// Process a body stream into normalized chunks.
    ///
    /// Guarantees: exactly one terminal chunk unless a body read fails or the
    /// vendor sends an error event, in which case exactly one error is
    /// yielded instead. The body is dropped
    /// as soon as the stream reaches either end, and with the returned
    /// stream if the consumer stops early.
    pub fn process(&self, request_id: RequestId, body: ByteStream) -> ChunkStream {
        let state = ProcessingState {
            request_id,
            parser: Arc::clone(&self.parser),
            body: Some(body),
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
            token_count: None,
            failure: None,
            finished: false,
        };

        Box::pin(futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.ready.pop_front() {
                    return Some((Ok(item), state));
                }
                if let Some(error) = state.failure.take() {
                    return Some((Err(error), state));
                }
                if state.finished {
                    return None;
                }

                let Some(body) = state.body.as_mut() else {
                    return None;
                };

                let next = body.next().await;
                match next {
                    Some(Ok(segment)) => {
                        let frames = state.decoder.feed(&segment);
                        state.apply(frames);
                    }
                    Some(Err(e)) => {
                        debug!(request_id = %state.request_id, error = %e, "Body read failed");
                        state.release();
                        return Some((Err(e), state));
                    }
                    None => {
                        let frames = state.decoder.finish();
                        state.apply(frames);
                        if !state.finished {
                            debug!(
                                request_id = %state.request_id,
                                "Body ended without end signal, closing stream"
                            );
                            state.finish();
                        }
                    }
                }
            }
        }))
    }
}

/// Mutable state carried through the processing loop.
struct ProcessingState {
    request_id: RequestId,
    parser: Arc<dyn FrameParser>,
    /// Response body; `None` once released.
    body: Option<ByteStream>,
    decoder: SseDecoder,
    /// Chunks produced but not yet pulled.
    ready: VecDeque<StreamChunk>,
    /// Latest token count reported by the vendor.
    token_count: Option<u32>,
    /// In-stream vendor error, yielded after the chunks already queued.
    failure: Option<LlmuxError>,
    finished: bool,
}

impl ProcessingState {
    /// Map frames to chunks, stopping at the first end signal.
    fn apply(&mut self, frames: Vec<SseFrame>) {
        for frame in frames {
            if self.finished {
                break;
            }
            match self.parser.parse_frame(&frame) {
                FrameOutcome::Skip => {
                    debug!(
                        request_id = %self.request_id,
                        event = frame.event.as_deref().unwrap_or(""),
                        "Dropped frame"
                    );
                }
                FrameOutcome::Delta {
                    content,
                    token_count,
                } => {
                    if token_count.is_some() {
                        self.token_count = token_count;
                    }
                    let mut chunk = StreamChunk::delta(self.request_id.clone(), content);
                    chunk.token_count = token_count;
                    self.ready.push_back(chunk);
                }
                FrameOutcome::Usage(tokens) => {
                    self.token_count = Some(tokens);
                }
                FrameOutcome::End {
                    content,
                    token_count,
                } => {
                    if token_count.is_some() {
                        self.token_count = token_count;
                    }
                    if let Some(content) = content.filter(|c| !c.is_empty()) {
                        self.ready
                            .push_back(StreamChunk::delta(self.request_id.clone(), content));
                    }
                    self.finish();
                }
                FrameOutcome::Failed { status, message } => {
                    debug!(
                        request_id = %self.request_id,
                        status = status,
                        "Vendor error event in stream"
                    );
                    self.failure = Some(LlmuxError::Http {
                        status,
                        message,
                        retry_after_secs: None,
                        details: None,
                    });
                    self.release();
                }
            }
        }
    }

    /// Queue the terminal chunk and release the body.
    fn finish(&mut self) {
        self.ready.push_back(StreamChunk::terminal(
            self.request_id.clone(),
            self.token_count,
        ));
        self.release();
    }

    fn release(&mut self) {
        self.finished = true;
        self.body = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LlmuxError, Result};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Minimal OpenAI-like parser: `[DONE]` ends, JSON `{"t": ".."}` is content.
    struct TestParser;

    impl FrameParser for TestParser {
        fn parse_frame(&self, frame: &SseFrame) -> FrameOutcome {
            if frame.data == "[DONE]" {
                return FrameOutcome::end();
            }
            match serde_json::from_str::<serde_json::Value>(&frame.data) {
                Ok(v) if v.get("err").is_some() => FrameOutcome::Failed {
                    status: 529,
                    message: "Overloaded".into(),
                },
                Ok(v) => match (v.get("t").and_then(|t| t.as_str()), v.get("n")) {
                    (Some(t), _) => FrameOutcome::delta(t),
                    (None, Some(n)) => FrameOutcome::Usage(n.as_u64().unwrap_or(0) as u32),
                    _ => FrameOutcome::Skip,
                },
                Err(_) => FrameOutcome::Skip,
            }
        }
    }

    fn body(segments: Vec<&str>) -> ByteStream {
        let items: Vec<Result<Bytes>> = segments
            .into_iter()
            .map(|s| Ok(Bytes::from(s.to_string())))
            .collect();
        Box::pin(futures::stream::iter(items))
    }

    async fn collect(stream: ChunkStream) -> Vec<Result<StreamChunk>> {
        stream.collect().await
    }

    fn processor() -> StreamProcessor {
        StreamProcessor::new(Arc::new(TestParser))
    }

    #[tokio::test]
    async fn test_content_then_terminal() {
        let id = RequestId::from("r1");
        let out = collect(processor().process(
            id.clone(),
            body(vec!["data: {\"t\":\"Hi\"}\n\n", "data: [DONE]\n\n"]),
        ))
        .await;

        let chunks: Vec<StreamChunk> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(
            chunks,
            vec![StreamChunk::delta(id.clone(), "Hi"), StreamChunk::terminal(id, None)]
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_between_valid_frames() {
        let out = collect(processor().process(
            RequestId::from("r"),
            body(vec![
                "data: {\"t\":\"a\"}\n",
                "data: {broken\n",
                "data: {\"t\":\"b\"}\n",
                "data: [DONE]\n",
            ]),
        ))
        .await;

        let contents: Vec<String> = out.into_iter().map(|r| r.unwrap().content).collect();
        assert_eq!(contents, vec!["a", "b", ""]);
    }

    #[tokio::test]
    async fn test_stops_reading_after_end_signal() {
        let out = collect(processor().process(
            RequestId::from("r"),
            body(vec!["data: [DONE]\ndata: {\"t\":\"late\"}\n", "data: {\"t\":\"later\"}\n"]),
        ))
        .await;

        assert_eq!(out.len(), 1);
        assert!(out[0].as_ref().unwrap().is_complete);
    }

    #[tokio::test]
    async fn test_eof_without_end_signal_still_terminates_once() {
        let out = collect(processor().process(
            RequestId::from("r"),
            body(vec!["data: {\"t\":\"x\"}\n", "data: {\"n\":7}"]),
        ))
        .await;

        let chunks: Vec<StreamChunk> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.iter().filter(|c| c.is_complete).count(), 1);
        assert_eq!(chunks[1].token_count, Some(7));
    }

    #[tokio::test]
    async fn test_read_error_is_terminal_and_has_no_terminal_chunk() {
        let items: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"t\":\"a\"}\n")),
            Err(LlmuxError::Network("connection reset".into())),
            Ok(Bytes::from_static(b"data: [DONE]\n")),
        ];
        let out = collect(processor().process(
            RequestId::from("r"),
            Box::pin(futures::stream::iter(items)),
        ))
        .await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().content, "a");
        assert!(matches!(out[1], Err(LlmuxError::Network(_))));
    }

    #[tokio::test]
    async fn test_vendor_error_event_ends_with_one_error() {
        let out = collect(processor().process(
            RequestId::from("r"),
            body(vec![
                "data: {\"t\":\"part\"}\n",
                "data: {\"err\":true}\n",
                "data: [DONE]\n",
            ]),
        ))
        .await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().content, "part");
        match &out[1] {
            Err(e) => {
                assert_eq!(e.status(), Some(529));
                assert!(e.is_retryable());
            }
            Ok(chunk) => panic!("expected error, got {chunk:?}"),
        }
    }

    #[tokio::test]
    async fn test_frame_split_across_segments() {
        let out = collect(processor().process(
            RequestId::from("r"),
            body(vec!["da", "ta: {\"t\":\"jo", "ined\"}\n", "data: [DONE]\n"]),
        ))
        .await;
        assert_eq!(out[0].as_ref().unwrap().content, "joined");
    }

    /// Body that records when it is dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_body_released_on_end_signal() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&dropped));
        let items: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"t\":\"a\"}\ndata: [DONE]\n")),
            Ok(Bytes::from_static(b"data: {\"t\":\"b\"}\n")),
        ];
        let inner = futures::stream::iter(items);
        let body: ByteStream = Box::pin(inner.map(move |item| {
            let _keep = &flag;
            item
        }));

        let mut stream = processor().process(RequestId::from("r"), body);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.content, "a");
        assert!(dropped.load(Ordering::SeqCst), "body dropped once end signal seen");
        assert!(stream.next().await.unwrap().unwrap().is_complete);
        assert!(stream.next().await.is_none());
    }
}
