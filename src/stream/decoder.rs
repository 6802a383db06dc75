//! SSE line decoder.
//!
//! Holds the state that must survive between reads: undecoded UTF-8 tail
//! bytes, the partial last line, and a pending `event:` name.

use super::SseFrame;

/// Stateful decoder from body segments to `SseFrame`s.
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Bytes of a multi-byte character cut off by the read boundary.
    utf8_tail: Vec<u8>,
    /// Text after the last newline seen so far.
    line_buffer: String,
    /// Event name waiting for its `data:` line.
    pending_event: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one body segment and return every frame it completes.
    pub fn feed(&mut self, segment: &[u8]) -> Vec<SseFrame> {
        self.decode_utf8(segment);

        let mut frames = Vec::new();
        while let Some(newline_pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline_pos).collect();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if !self.utf8_tail.is_empty() {
            let tail = std::mem::take(&mut self.utf8_tail);
            self.line_buffer.push_str(&String::from_utf8_lossy(&tail));
        }

        let line = std::mem::take(&mut self.line_buffer);
        let frame = self.process_line(&line);
        self.pending_event = None;
        frame.into_iter().collect()
    }

    /// Append decoded text, keeping an incomplete trailing sequence for the
    /// next read. Invalid sequences become U+FFFD.
    fn decode_utf8(&mut self, segment: &[u8]) {
        let mut bytes = std::mem::take(&mut self.utf8_tail);
        bytes.extend_from_slice(segment);

        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.line_buffer.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // safe: valid_up_to marks a valid prefix
                    self.line_buffer
                        .push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            self.line_buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.utf8_tail = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        let line = line.trim_end_matches(['\n', '\r']);

        // Blank line: event separator
        if line.trim().is_empty() {
            self.pending_event = None;
            return None;
        }

        // Comment / heartbeat
        if line.starts_with(':') {
            return None;
        }

        if let Some(event) = field_value(line, "event") {
            self.pending_event = Some(event.to_string());
            return None;
        }

        if let Some(data) = field_value(line, "data") {
            if data.trim().is_empty() {
                return None;
            }
            return Some(SseFrame {
                event: self.pending_event.take(),
                data: data.to_string(),
            });
        }

        // id:, retry: and anything else
        None
    }
}

/// Value of an SSE field line, with the single optional leading space removed.
fn field_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: {\"a\":1}\n\n");
        assert_eq!(frames, vec![SseFrame::data("{\"a\":1}")]);
    }

    #[test]
    fn test_partial_line_is_held_until_newline() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"a\"").is_empty());
        assert!(decoder.feed(b":1}").is_empty());
        let frames = decoder.feed(b"\n");
        assert_eq!(frames, vec![SseFrame::data("{\"a\":1}")]);
    }

    #[test]
    fn test_event_pairs_with_next_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(
            b"event: message_start\ndata: {\"type\":\"message_start\"}\n\ndata: plain\n",
        );
        assert_eq!(
            frames,
            vec![
                SseFrame::with_event("message_start", "{\"type\":\"message_start\"}"),
                SseFrame::data("plain"),
            ]
        );
    }

    #[test]
    fn test_heartbeats_and_blank_data_are_skipped() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b": keep-alive\n\ndata:\nid: 7\nretry: 100\ndata: x\n");
        assert_eq!(frames, vec![SseFrame::data("x")]);
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"event: ping\r\ndata: {}\r\n\r\n");
        assert_eq!(frames, vec![SseFrame::with_event("ping", "{}")]);
    }

    #[test]
    fn test_multibyte_char_split_across_reads() {
        let text = "data: héllo 👋\n".as_bytes();
        // split inside the 4-byte emoji
        let split = text.len() - 3;
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(&text[..split]).is_empty());
        let frames = decoder.feed(&text[split..]);
        assert_eq!(frames, vec![SseFrame::data("héllo 👋")]);
    }

    #[test]
    fn test_multibyte_char_split_byte_by_byte() {
        let text = "data: 日本\n".as_bytes();
        let mut decoder = SseDecoder::new();
        let mut frames = Vec::new();
        for byte in text {
            frames.extend(decoder.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(frames, vec![SseFrame::data("日本")]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced_not_fatal() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: a\xffb\n");
        assert_eq!(frames, vec![SseFrame::data("a\u{FFFD}b")]);
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), vec![SseFrame::data("[DONE]")]);
        assert!(decoder.finish().is_empty());
    }
}
