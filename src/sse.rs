//! Incremental SSE parser for LLM observability.
//!
//! Turns an arbitrarily chunked byte stream into an ordered sequence of
//! typed events. The parser is stateful across calls so that lines split
//! between network reads are reassembled transparently; data payloads are
//! passed through raw, never JSON-validated.

/// A single parsed SSE event from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Ordinal within this request's stream, starting at 1.
    pub index: i32,
    /// message_start, content_block_delta, message_delta, etc.
    pub event_type: String,
    /// Raw payload of the `data:` line.
    pub raw_data: String,
    /// Byte length of the data line including its terminating newline.
    pub raw_bytes: i32,
}

/// Maintains state across chunks to handle partial SSE lines.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event_index: i32,
    event_type: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process raw bytes from the stream and yield complete SSE events.
    ///
    /// Bytes past the last `\n` stay buffered for the next call.
    pub fn parse_chunk(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(idx) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=idx).collect();
            let mut line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                // Empty line = event separator, reset event type
                self.event_type.clear();
                continue;
            }

            if let Some(rest) = line.strip_prefix("event: ") {
                self.event_type = rest.trim().to_string();
                continue;
            }

            if let Some(data) = line.strip_prefix("data: ") {
                self.event_index += 1;

                let event_type = if self.event_type.is_empty() {
                    infer_event_type(data).to_string()
                } else {
                    self.event_type.clone()
                };

                events.push(SseEvent {
                    index: self.event_index,
                    event_type,
                    raw_bytes: (line.len() + 1) as i32,
                    raw_data: data.to_string(),
                });
            }
        }

        events
    }
}

/// Extract the "type" field from JSON data without full parsing.
fn infer_event_type(data: &str) -> &str {
    let Some(idx) = data.find("\"type\"") else {
        return "unknown";
    };

    let rest = data[idx + 6..]
        .trim_start_matches([' ', '\t', ':'])
        .trim_start_matches([' ', '\t']);

    if let Some(quoted) = rest.strip_prefix('"') {
        if let Some(end) = quoted.find('"') {
            return &quoted[..end];
        }
    }
    "unknown"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut SseParser, input: &str) -> Vec<SseEvent> {
        parser.parse_chunk(input.as_bytes())
    }

    // ── Basic framing ───────────────────────────────────────────

    #[test]
    fn test_single_event_with_explicit_type() {
        let mut p = SseParser::new();
        let events = parse_all(&mut p, "event: message_start\ndata: {\"a\":1}\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].index, 1);
        assert_eq!(events[0].event_type, "message_start");
        assert_eq!(events[0].raw_data, "{\"a\":1}");
    }

    #[test]
    fn test_indices_are_contiguous_from_one() {
        let mut p = SseParser::new();
        let stream = "event: a\ndata: 1\n\nevent: b\ndata: 2\n\nevent: c\ndata: 3\n\n";
        let events = parse_all(&mut p, stream);

        let indices: Vec<i32> = events.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_line_resets_event_type() {
        let mut p = SseParser::new();
        let events = parse_all(&mut p, "event: ping\ndata: one\n\ndata: {\"type\":\"pong\"}\n\n");

        assert_eq!(events[0].event_type, "ping");
        // After the separator the pending type is cleared, so the second
        // event falls back to inference.
        assert_eq!(events[1].event_type, "pong");
    }

    #[test]
    fn test_crlf_lines() {
        let mut p = SseParser::new();
        let events = parse_all(&mut p, "event: msg\r\ndata: hello\r\n\r\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "msg");
        assert_eq!(events[0].raw_data, "hello");
    }

    #[test]
    fn test_comments_and_unknown_fields_ignored() {
        let mut p = SseParser::new();
        let events = parse_all(
            &mut p,
            ": keep-alive\nid: 7\nretry: 3000\nevent: e\ndata: x\n\n",
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].raw_data, "x");
    }

    #[test]
    fn test_raw_bytes_counts_line_plus_newline() {
        let mut p = SseParser::new();
        let events = parse_all(&mut p, "data: abc\n");

        // "data: abc" is 9 bytes, +1 for the newline
        assert_eq!(events[0].raw_bytes, 10);
    }

    // ── Chunk-boundary transparency ─────────────────────────────

    #[test]
    fn test_partial_line_buffered_across_calls() {
        let mut p = SseParser::new();
        assert!(p.parse_chunk(b"event: mess").is_empty());
        assert!(p.parse_chunk(b"age_start\ndata: {\"x\"").is_empty());
        let events = p.parse_chunk(b":1}\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "message_start");
        assert_eq!(events[0].raw_data, "{\"x\":1}");
    }

    #[test]
    fn test_split_at_every_byte_matches_whole_parse() {
        let stream = "event: message_start\ndata: {\"type\":\"message_start\"}\n\n\
                      event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi\"}}\n\n\
                      data: {\"type\":\"message_stop\"}\n\n";

        let mut whole = SseParser::new();
        let expected = whole.parse_chunk(stream.as_bytes());
        assert_eq!(expected.len(), 3);

        let bytes = stream.as_bytes();
        for split in 0..=bytes.len() {
            let mut p = SseParser::new();
            let mut events = p.parse_chunk(&bytes[..split]);
            events.extend(p.parse_chunk(&bytes[split..]));
            assert_eq!(events, expected, "split at byte {split} diverged");
        }
    }

    #[test]
    fn test_trailing_partial_frame_stays_buffered() {
        let mut p = SseParser::new();
        let events = p.parse_chunk(b"data: complete\ndata: partial");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].raw_data, "complete");
        // The partial line is emitted once its newline arrives.
        let more = p.parse_chunk(b"\n");
        assert_eq!(more.len(), 1);
        assert_eq!(more[0].raw_data, "partial");
        assert_eq!(more[0].index, 2);
    }

    // ── Event-type inference ────────────────────────────────────

    #[test]
    fn test_infer_type_from_json_data() {
        let mut p = SseParser::new();
        let events = parse_all(&mut p, "data: {\"type\":\"content_block_stop\",\"index\":0}\n");

        assert_eq!(events[0].event_type, "content_block_stop");
    }

    #[test]
    fn test_infer_type_with_spacing() {
        assert_eq!(infer_event_type("{\"type\" : \"message_delta\"}"), "message_delta");
        assert_eq!(infer_event_type("{ \"type\":\t\"ping\" }"), "ping");
    }

    #[test]
    fn test_infer_type_missing_or_malformed() {
        assert_eq!(infer_event_type("{\"kind\":\"x\"}"), "unknown");
        assert_eq!(infer_event_type("not json at all"), "unknown");
        assert_eq!(infer_event_type("{\"type\": 42}"), "unknown");
        assert_eq!(infer_event_type("{\"type\":\"unterminated"), "unknown");
    }

    #[test]
    fn test_explicit_event_type_wins_over_inference() {
        let mut p = SseParser::new();
        let events = parse_all(&mut p, "event: outer\ndata: {\"type\":\"inner\"}\n\n");

        assert_eq!(events[0].event_type, "outer");
    }

    #[test]
    fn test_invalid_json_data_passed_through_raw() {
        let mut p = SseParser::new();
        let events = parse_all(&mut p, "event: e\ndata: {broken json\n\n");

        assert_eq!(events[0].raw_data, "{broken json");
    }
}
