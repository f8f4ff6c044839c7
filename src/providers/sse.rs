use serde_json::Value;

/// A parsed Server-Sent Event.
#[derive(Debug)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: Option<Value>,
}

/// Incremental SSE decoder: feed raw byte chunks, get complete events back.
/// Partial events stay buffered until their terminating blank line arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        // Events end at a blank line. Keep the trailing partial event.
        let Some(split_at) = self.buffer.rfind("\n\n") else {
            return Vec::new();
        };
        let complete = self.buffer[..split_at + 2].to_string();
        self.buffer.drain(..split_at + 2);
        parse_sse_chunk(&complete)
    }

    /// Drain whatever is left at end of stream (a final event without its
    /// trailing blank line).
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            Vec::new()
        } else {
            parse_sse_chunk(&rest)
        }
    }
}

/// Parse a chunk of SSE text into events.
/// SSE events are separated by double newlines. Each event has optional
/// `event:` and `data:` fields; a `[DONE]` payload parses to `data: None`.
pub fn parse_sse_chunk(chunk: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    let mut current_event_type: Option<String> = None;
    let mut current_data = String::new();

    let mut push_event = |event_type: Option<String>, data: &str| {
        let data = data.trim();
        let parsed = if data == "[DONE]" {
            None
        } else {
            serde_json::from_str::<Value>(data).ok()
        };
        events.push(SseEvent {
            event_type,
            data: parsed,
        });
    };

    for line in chunk.lines() {
        if line.is_empty() {
            if !current_data.is_empty() {
                push_event(current_event_type.take(), &current_data);
                current_data.clear();
            }
            current_event_type = None;
        } else if let Some(event_type) = line.strip_prefix("event: ") {
            current_event_type = Some(event_type.trim().to_string());
        } else if let Some(data) = line.strip_prefix("data: ") {
            if !current_data.is_empty() {
                current_data.push('\n');
            }
            current_data.push_str(data);
        }
    }

    if !current_data.is_empty() {
        push_event(current_event_type, &current_data);
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_event() {
        let chunk = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n";
        let events = parse_sse_chunk(chunk);
        assert_eq!(events.len(), 1);
        assert!(events[0].data.is_some());
    }

    #[test]
    fn parse_done_sentinel() {
        let events = parse_sse_chunk("data: [DONE]\n\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].data.is_none());
    }

    #[test]
    fn parse_multiple_events() {
        let chunk = "data: {\"a\":1}\n\ndata: {\"b\":2}\n\n";
        let events = parse_sse_chunk(chunk);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn decoder_buffers_partial_events() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"a\"").is_empty());
        let events = decoder.feed(b":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.as_ref().unwrap()["a"], 1);
    }

    #[test]
    fn decoder_finish_drains_tail() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"data: {\"tail\":true}");
        let events = decoder.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.as_ref().unwrap()["tail"], true);
    }

    #[test]
    fn event_type_is_captured() {
        let events = parse_sse_chunk("event: error\ndata: {\"message\":\"x\"}\n\n");
        assert_eq!(events[0].event_type.as_deref(), Some("error"));
    }
}
