//! Incremental parser for `text/event-stream` bodies.
//!
//! Follows the WHATWG event-stream format: `field: value` lines, repeated
//! `data:` fields joined with a single newline, `:`-prefixed comment lines,
//! events terminated by a blank line. Partial lines across chunk boundaries
//! are buffered, so the parser can be fed straight from a byte stream.

/// A parsed server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type from the `event:` field, if any.
    pub event: Option<String>,
    /// Concatenated `data:` payload.
    pub data: String,
    /// Last non-empty `id:` field seen in the event.
    pub id: Option<String>,
}

/// Incremental SSE parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
    has_data: bool,
}

impl SseParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the stream, returning every event completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.find(':') {
                Some(idx) => {
                    let value = &line[idx + 1..];
                    (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
                },
                None => (line, ""),
            };

            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => {
                    self.data_lines.push(value.to_string());
                    self.has_data = true;
                },
                "id" if !value.is_empty() => self.id = Some(value.to_string()),
                _ => {},
            }
        }

        events
    }

    /// Complete the event under construction, if it has any content.
    fn take_event(&mut self) -> Option<SseEvent> {
        if self.event.is_none() && !self.has_data && self.id.is_none() {
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
            id: self.id.take(),
        };
        self.data_lines.clear();
        self.has_data = false;
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Inverse of parsing, used for the round-trip property.
    fn format_sse_event(event: &SseEvent) -> String {
        let mut out = String::new();
        if let Some(kind) = &event.event {
            out.push_str(&format!("event: {kind}\n"));
        }
        if let Some(id) = &event.id {
            out.push_str(&format!("id: {id}\n"));
        }
        for line in event.data.split('\n') {
            out.push_str(&format!("data: {line}\n"));
        }
        out.push('\n');
        out
    }

    #[test]
    fn parses_endpoint_event() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: endpoint\ndata: /rpc\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("endpoint".into()),
                data: "/rpc".into(),
                id: None,
            }]
        );
    }

    #[test]
    fn multi_line_data_joined_with_single_newlines() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: line1\ndata: line2\ndata: line3\n\n");
        assert_eq!(events[0].data, "line1\nline2\nline3");
    }

    #[test]
    fn comment_only_frame_yields_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.feed(":foo\n\n").is_empty());
    }

    #[test]
    fn id_field_is_captured() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: message\nid: 7\ndata: {}\n\n");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn empty_id_is_ignored() {
        let mut parser = SseParser::new();
        let events = parser.feed("id:\ndata: x\n\n");
        assert_eq!(events[0].id, None);
    }

    #[test]
    fn events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("event: mes").is_empty());
        assert!(parser.feed("sage\ndata: {\"a\"").is_empty());
        let events = parser.feed(": 1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\": 1}");
    }

    #[test]
    fn crlf_line_endings_accepted() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: ping\r\ndata: {}\r\n\r\n");
        assert_eq!(events[0].event.as_deref(), Some("ping"));
    }

    #[test]
    fn data_without_leading_space() {
        let mut parser = SseParser::new();
        let events = parser.feed("data:tight\n\n");
        assert_eq!(events[0].data, "tight");
    }

    #[test]
    fn round_trips_through_formatting() {
        let cases = vec![
            SseEvent {
                event: Some("message".into()),
                data: "{\"jsonrpc\":\"2.0\"}".into(),
                id: Some("42".into()),
            },
            SseEvent {
                event: Some("endpoint".into()),
                data: "/messages?session=abc".into(),
                id: None,
            },
            SseEvent {
                event: None,
                data: "first\nsecond\nthird".into(),
                id: Some("e-9".into()),
            },
        ];
        for case in cases {
            let mut parser = SseParser::new();
            let events = parser.feed(&format_sse_event(&case));
            assert_eq!(events, vec![case]);
        }
    }
}
