//! W3C-compliant Server-Sent Events decoder.
//!
//! Incremental parser over a byte-chunk sequence: feed chunks as they
//! arrive, collect the events each chunk completes, and call
//! [`SseDecoder::finish`] at end of stream for a trailing event. Chunk
//! boundaries are invisible to the output - feeding a stream byte-by-byte
//! yields exactly the events of feeding it whole, including a `\r\n` split
//! across two chunks.
//!
//! The decoder is provider-agnostic; sentinel payloads such as `[DONE]`
//! pass through as ordinary data events.

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A single decoded Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `"message"` unless the stream set one.
    pub event_type: String,
    /// Data payload; multiple `data:` lines join with `\n`.
    pub data: String,
    /// Last seen id; persists across events until changed.
    pub id: String,
    /// Reconnection delay, when the stream sent a parseable integer.
    pub retry: Option<u64>,
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Raw text carried across chunk boundaries (tail without a newline,
    /// possibly ending in a held-back `\r`).
    buffer: String,
    event_type: Option<String>,
    data_lines: Vec<String>,
    id: String,
    retry: Option<u64>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte chunk; returns the events it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        // Hold back a trailing CR: it may be the first half of a CRLF whose
        // LF arrives in the next chunk.
        let mut work = std::mem::take(&mut self.buffer);
        let holdover = if work.ends_with('\r') {
            work.pop();
            true
        } else {
            false
        };

        let normalized = work.replace("\r\n", "\n").replace('\r', "\n");

        let mut events = Vec::new();
        let mut rest = normalized.as_str();
        while let Some(pos) = rest.find('\n') {
            let line = &rest[..pos];
            rest = &rest[pos + 1..];
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }

        self.buffer = rest.to_string();
        if holdover {
            self.buffer.push('\r');
        }
        events
    }

    /// End of stream: parse any trailing partial line and dispatch the
    /// pending event if data was accumulated.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let mut trailing = std::mem::take(&mut self.buffer);
        if trailing.ends_with('\r') {
            trailing.pop();
        }
        let trailing = trailing.replace("\r\n", "\n").replace('\r', "\n");

        let mut dispatched = None;
        for line in trailing.split('\n') {
            if let Some(event) = self.process_line(line) {
                // A blank line in the trailing text still dispatches.
                dispatched = Some(event);
            }
        }
        if dispatched.is_some() {
            return dispatched;
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.id = value.to_string();
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
        None
    }

    /// Emit the pending event when data has accumulated; event type and
    /// data reset, id and retry persist.
    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = if self.data_lines.is_empty() {
            None
        } else {
            Some(SseEvent {
                event_type: self
                    .event_type
                    .clone()
                    .unwrap_or_else(|| "message".to_string()),
                data: self.data_lines.join("\n"),
                id: self.id.clone(),
                retry: self.retry,
            })
        };
        self.event_type = None;
        self.data_lines.clear();
        event
    }
}

/// Decode a complete byte sequence in one call.
pub fn decode_all(bytes: &[u8]) -> Vec<SseEvent> {
    let mut decoder = SseDecoder::new();
    let mut events = decoder.feed(bytes);
    events.extend(decoder.finish());
    events
}

/// Re-encode an event with standard SSE framing.
pub fn encode_event(event: &SseEvent) -> String {
    let mut out = String::new();
    if event.event_type != "message" {
        out.push_str("event: ");
        out.push_str(&event.event_type);
        out.push('\n');
    }
    if !event.id.is_empty() {
        out.push_str("id: ");
        out.push_str(&event.id);
        out.push('\n');
    }
    if let Some(retry) = event.retry {
        out.push_str(&format!("retry: {retry}\n"));
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
