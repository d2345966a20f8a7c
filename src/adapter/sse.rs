//! Line-buffered SSE decoding for upstream streaming responses.
//!
//! Upstream bodies arrive in arbitrary TCP-sized pieces. [`SseDecoder`]
//! reassembles complete lines across chunk boundaries and yields one
//! [`SseEvent`] per blank-line-terminated event.

/// Upper bound on a single buffered line. Longer lines are dropped.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// A decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Payload of one event's `data:` lines, joined with `\n`.
    Data(String),
    /// The `data: [DONE]` sentinel.
    Done,
}

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    overflowed: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return the events it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();

        for &byte in bytes {
            if byte == b'\n' {
                if self.overflowed {
                    self.overflowed = false;
                    self.buffer.clear();
                    continue;
                }
                let line = std::mem::take(&mut self.buffer);
                self.process_line(&line, &mut events);
            } else if !self.overflowed {
                self.buffer.push(byte);
                if self.buffer.len() > MAX_LINE_BYTES {
                    tracing::warn!(
                        limit = MAX_LINE_BYTES,
                        "SSE line exceeds buffer cap; dropping"
                    );
                    self.buffer.clear();
                    self.overflowed = true;
                }
            }
        }

        events
    }

    /// Flush a trailing line and any pending event at end of stream.
    pub fn finish(mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() && !self.overflowed {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(&line, &mut events);
        }
        self.dispatch(&mut events);
        events
    }

    fn process_line(&mut self, raw: &[u8], events: &mut Vec<SseEvent>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);

        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        // Comments and non-data fields (event:, id:, retry:) are ignored
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.data.push(value.to_string());
        }
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        if self.data.is_empty() {
            return;
        }
        let payload = self.data.join("\n");
        self.data.clear();

        if payload.trim() == "[DONE]" {
            events.push(SseEvent::Done);
        } else {
            events.push(SseEvent::Data(payload));
        }
    }
}
