//! Server-Sent Events wire format.
//!
//! Formatting turns an [`SseEvent`] into its text block; [`SseParser`]
//! does the reverse over a byte stream that may be split at arbitrary
//! points.

use bytes::{Buf, BytesMut};

pub const DEFAULT_EVENT_TYPE: &str = "message";

/// One dispatched (or to-be-sent) event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub id: String,
    pub event: String,
    /// Newline-joined `data` lines
    pub data: String,
    /// Reconnection delay in milliseconds
    pub retry: Option<u64>,
    /// A `data` field was present, even if empty
    pub has_data: bool,
}

impl Default for SseEvent {
    fn default() -> Self {
        Self {
            id: String::new(),
            event: DEFAULT_EVENT_TYPE.to_string(),
            data: String::new(),
            retry: None,
            has_data: false,
        }
    }
}

impl SseEvent {
    /// A `message` event carrying `data`.
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            has_data: true,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    pub fn to_wire(&self) -> String {
        let data = (self.has_data || !self.data.is_empty()).then_some(self.data.as_str());
        format_event(&self.id, &self.event, data, self.retry)
    }

    fn is_dispatchable(&self) -> bool {
        self.has_data || !self.id.is_empty() || self.retry.is_some()
    }
}

/// Formats one event block.
///
/// Fields are written as `id`, `event`, `retry`, then one `data:` line per
/// line of the payload, followed by the blank-line terminator. Empty `id`
/// and `event` are omitted, as is `data` when `None`.
pub fn format_event(id: &str, event: &str, data: Option<&str>, retry: Option<u64>) -> String {
    let mut out = String::with_capacity(32 + data.map_or(0, str::len));

    if !id.is_empty() {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    if !event.is_empty() {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    if let Some(retry) = retry {
        out.push_str(&format!("retry: {retry}\n"));
    }
    if let Some(data) = data {
        for line in data.split('\n') {
            out.push_str("data: ");
            out.push_str(line.strip_suffix('\r').unwrap_or(line));
            out.push('\n');
        }
    }

    out.push('\n');
    out
}

/// Incremental event-stream parser.
///
/// Bytes that do not yet form a complete event stay buffered until the
/// next call to [`SseParser::feed`].
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((block_end, consumed)) = find_event_boundary(&self.buffer) {
            let block = String::from_utf8_lossy(&self.buffer[..block_end]).into_owned();
            self.buffer.advance(consumed);

            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Bytes buffered towards the next event.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Finds the first blank line. Line endings may be `\n` or `\r\n`, mixed.
///
/// Returns `(block_end, consumed)` where the event block is
/// `buf[..block_end]` and `consumed` includes the terminator.
fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    for (i, &b) in buf.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        let line = &buf[line_start..i];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return Some((line_start, i + 1));
        }
        line_start = i + 1;
    }
    None
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data = String::new();

    for line in block.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                data.push_str(value);
                data.push('\n');
                event.has_data = true;
            }
            "id" => event.id = value.to_string(),
            "event" => event.event = value.to_string(),
            "retry" => {
                if let Ok(retry) = value.trim().parse() {
                    event.retry = Some(retry);
                }
            }
            _ => {}
        }
    }

    if data.ends_with('\n') {
        data.pop();
    }
    event.data = data;

    event.is_dispatchable().then_some(event)
}
