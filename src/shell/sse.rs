//! Incremental `text/event-stream` frame parser.
//!
//! Feed raw bytes as they arrive; complete frames come out. Handles
//! frames split across chunk boundaries, CRLF line endings, comment
//! lines, and multi-line `data:` fields.

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of bytes, returning every frame completed by it.
    /// Invalid UTF-8 is replaced rather than erroring; the payloads are
    /// JSON and a corrupt frame will fail JSON parsing downstream.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut frames = Vec::new();
        loop {
            let Some(boundary) = find_frame_boundary(&self.buffer) else {
                break;
            };
            let raw: String = self.buffer.drain(..boundary.end).collect();
            if let Some(frame) = parse_frame(&raw[..boundary.body]) {
                frames.push(frame);
            }
        }
        frames
    }
}

struct Boundary {
    /// Length of the frame body (exclusive of the blank-line separator).
    body: usize,
    /// Total bytes to drain including the separator.
    end: usize,
}

fn find_frame_boundary(buffer: &str) -> Option<Boundary> {
    // A frame ends at the first blank line: \n\n or \r\n\r\n.
    let lf = buffer.find("\n\n").map(|i| Boundary { body: i, end: i + 2 });
    let crlf = buffer
        .find("\r\n\r\n")
        .map(|i| Boundary { body: i, end: i + 4 });
    match (lf, crlf) {
        (Some(a), Some(b)) if b.body < a.body => Some(b),
        (Some(a), _) => Some(a),
        (None, b) => b,
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.starts_with(':') {
            continue; // comment / keep-alive
        }
        if let Some(value) = field(line, "event") {
            event = Some(value.to_string());
        } else if let Some(value) = field(line, "data") {
            data_lines.push(value);
        }
        // id: and retry: fields are not used by this protocol.
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
