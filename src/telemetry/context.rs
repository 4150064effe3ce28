//! Request-scoped context and the W3C trace-context wire format.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ambient context for one unit of work (WS event, dispatch pass,
/// scheduler cycle). Threaded explicitly through handler → service →
/// storage → HTTP client.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub task_id: Option<i64>,
    pub subtask_id: Option<i64>,
    pub trace: Option<TraceContext>,
}

impl RequestContext {
    /// Fresh context with a generated request id and a new root trace.
    pub fn new_root() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            trace: Some(TraceContext::new_root()),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: i64, user_name: impl Into<String>) -> Self {
        self.user_id = Some(user_id);
        self.user_name = Some(user_name.into());
        self
    }

    pub fn with_task(mut self, task_id: i64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_subtask(mut self, subtask_id: i64) -> Self {
        self.subtask_id = Some(subtask_id);
        self
    }

    /// Derive the context for an outbound call: same trace, new span id.
    pub fn child(&self) -> Self {
        let mut next = self.clone();
        next.trace = self.trace.as_ref().map(TraceContext::child);
        next
    }

    /// `traceparent` header value, if this context joined a trace.
    pub fn traceparent(&self) -> Option<String> {
        self.trace.as_ref().map(TraceContext::to_traceparent)
    }
}

/// Parsed W3C trace context (`traceparent` version 00).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// 16-byte trace id, lowercase hex.
    pub trace_id: String,
    /// 8-byte parent span id, lowercase hex.
    pub span_id: String,
    /// Trace flags byte; bit 0 is "sampled".
    pub flags: u8,
    /// Opaque `tracestate` passthrough.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl TraceContext {
    pub fn new_root() -> Self {
        Self {
            trace_id: random_hex(16),
            span_id: random_hex(8),
            flags: 0x01,
            state: None,
        }
    }

    /// Same trace, fresh span id.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_hex(8),
            flags: self.flags,
            state: self.state.clone(),
        }
    }

    /// Parse a `traceparent` header. Returns `None` on any malformation;
    /// callers fall back to a new root rather than erroring.
    pub fn parse(traceparent: &str, tracestate: Option<&str>) -> Option<Self> {
        let mut parts = traceparent.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        if version != "00" || parts.next().is_some() {
            return None;
        }
        if trace_id.len() != 32 || !is_lower_hex(trace_id) || trace_id.chars().all(|c| c == '0') {
            return None;
        }
        if span_id.len() != 16 || !is_lower_hex(span_id) || span_id.chars().all(|c| c == '0') {
            return None;
        }
        let flags = u8::from_str_radix(flags, 16).ok()?;

        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            flags,
            state: tracestate.map(str::to_string),
        })
    }

    pub fn to_traceparent(&self) -> String {
        format!("00-{}-{}-{:02x}", self.trace_id, self.span_id, self.flags)
    }

    pub fn sampled(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_traceparent())
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn random_hex(bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let header = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
        let ctx = TraceContext::parse(header, None).unwrap();
        assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.span_id, "00f067aa0ba902b7");
        assert!(ctx.sampled());
        assert_eq!(ctx.to_traceparent(), header);
    }

    #[test]
    fn rejects_malformed_headers() {
        assert!(TraceContext::parse("01-abc-def-00", None).is_none());
        assert!(TraceContext::parse("00-zzzz-def-01", None).is_none());
        // all-zero trace id is invalid per the spec
        let zeros = format!("00-{}-{}-01", "0".repeat(32), "00f067aa0ba902b7");
        assert!(TraceContext::parse(&zeros, None).is_none());
    }

    #[test]
    fn child_keeps_trace_id_but_rotates_span() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(root.trace_id, child.trace_id);
        assert_ne!(root.span_id, child.span_id);
    }

    #[test]
    fn request_context_child_preserves_identity_fields() {
        let ctx = RequestContext::new_root().with_user(7, "ada").with_task(42);
        let child = ctx.child();
        assert_eq!(child.user_id, Some(7));
        assert_eq!(child.task_id, Some(42));
        assert_eq!(
            child.trace.as_ref().unwrap().trace_id,
            ctx.trace.as_ref().unwrap().trace_id
        );
    }
}
