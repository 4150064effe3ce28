//! Telemetry substrate: structured logging, request context propagation,
//! and W3C trace-context plumbing.
//!
//! Context is carried as an explicit value (`RequestContext`) through call
//! boundaries rather than thread-local state; spans and logs pick their
//! attributes off that value. Outbound HTTP attaches `traceparent` /
//! `tracestate`; for fire-and-forget dispatch the context is embedded in
//! the payload itself so the executor can rejoin the trace.

mod context;

pub use context::{RequestContext, TraceContext};

use crate::config::Settings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing pipeline: env-filtered JSON logs to stdout.
pub fn init(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "switchboard=info,tower_http=warn".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    if settings.otel_enabled {
        tracing::info!(
            endpoint = settings.otel_exporter_endpoint.as_deref().unwrap_or(""),
            sampler_ratio = settings.otel_sampler_ratio,
            "telemetry export enabled"
        );
    }
}

/// Decides which HTTP paths and span families are recorded.
///
/// Streaming paths produce one send/receive pair per chunk; exporting those
/// spans overwhelms the backend, so they are dropped unless explicitly
/// re-enabled.
#[derive(Debug, Clone)]
pub struct SpanFilter {
    excluded_urls: Vec<String>,
    sampler_ratio: f64,
    drop_send_receive: bool,
}

impl SpanFilter {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            excluded_urls: settings.otel_excluded_urls.clone(),
            sampler_ratio: settings.otel_sampler_ratio.clamp(0.0, 1.0),
            drop_send_receive: settings.otel_disable_send_receive_spans,
        }
    }

    /// Whether a request to `path` should produce a span.
    pub fn allows_url(&self, path: &str) -> bool {
        !self
            .excluded_urls
            .iter()
            .any(|excluded| path.starts_with(excluded.as_str()))
    }

    /// Whether per-chunk send/receive spans are recorded.
    pub fn allows_send_receive(&self) -> bool {
        !self.drop_send_receive
    }

    /// Head-based sampling decision for a new root trace.
    pub fn sample(&self) -> bool {
        if self.sampler_ratio >= 1.0 {
            return true;
        }
        if self.sampler_ratio <= 0.0 {
            return false;
        }
        rand::random::<f64>() < self.sampler_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(excluded: &[&str]) -> SpanFilter {
        SpanFilter {
            excluded_urls: excluded.iter().map(|s| (*s).to_string()).collect(),
            sampler_ratio: 1.0,
            drop_send_receive: true,
        }
    }

    #[test]
    fn excluded_url_prefixes_are_dropped() {
        let f = filter(&["/healthz", "/metrics"]);
        assert!(!f.allows_url("/healthz"));
        assert!(!f.allows_url("/metrics/scrape"));
        assert!(f.allows_url("/ws"));
    }

    #[test]
    fn send_receive_spans_suppressed_by_default() {
        assert!(!filter(&[]).allows_send_receive());
    }
}
