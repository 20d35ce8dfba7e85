//! Request tracing for juris.
//!
//! Every request gets a span tree (request → rounds → engine and tool
//! calls → synthesis). Trees are flushed into a bounded buffer and exported
//! in the background; delivery is best-effort and never touches the answer
//! path.

pub mod emitter;
pub mod model;
pub mod sink;

pub use emitter::{RequestTrace, SpanHandle, TelemetryStats, TraceEmitter};
pub use model::{AttrValue, Attributes, Span, SpanKind, SpanStatus, SpanTree};
pub use sink::{HttpSink, LogSink, MemorySink, TraceSink};

use std::sync::Arc;

use juris_config::TelemetryConfig;

/// Errors from the telemetry subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("unknown span id: {0}")]
    UnknownSpan(String),

    #[error("trace delivery failed: {0}")]
    Delivery(String),
}

/// Pick the sink for the configured endpoint.
pub fn sink_from_config(config: &TelemetryConfig) -> Arc<dyn TraceSink> {
    match &config.endpoint {
        Some(endpoint) => Arc::new(HttpSink::new(endpoint)),
        None => Arc::new(LogSink),
    }
}
