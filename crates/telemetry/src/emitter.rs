//! The trace emitter.
//!
//! Spans are collected per `(session_id, request_id)` while a request runs.
//! `flush` closes the tree and hands it to a bounded export buffer; a
//! background exporter drains the buffer into a [`TraceSink`]. Nothing here
//! awaits the sink on the caller's path.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use juris_config::TelemetryConfig;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::TelemetryError;
use crate::model::{Attributes, Span, SpanKind, SpanStatus, SpanTree};
use crate::sink::TraceSink;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TraceKey {
    session_id: String,
    request_id: String,
}

/// Reference to an open span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanHandle {
    key: TraceKey,
    span_id: String,
}

impl SpanHandle {
    pub fn span_id(&self) -> &str {
        &self.span_id
    }
}

/// Counters exposed for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetryStats {
    pub open_traces: usize,
    pub buffered_trees: usize,
    pub exported_trees: u64,
    pub dropped_spans: u64,
    pub delivery_failures: u64,
}

struct Inner {
    project: String,
    enabled: bool,
    capacity: usize,
    open: Mutex<HashMap<TraceKey, Vec<Span>>>,
    buffer: Mutex<VecDeque<SpanTree>>,
    ready: Notify,
    exported: AtomicU64,
    dropped_spans: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Collects span trees and exports them best-effort. Cheap to clone.
#[derive(Clone)]
pub struct TraceEmitter {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TraceEmitter {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                project: config.project.clone(),
                enabled: config.enabled,
                capacity: config.buffer_capacity.max(1),
                open: Mutex::new(HashMap::new()),
                buffer: Mutex::new(VecDeque::new()),
                ready: Notify::new(),
                exported: AtomicU64::new(0),
                dropped_spans: AtomicU64::new(0),
                delivery_failures: AtomicU64::new(0),
            }),
        }
    }

    /// A view of one request's trace.
    pub fn trace(&self, session_id: &str, request_id: &str) -> RequestTrace {
        RequestTrace {
            emitter: self.clone(),
            key: TraceKey {
                session_id: session_id.to_string(),
                request_id: request_id.to_string(),
            },
        }
    }

    fn start(&self, key: &TraceKey, kind: SpanKind, name: &str, parent: Option<&SpanHandle>) -> SpanHandle {
        let mut span = Span::new(kind, name);
        if let Some(parent) = parent {
            span = span.with_parent(parent.span_id.clone());
        }
        let handle = SpanHandle {
            key: key.clone(),
            span_id: span.id.clone(),
        };
        lock(&self.inner.open).entry(key.clone()).or_default().push(span);
        handle
    }

    /// Close a span with its status and attributes.
    pub fn end_span(
        &self,
        handle: &SpanHandle,
        status: SpanStatus,
        attributes: Attributes,
    ) -> Result<(), TelemetryError> {
        let mut open = lock(&self.inner.open);
        let span = open
            .get_mut(&handle.key)
            .and_then(|spans| spans.iter_mut().find(|s| s.id == handle.span_id))
            .ok_or_else(|| TelemetryError::UnknownSpan(handle.span_id.clone()))?;
        if !span.is_closed() {
            span.end(status, attributes);
        }
        Ok(())
    }

    /// Close the request's span tree and queue it for export.
    ///
    /// Spans still open are closed with an error status. Never blocks on
    /// the sink.
    pub fn flush(&self, session_id: &str, request_id: &str) {
        let key = TraceKey {
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
        };
        let Some(spans) = lock(&self.inner.open).remove(&key) else {
            return;
        };
        if !self.inner.enabled || spans.is_empty() {
            return;
        }

        let tree = close_tree(&self.inner.project, key, spans);
        debug!(
            trace_id = %tree.trace_id,
            spans = tree.spans.len(),
            "Trace flushed"
        );
        self.enqueue(tree);
    }

    fn enqueue(&self, tree: SpanTree) {
        {
            let mut buffer = lock(&self.inner.buffer);
            while buffer.len() >= self.inner.capacity {
                if let Some(oldest) = buffer.pop_front() {
                    self.inner
                        .dropped_spans
                        .fetch_add(oldest.spans.len() as u64, Ordering::Relaxed);
                }
            }
            buffer.push_back(tree);
        }
        self.inner.ready.notify_one();
    }

    /// Take every buffered tree without exporting it.
    pub fn drain(&self) -> Vec<SpanTree> {
        lock(&self.inner.buffer).drain(..).collect()
    }

    /// Spawn the background exporter. It drains the buffer into `sink`
    /// until `shutdown` fires, then exports what is left and exits.
    pub fn spawn_exporter(
        &self,
        sink: Arc<dyn TraceSink>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let emitter = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = emitter.inner.ready.notified() => {}
                    _ = shutdown.cancelled() => {
                        emitter.export_all(sink.as_ref()).await;
                        return;
                    }
                }
                emitter.export_all(sink.as_ref()).await;
            }
        })
    }

    async fn export_all(&self, sink: &dyn TraceSink) {
        for tree in self.drain() {
            match sink.export(&tree).await {
                Ok(()) => {
                    self.inner.exported.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.inner.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(sink = %sink.name(), trace_id = %tree.trace_id, error = %e, "Trace delivery failed");
                }
            }
        }
    }

    pub fn stats(&self) -> TelemetryStats {
        TelemetryStats {
            open_traces: lock(&self.inner.open).len(),
            buffered_trees: lock(&self.inner.buffer).len(),
            exported_trees: self.inner.exported.load(Ordering::Relaxed),
            dropped_spans: self.inner.dropped_spans.load(Ordering::Relaxed),
            delivery_failures: self.inner.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

/// Close open spans and make sure the tree has exactly one root.
fn close_tree(project: &str, key: TraceKey, mut spans: Vec<Span>) -> SpanTree {
    for span in spans.iter_mut().filter(|s| !s.is_closed()) {
        let mut attrs = Attributes::new();
        attrs.insert("unclosed".into(), true.into());
        span.end(SpanStatus::Error, attrs);
    }

    let root_id = spans
        .iter()
        .find(|s| s.parent_id.is_none())
        .map(|s| s.id.clone());
    if let Some(root_id) = root_id {
        let ids: Vec<String> = spans.iter().map(|s| s.id.clone()).collect();
        for span in spans.iter_mut().filter(|s| s.id != root_id) {
            let dangling = span.parent_id.as_ref().is_none_or(|p| !ids.contains(p));
            if dangling {
                span.parent_id = Some(root_id.clone());
            }
        }
    }

    SpanTree {
        trace_id: Uuid::new_v4().to_string(),
        project: project.to_string(),
        session_id: key.session_id,
        request_id: key.request_id,
        spans,
        flushed_at: Utc::now(),
    }
}

/// One request's trace.
#[derive(Clone)]
pub struct RequestTrace {
    emitter: TraceEmitter,
    key: TraceKey,
}

impl RequestTrace {
    pub fn start_span(&self, kind: SpanKind, name: &str, parent: Option<&SpanHandle>) -> SpanHandle {
        self.emitter.start(&self.key, kind, name, parent)
    }

    /// Close a span; unknown handles are logged and ignored.
    pub fn end_span(&self, handle: &SpanHandle, status: SpanStatus, attributes: Attributes) {
        if let Err(e) = self.emitter.end_span(handle, status, attributes) {
            debug!(error = %e, "Ignoring span end");
        }
    }

    pub fn flush(&self) {
        self.emitter.flush(&self.key.session_id, &self.key.request_id);
    }

    pub fn request_id(&self) -> &str {
        &self.key.request_id
    }
}
