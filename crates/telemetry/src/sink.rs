//! Trace sinks: where flushed span trees go.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::TelemetryError;
use crate::model::{SpanKind, SpanTree};

/// Destination for flushed span trees.
#[async_trait]
pub trait TraceSink: Send + Sync {
    fn name(&self) -> &str;

    async fn export(&self, tree: &SpanTree) -> Result<(), TelemetryError>;
}

/// Pushes span trees as JSON to a tracing backend.
pub struct HttpSink {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            endpoint: endpoint.into(),
            client,
        }
    }
}

#[async_trait]
impl TraceSink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn export(&self, tree: &SpanTree) -> Result<(), TelemetryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(tree)
            .send()
            .await
            .map_err(|e| TelemetryError::Delivery(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TelemetryError::Delivery(format!(
                "tracing backend returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Logs a one-line summary per tree. Used when no endpoint is configured.
pub struct LogSink;

#[async_trait]
impl TraceSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn export(&self, tree: &SpanTree) -> Result<(), TelemetryError> {
        info!(
            trace_id = %tree.trace_id,
            session_id = %tree.session_id,
            request_id = %tree.request_id,
            spans = tree.spans.len(),
            rounds = tree.count(SpanKind::Round),
            tool_calls = tree.count(SpanKind::ToolCall),
            duration_ms = tree.duration_ms(),
            "Trace"
        );
        Ok(())
    }
}

/// Keeps trees in memory.
#[derive(Default)]
pub struct MemorySink {
    trees: Mutex<Vec<SpanTree>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trees(&self) -> Vec<SpanTree> {
        self.trees
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TraceSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn export(&self, tree: &SpanTree) -> Result<(), TelemetryError> {
        self.trees
            .lock()
            .map_err(|e| TelemetryError::Delivery(e.to_string()))?
            .push(tree.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tree() -> SpanTree {
        SpanTree {
            trace_id: "t".into(),
            project: "juris".into(),
            session_id: "s".into(),
            request_id: "r".into(),
            spans: vec![],
            flushed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_sink_keeps_trees() {
        let sink = MemorySink::new();
        sink.export(&tree()).await.unwrap();
        assert_eq!(sink.trees().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_backend_is_delivery_error() {
        let sink = HttpSink::new("http://127.0.0.1:1/v1/traces");
        assert!(matches!(
            sink.export(&tree()).await,
            Err(TelemetryError::Delivery(_))
        ));
    }
}
