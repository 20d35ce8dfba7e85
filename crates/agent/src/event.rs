//! Response events streamed to the chat UI.
//!
//! Events for one request arrive in the order the orchestrator produced
//! them. `done` or `error` is always the last event.

use juris_core::session::Citation;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::orchestrator::{CycleError, CycleOutcome};

/// Events emitted while answering one request.
///
/// SSE names:
/// - `partial_text`: answer text as the engine produces it
/// - `citation_added`: a passage the final answer relies on
/// - `tool_call_started`: a corpus search or case lookup is starting
/// - `tool_call_finished`: the call completed or failed
/// - `done`: the final answer
/// - `error`: a short user-facing failure message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEvent {
    PartialText {
        content: String,
    },

    CitationAdded {
        citation: Citation,
    },

    /// `query` is the search query, or the citation or URL of a lookup.
    /// `top_k` is zero for lookups.
    ToolCallStarted {
        id: String,
        tool: String,
        query: String,
        top_k: usize,
    },

    ToolCallFinished {
        id: String,
        passages: usize,
        latency_ms: u64,
        success: bool,
    },

    /// The final answer. `answer` is the display text; partial text events
    /// are progress only.
    Done {
        answer: String,
        citations: Vec<Citation>,
        partial_evidence: bool,
        degraded: bool,
        fallback: bool,
        rounds: u32,
        tool_calls: usize,
    },

    Error {
        message: String,
    },
}

impl ResponseEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PartialText { .. } => "partial_text",
            Self::CitationAdded { .. } => "citation_added",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallFinished { .. } => "tool_call_finished",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn done(outcome: &CycleOutcome) -> Self {
        Self::Done {
            answer: outcome.answer.clone(),
            citations: outcome.citations.clone(),
            partial_evidence: outcome.partial_evidence,
            degraded: outcome.degraded,
            fallback: outcome.fallback,
            rounds: outcome.rounds,
            tool_calls: outcome.tool_calls.len(),
        }
    }
}

/// Where the orchestrator sends events.
///
/// Only non-terminal events go through [`EventSink::emit`]; the single
/// terminal event is sent by [`EventSink::finish`], which consumes the sink.
pub struct EventSink {
    tx: Option<mpsc::Sender<ResponseEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ResponseEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that drops every event, for blocking callers.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Send a progress event. A receiver that went away is not an error.
    pub async fn emit(&self, event: ResponseEvent) {
        debug_assert!(!event.is_terminal(), "terminal events go through finish()");
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }

    /// Send the terminal event for a finished cycle.
    pub async fn finish(self, result: &Result<CycleOutcome, CycleError>) {
        let event = match result {
            Ok(outcome) => ResponseEvent::done(outcome),
            Err(e) => ResponseEvent::Error {
                message: e.user_message().to_string(),
            },
        };
        if let Some(tx) = self.tx {
            let _ = tx.send(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_partial_text() {
        let event = ResponseEvent::PartialText {
            content: "On 1953".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"partial_text""#));
        assert!(json.contains(r#""content":"On 1953""#));
    }

    #[test]
    fn event_serialization_tool_call_started() {
        let event = ResponseEvent::ToolCallStarted {
            id: "call_1".into(),
            tool: "search_caselaw".into(),
            query: "Konrad v State".into(),
            top_k: 5,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_call_started");
        assert_eq!(json["top_k"], 5);
        assert_eq!(json["tool"], "search_caselaw");
    }

    #[test]
    fn event_roundtrip_done() {
        let event = ResponseEvent::Done {
            answer: "Affirmed [1].".into(),
            citations: vec![],
            partial_evidence: true,
            degraded: false,
            fallback: false,
            rounds: 2,
            tool_calls: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: ResponseEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn event_type_names() {
        assert_eq!(
            ResponseEvent::Error { message: "x".into() }.event_type(),
            "error"
        );
        assert_eq!(
            ResponseEvent::CitationAdded {
                citation: Citation {
                    marker: 1,
                    source_id: "a#0".into(),
                    snippet: "s".into(),
                    score: 0.5,
                    document_ref: "a".into(),
                    tool_call_id: "c".into(),
                    url: None,
                }
            }
            .event_type(),
            "citation_added"
        );
    }

    #[test]
    fn only_done_and_error_are_terminal() {
        assert!(ResponseEvent::Error { message: "x".into() }.is_terminal());
        assert!(
            !ResponseEvent::ToolCallFinished {
                id: "c".into(),
                passages: 0,
                latency_ms: 3,
                success: false,
            }
            .is_terminal()
        );
    }

    #[tokio::test]
    async fn finish_sends_error_message_for_busy() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = EventSink::new(tx);
        sink.emit(ResponseEvent::PartialText { content: "a".into() }).await;
        sink.finish(&Err(CycleError::Busy("s1".into()))).await;

        assert_eq!(rx.recv().await.unwrap().event_type(), "partial_text");
        let last = rx.recv().await.unwrap();
        assert!(matches!(last, ResponseEvent::Error { ref message } if !message.contains("s1")));
        assert!(rx.recv().await.is_none());
    }
}
