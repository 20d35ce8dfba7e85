//! Retrieval domain: passages, search requests, and the search backend trait.
//!
//! The vector-search service is an external collaborator. Everything the
//! agent knows about it goes through [`SearchBackend`].

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::RetrievalError;
use crate::session::Citation;

/// A ranked passage returned by the search service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    /// Identifier of this passage within the corpus.
    pub source_id: String,

    /// The corpus document this passage belongs to.
    pub document_id: String,

    /// The passage text.
    pub snippet: String,

    /// Relevance score, clamped to 0.0-1.0.
    pub score: f32,

    /// Document date (decision date for case law), used for recency ties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_date: Option<NaiveDate>,

    /// Document metadata (court, case name, citation, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Passage {
    /// Build a citation for this passage.
    pub fn cite(&self, marker: usize, tool_call_id: &str) -> Citation {
        Citation {
            marker,
            source_id: self.source_id.clone(),
            snippet: self.snippet.clone(),
            score: self.score,
            document_ref: self.document_id.clone(),
            tool_call_id: tool_call_id.to_string(),
            url: None,
        }
    }
}

/// A search request sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchRequest {
    /// The query text.
    pub query: String,

    /// Maximum passages to return.
    pub top_k: usize,

    /// Optional metadata filters (key = value).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
}

/// The vector-search backend trait.
///
/// Implementations: Vectara-style HTTP client, static in-memory corpus.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// A human-readable backend name.
    fn name(&self) -> &str;

    /// Run a search. Ordering of the returned passages is not trusted;
    /// the retrieval adapter re-sorts them.
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Passage>, RetrievalError>;
}

/// Record of one retrieval tool invocation inside a reasoning cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Unique call ID.
    pub id: String,

    /// Name of the tool invoked.
    pub tool_name: String,

    /// The query string sent to the backend.
    pub query: String,

    /// The top_k actually used.
    pub top_k: usize,

    /// Passages in descending score order.
    pub passages: Vec<Passage>,

    /// Wall-clock latency in milliseconds.
    pub latency_ms: u64,

    /// Whether the call succeeded.
    pub success: bool,

    /// Error text when the call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
