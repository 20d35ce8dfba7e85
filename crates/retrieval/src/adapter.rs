//! The retrieval tool adapter.
//!
//! Wraps a [`SearchBackend`] behind the `search_caselaw` tool: validates the
//! query, bounds `top_k`, enforces a deadline, and normalizes results into a
//! deterministic ranking.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use juris_config::CorpusConfig;
use juris_core::engine::ToolDefinition;
use juris_core::error::RetrievalError;
use juris_core::retrieval::{Passage, SearchBackend, SearchRequest};
use serde::Deserialize;
use tracing::debug;

/// Name under which the adapter is offered to the reasoning engine.
pub const TOOL_NAME: &str = "search_caselaw";

/// Arguments the engine passes when invoking the tool.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RetrievalArgs {
    #[serde(default)]
    pub query: String,

    #[serde(default)]
    pub top_k: Option<usize>,

    /// Restrict results to one case, e.g. `253 P.2d 136`.
    #[serde(default)]
    pub citations: Option<String>,

    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

impl RetrievalArgs {
    /// Parse the engine's JSON argument string.
    pub fn parse(raw: &str) -> Result<Self, RetrievalError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
            .map_err(|e| RetrievalError::InvalidQuery(format!("bad tool arguments: {e}")))
    }

    /// Filters including the case citation restriction, if any.
    pub fn effective_filters(&self) -> BTreeMap<String, String> {
        let mut filters = self.filters.clone();
        if let Some(citation) = self.citations.as_deref().map(str::trim)
            && !citation.is_empty()
        {
            filters.insert("citation".into(), citation.to_string());
        }
        filters
    }
}

/// The retrieval tool adapter.
pub struct RetrievalTool {
    backend: Arc<dyn SearchBackend>,
    default_top_k: usize,
    max_top_k: usize,
    timeout: Duration,
}

impl RetrievalTool {
    /// Create an adapter with default limits (top_k 5, cap 20, 8s deadline).
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self {
            backend,
            default_top_k: 5,
            max_top_k: 20,
            timeout: Duration::from_secs(8),
        }
    }

    /// Create an adapter with limits taken from the corpus configuration.
    pub fn from_config(backend: Arc<dyn SearchBackend>, config: &CorpusConfig) -> Self {
        Self::new(backend)
            .with_limits(config.default_top_k, config.max_top_k)
            .with_timeout(Duration::from_millis(config.timeout_ms))
    }

    /// Set the default and maximum `top_k`.
    pub fn with_limits(mut self, default_top_k: usize, max_top_k: usize) -> Self {
        self.max_top_k = max_top_k.max(1);
        self.default_top_k = default_top_k.clamp(1, self.max_top_k);
        self
    }

    /// Set the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn default_top_k(&self) -> usize {
        self.default_top_k
    }

    /// Bound a requested `top_k` to `1..=max_top_k`.
    pub fn clamp_top_k(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_top_k).clamp(1, self.max_top_k)
    }

    /// Build the request that `search` would send, without sending it.
    pub fn request(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&BTreeMap<String, String>>,
    ) -> Result<SearchRequest, RetrievalError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RetrievalError::InvalidQuery("query must not be empty".into()));
        }
        Ok(SearchRequest {
            query: query.to_string(),
            top_k: self.clamp_top_k(Some(top_k)),
            filters: filters.cloned().unwrap_or_default(),
        })
    }

    /// Search the corpus.
    ///
    /// Results come back in descending score order, ties broken by document
    /// recency and then by document id.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&BTreeMap<String, String>>,
    ) -> Result<Vec<Passage>, RetrievalError> {
        let request = self.request(query, top_k, filters)?;
        self.execute(&request).await
    }

    /// Run a prepared request against the backend under the deadline.
    pub async fn execute(&self, request: &SearchRequest) -> Result<Vec<Passage>, RetrievalError> {
        debug!(
            backend = %self.backend.name(),
            query = %request.query,
            top_k = request.top_k,
            "Searching corpus"
        );

        let passages = match tokio::time::timeout(self.timeout, self.backend.search(request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RetrievalError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        Ok(rank(passages, request.top_k))
    }

    /// Tool definition offered to the reasoning engine.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: TOOL_NAME.into(),
            description: "Search the case law corpus. Returns numbered passages sorted by \
                relevance. Use it for any question about cases, rulings, courts or judges. \
                If 'citations' is provided, results are restricted to that case."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "A focused search query derived from the user's question"
                    },
                    "top_k": {
                        "type": "integer",
                        "description": format!("Maximum passages to return (1-{})", self.max_top_k),
                        "default": self.default_top_k
                    },
                    "citations": {
                        "type": "string",
                        "description": "Case citation to restrict to: volume, reporter, first page (e.g. '253 P.2d 136')"
                    }
                },
                "required": ["query"]
            }),
        }
    }
}

/// Normalize scores and order passages deterministically, keeping `top_k`.
pub fn rank(passages: Vec<Passage>, top_k: usize) -> Vec<Passage> {
    let mut passages: Vec<Passage> = passages
        .into_iter()
        .map(|mut p| {
            p.score = if p.score.is_nan() { 0.0 } else { p.score.clamp(0.0, 1.0) };
            p
        })
        .collect();
    passages.sort_by(compare_passages);
    passages.truncate(top_k);
    passages
}

fn compare_passages(a: &Passage, b: &Passage) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.document_date.cmp(&a.document_date))
        .then_with(|| a.document_id.cmp(&b.document_id))
        .then_with(|| a.source_id.cmp(&b.source_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;

    fn passage(doc: &str, score: f32, date: Option<&str>) -> Passage {
        Passage {
            source_id: format!("{doc}#0"),
            document_id: doc.into(),
            snippet: format!("text of {doc}"),
            score,
            document_date: date.map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap()),
            metadata: BTreeMap::new(),
        }
    }

    struct FixedBackend(Vec<Passage>);

    #[async_trait]
    impl SearchBackend for FixedBackend {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn search(&self, _request: &SearchRequest) -> Result<Vec<Passage>, RetrievalError> {
            Ok(self.0.clone())
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl SearchBackend for SlowBackend {
        fn name(&self) -> &str {
            "slow"
        }
        async fn search(&self, _request: &SearchRequest) -> Result<Vec<Passage>, RetrievalError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }
    }

    #[test]
    fn rank_orders_by_score_then_recency_then_id() {
        let ranked = rank(
            vec![
                passage("b", 0.5, Some("2001-01-01")),
                passage("a", 0.5, Some("2001-01-01")),
                passage("c", 0.5, Some("2019-06-30")),
                passage("d", 0.9, None),
                passage("e", 0.5, None),
            ],
            10,
        );
        let ids: Vec<&str> = ranked.iter().map(|p| p.document_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "a", "b", "e"]);
    }

    #[test]
    fn rank_clamps_scores_and_truncates() {
        let ranked = rank(vec![passage("a", 1.7, None), passage("b", f32::NAN, None)], 1);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].score, 1.0);
    }

    #[test]
    fn top_k_is_bounded() {
        let tool = RetrievalTool::new(Arc::new(FixedBackend(vec![]))).with_limits(5, 20);
        assert_eq!(tool.clamp_top_k(None), 5);
        assert_eq!(tool.clamp_top_k(Some(0)), 1);
        assert_eq!(tool.clamp_top_k(Some(500)), 20);
    }

    #[tokio::test]
    async fn empty_query_rejected() {
        let tool = RetrievalTool::new(Arc::new(FixedBackend(vec![])));
        let err = tool.search("   ", 3, None).await.unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn search_returns_ranked_passages() {
        let backend = FixedBackend(vec![
            passage("low", 0.65, None),
            passage("high", 0.91, None),
            passage("mid", 0.77, None),
        ]);
        let tool = RetrievalTool::new(Arc::new(backend));
        let passages = tool.search("Konrad v State", 3, None).await.unwrap();
        let scores: Vec<f32> = passages.iter().map(|p| p.score).collect();
        assert_eq!(scores, vec![0.91, 0.77, 0.65]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out() {
        let tool =
            RetrievalTool::new(Arc::new(SlowBackend)).with_timeout(Duration::from_millis(250));
        let err = tool.search("query", 3, None).await.unwrap_err();
        assert_eq!(err, RetrievalError::Timeout { timeout_ms: 250 });
    }

    #[test]
    fn args_parse_with_citation_filter() {
        let args = RetrievalArgs::parse(r#"{"query":"adverse possession","citations":"253 P.2d 136"}"#)
            .unwrap();
        assert_eq!(args.query, "adverse possession");
        assert_eq!(
            args.effective_filters().get("citation").map(String::as_str),
            Some("253 P.2d 136")
        );
    }

    #[test]
    fn malformed_args_are_invalid_query() {
        assert!(matches!(
            RetrievalArgs::parse("{not json"),
            Err(RetrievalError::InvalidQuery(_))
        ));
        assert_eq!(RetrievalArgs::parse("").unwrap(), RetrievalArgs::default());
    }

    #[test]
    fn definition_names_tool() {
        let tool = RetrievalTool::new(Arc::new(FixedBackend(vec![])));
        let def = tool.definition();
        assert_eq!(def.name, TOOL_NAME);
        assert_eq!(def.parameters["required"][0], "query");
    }
}
