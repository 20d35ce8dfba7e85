//! Vectara-style corpus backend.
//!
//! Calls `POST {endpoint}/v2/corpora/{corpus_key}/query` with an
//! `x-api-key` header and maps `search_results` into passages.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use juris_config::CorpusConfig;
use juris_core::error::RetrievalError;
use juris_core::retrieval::{Passage, SearchBackend, SearchRequest};
use serde::Deserialize;
use tracing::{debug, warn};

/// Sentences of surrounding context returned with each hit.
const CONTEXT_SENTENCES: u32 = 2;
/// Candidates fed to the reranker before `limit` is applied.
const RERANK_CANDIDATES: u32 = 100;

/// HTTP backend for a Vectara-compatible corpus.
pub struct VectaraBackend {
    endpoint: String,
    corpus_key: String,
    api_key: String,
    filter_template: Option<String>,
    client: reqwest::Client,
}

impl VectaraBackend {
    pub fn new(
        endpoint: impl Into<String>,
        corpus_key: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            corpus_key: corpus_key.into(),
            api_key: api_key.into(),
            filter_template: None,
            client,
        }
    }

    /// Build from the `[corpus]` config section.
    pub fn from_config(config: &CorpusConfig) -> Self {
        let mut backend = Self::new(
            &config.endpoint,
            &config.corpus_key,
            config.api_key.clone().unwrap_or_default(),
        );
        backend.filter_template = config.filter_template.clone();
        backend
    }

    fn query_url(&self) -> String {
        format!("{}/v2/corpora/{}/query", self.endpoint, self.corpus_key)
    }

    fn request_body(&self, request: &SearchRequest) -> serde_json::Value {
        let mut search = serde_json::json!({
            "limit": request.top_k,
            "lexical_interpolation": 0.0,
            "context_configuration": {
                "sentences_before": CONTEXT_SENTENCES,
                "sentences_after": CONTEXT_SENTENCES,
            },
            "reranker": {
                "type": "customer_reranker",
                "reranker_name": "Rerank_Multilingual_v1",
                "limit": RERANK_CANDIDATES,
            },
        });
        if let Some(filter) = metadata_filter(self.filter_template.as_deref(), &request.filters) {
            search["metadata_filter"] = serde_json::json!(filter);
        }
        serde_json::json!({
            "query": request.query,
            "search": search,
        })
    }
}

#[async_trait]
impl SearchBackend for VectaraBackend {
    fn name(&self) -> &str {
        "vectara"
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Passage>, RetrievalError> {
        debug!(corpus = %self.corpus_key, query = %request.query, "Querying corpus");

        let response = self
            .client
            .post(self.query_url())
            .header("x-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RetrievalError::Timeout { timeout_ms: 30_000 }
                } else {
                    RetrievalError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if status == 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::InvalidQuery(body));
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status, body = %body, "Corpus query failed");
            return Err(RetrievalError::Unavailable(format!("status {status}: {body}")));
        }

        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::Unavailable(format!("Failed to parse response: {e}")))?;

        Ok(body
            .search_results
            .into_iter()
            .enumerate()
            .map(|(i, hit)| hit.into_passage(i))
            .collect())
    }
}

/// Render filters as `doc.<key> = '<value>'` joined with `and`, combined
/// with the configured template when both are present.
pub fn metadata_filter(template: Option<&str>, filters: &BTreeMap<String, String>) -> Option<String> {
    let rendered = render_filters(filters);
    let template = template.map(str::trim).filter(|t| !t.is_empty());
    match (template, rendered) {
        (None, None) => None,
        (Some(t), None) => Some(t.to_string()),
        (None, Some(r)) => Some(r),
        (Some(t), Some(r)) => Some(format!("({t}) and ({r})")),
    }
}

fn render_filters(filters: &BTreeMap<String, String>) -> Option<String> {
    if filters.is_empty() {
        return None;
    }
    Some(
        filters
            .iter()
            .map(|(k, v)| format!("doc.{k} = '{}'", v.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(" and "),
    )
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    search_results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    text: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    document_id: String,
    #[serde(default)]
    document_metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    part_metadata: serde_json::Map<String, serde_json::Value>,
}

impl SearchHit {
    fn into_passage(self, index: usize) -> Passage {
        let mut metadata = BTreeMap::new();
        for (k, v) in self.document_metadata.into_iter().chain(self.part_metadata) {
            let value = match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            metadata.insert(k, value);
        }

        let document_date = metadata
            .get("decision_date")
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());

        let source_id = match metadata.get("offset") {
            Some(offset) => format!("{}#{offset}", self.document_id),
            None => format!("{}#{index}", self.document_id),
        };

        Passage {
            source_id,
            document_id: self.document_id,
            snippet: self.text,
            score: self.score,
            document_date,
            metadata,
        }
    }
}
