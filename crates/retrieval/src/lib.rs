//! Retrieval for juris.
//!
//! The [`RetrievalTool`] adapter fronts any [`SearchBackend`]:
//! - `vectara`: HTTP backend for a Vectara-compatible corpus
//! - `static_corpus`: in-memory keyword corpus for demos and tests
//!
//! Plus the per-cycle [`CycleCache`], case.law citation links and the
//! [`CaseLookupTool`] for reading case records.

pub mod adapter;
pub mod cache;
pub mod caselaw;
pub mod citation;
pub mod static_corpus;
pub mod vectara;

pub use adapter::{RetrievalArgs, RetrievalTool, TOOL_NAME, rank};
pub use cache::CycleCache;
pub use caselaw::{CaseLawClient, CaseLookupTool, CaseRecord, CaseSource, Opinion, StaticCases};
pub use citation::{CaseCitation, CitationError, case_url, validate_url};
pub use static_corpus::StaticCorpus;
pub use vectara::VectaraBackend;

use std::sync::Arc;

use juris_config::CorpusConfig;
use juris_core::retrieval::SearchBackend;
use tracing::warn;

/// Pick a backend for the configured corpus.
///
/// Without a corpus key (or API key) the bundled sample corpus is used.
pub fn backend_from_config(config: &CorpusConfig) -> Arc<dyn SearchBackend> {
    if config.corpus_key.is_empty() || config.api_key.is_none() {
        warn!("No corpus configured, searching the bundled sample corpus");
        return Arc::new(StaticCorpus::alaska_sample());
    }
    Arc::new(VectaraBackend::from_config(config))
}
