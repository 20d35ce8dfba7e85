//! Per-cycle retrieval cache.
//!
//! Lives for exactly one reasoning cycle. A request identical to an earlier
//! one (same query string, `top_k` and filters) reuses the earlier result
//! instead of hitting the backend again. Queries are compared as sent.

use std::collections::{BTreeMap, HashMap};

use juris_core::retrieval::{SearchRequest, ToolCallRecord};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    query: String,
    top_k: usize,
    filters: BTreeMap<String, String>,
}

impl CacheKey {
    fn of(request: &SearchRequest) -> Self {
        Self {
            query: request.query.clone(),
            top_k: request.top_k,
            filters: request.filters.clone(),
        }
    }
}

/// Successful tool call records keyed by their request.
#[derive(Debug, Default)]
pub struct CycleCache {
    entries: HashMap<CacheKey, ToolCallRecord>,
}

impl CycleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The earlier record for an identical request, if any.
    pub fn lookup(&self, request: &SearchRequest) -> Option<&ToolCallRecord> {
        self.entries.get(&CacheKey::of(request))
    }

    /// Remember a record. Failed calls are not cached.
    pub fn insert(&mut self, request: &SearchRequest, record: ToolCallRecord) {
        if record.success {
            self.entries.insert(CacheKey::of(request), record);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
