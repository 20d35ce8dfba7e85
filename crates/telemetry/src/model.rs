//! Data model for request traces and spans.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Span ──────────────────────────────────────────────────────────────────

/// The kind of work a span represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// Top-level request (user turn → final answer).
    Request,
    /// One reasoning round.
    Round,
    /// A reasoning engine call.
    EngineCall,
    /// A retrieval tool call.
    ToolCall,
    /// Final answer synthesis.
    Synthesis,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Round => write!(f, "round"),
            Self::EngineCall => write!(f, "engine_call"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::Synthesis => write!(f, "synthesis"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
}

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for AttrValue {
    fn from(v: usize) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        Self::Float(v.into())
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

/// Build an attribute map: `attrs! { "query" => q, "top_k" => 5usize }`.
#[macro_export]
macro_rules! attrs {
    () => { $crate::model::Attributes::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::model::Attributes::new();
        $( map.insert($key.to_string(), $crate::model::AttrValue::from($value)); )+
        map
    }};
}

/// A single traced execution unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Unique identifier.
    pub id: String,
    /// Parent span id (None for the root span).
    pub parent_id: Option<String>,
    pub kind: SpanKind,
    /// Human-readable label (e.g. `round.2`, tool name).
    pub name: String,
    pub started_at: DateTime<Utc>,
    /// When the span ended (None while running).
    pub ended_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds (computed on end).
    pub duration_ms: Option<u64>,
    pub status: Option<SpanStatus>,
    pub attributes: Attributes,
}

impl Span {
    pub fn new(kind: SpanKind, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            kind,
            name: name.into(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            status: None,
            attributes: Attributes::new(),
        }
    }

    /// Set the parent span.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Close the span with a status, merging in the attributes.
    pub fn end(&mut self, status: SpanStatus, attributes: Attributes) {
        let now = Utc::now().max(self.started_at);
        self.ended_at = Some(now);
        self.duration_ms = Some(
            now.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.status = Some(status);
        self.attributes.extend(attributes);
    }

    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }
}

// ── SpanTree ──────────────────────────────────────────────────────────────

/// The flushed, immutable span tree of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanTree {
    pub trace_id: String,
    pub project: String,
    pub session_id: String,
    pub request_id: String,
    /// Spans in start order; the first one is the root.
    pub spans: Vec<Span>,
    pub flushed_at: DateTime<Utc>,
}

impl SpanTree {
    pub fn root(&self) -> Option<&Span> {
        self.spans.iter().find(|s| s.parent_id.is_none())
    }

    pub fn children<'a>(&'a self, parent_id: &'a str) -> impl Iterator<Item = &'a Span> + 'a {
        self.spans
            .iter()
            .filter(move |s| s.parent_id.as_deref() == Some(parent_id))
    }

    pub fn count(&self, kind: SpanKind) -> usize {
        self.spans.iter().filter(|s| s.kind == kind).count()
    }

    /// Exactly one root and every other span's parent is in the tree.
    pub fn is_connected(&self) -> bool {
        let roots = self.spans.iter().filter(|s| s.parent_id.is_none()).count();
        roots == 1
            && self.spans.iter().all(|s| match &s.parent_id {
                None => true,
                Some(p) => self.spans.iter().any(|other| &other.id == p),
            })
    }

    pub fn is_closed(&self) -> bool {
        self.spans.iter().all(Span::is_closed)
    }

    /// Wall-clock duration of the root span.
    pub fn duration_ms(&self) -> u64 {
        self.root().and_then(|r| r.duration_ms).unwrap_or(0)
    }
}
