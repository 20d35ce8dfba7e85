//! Session, Turn and Citation domain types.
//!
//! These are the value objects that flow through a reasoning cycle:
//! user utterance → Turn appended → agent answers → assistant Turn with Citations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a chat session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The legal assistant
    Assistant,
    /// A retrieval tool result
    Tool,
    /// Standing instructions (always pinned)
    System,
}

/// A reference from an answer back to a retrieved passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// Evidence marker used in the answer text (`[n]`).
    pub marker: usize,

    /// Identifier of the source passage.
    pub source_id: String,

    /// The passage text that supports the answer.
    pub snippet: String,

    /// Relevance score, 0.0-1.0.
    pub score: f32,

    /// Corpus document the passage belongs to.
    pub document_ref: String,

    /// The tool call that produced the passage.
    pub tool_call_id: String,

    /// Link to the case record, when the passage carries a case citation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A single immutable entry in a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Unique turn ID
    pub id: String,

    /// Who produced this turn
    pub role: Role,

    /// The text content
    pub content: String,

    /// Citations supporting an assistant answer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,

    /// Pinned turns survive budget eviction
    #[serde(default)]
    pub pinned: bool,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            citations: Vec::new(),
            pinned: false,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a new assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Create a tool output turn.
    pub fn tool(content: impl Into<String>) -> Self {
        Self::with_role(Role::Tool, content)
    }

    /// Create a pinned system instruction turn.
    pub fn system(content: impl Into<String>) -> Self {
        let mut turn = Self::with_role(Role::System, content);
        turn.pinned = true;
        turn
    }

    /// Attach citations (builder style, before the turn is appended).
    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.citations = citations;
        self
    }

    /// Mark the turn as pinned.
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }
}

/// An ordered conversation owned by the conversation store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID
    pub id: SessionId,

    /// Ordered turns, oldest first
    pub turns: Vec<Turn>,

    /// When this session was created
    pub created_at: DateTime<Utc>,

    /// When the session was last touched
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Create a new empty session.
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            turns: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Append a turn, clamping its timestamp so history never goes backwards.
    pub fn push(&mut self, mut turn: Turn) {
        if let Some(last) = self.turns.last()
            && turn.timestamp < last.timestamp
        {
            turn.timestamp = last.timestamp;
        }
        self.last_activity = Utc::now().max(turn.timestamp);
        self.turns.push(turn);
    }

    /// Index of the most recent user turn, if any.
    pub fn last_user_index(&self) -> Option<usize> {
        self.turns.iter().rposition(|t| t.role == Role::User)
    }

    /// Get the total token count estimate.
    pub fn estimated_tokens(&self) -> usize {
        crate::tokens::estimate_turns_tokens(&self.turns)
    }
}
