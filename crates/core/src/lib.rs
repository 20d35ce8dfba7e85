//! # juris core
//!
//! Domain types, traits, and error definitions for the juris legal research
//! agent. This crate has no framework dependencies; it defines the domain
//! model that every other crate implements against.
//!
//! The two external collaborators, the vector-search service and the
//! reasoning engine, are defined here as traits ([`SearchBackend`] and
//! [`ReasoningEngine`]) so implementations can be swapped via configuration
//! and replaced by deterministic stubs in tests.

pub mod engine;
pub mod error;
pub mod retrieval;
pub mod session;
pub mod tokens;

// Re-export key types at crate root for ergonomics
pub use engine::{
    EngineMessage, EngineRequest, EngineResponse, ReasoningEngine, StreamChunk, ToolDefinition,
    ToolInvocation, Usage,
};
pub use error::{EngineError, Error, Result, RetrievalError, SessionError};
pub use retrieval::{Passage, SearchBackend, SearchRequest, ToolCallRecord};
pub use session::{Citation, Role, Session, SessionId, Turn};
