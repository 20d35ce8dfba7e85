//! The reasoning loop for juris.
//!
//! One user utterance runs one **reasoning cycle**:
//!
//! 1. **Lease** the session (one cycle per session at a time)
//! 2. **Read context** from the conversation store
//! 3. **Plan**: the reasoning engine answers or proposes corpus searches
//! 4. **Search**: run the proposed searches, number the passages as evidence
//! 5. **Synthesize**: resolve `[n]` markers into citations, persist the answer
//!
//! Steps 3 and 4 repeat until the engine answers or the round limit is hit.
//! The [`StreamCoordinator`] runs cycles in the background and streams
//! [`ResponseEvent`]s to the caller.

pub mod coordinator;
pub mod event;
pub mod orchestrator;
pub mod prompt;
pub mod synthesis;

#[cfg(test)]
mod test_helpers;

pub use coordinator::{ChatRequest, ResponseStream, StreamCoordinator};
pub use event::{EventSink, ResponseEvent};
pub use orchestrator::{AgentSettings, CycleError, CycleOutcome, Orchestrator};
pub use synthesis::{EvidenceLedger, Synthesis, escape_dollars, synthesize};
