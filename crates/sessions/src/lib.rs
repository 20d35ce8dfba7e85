//! Conversation state for juris.
//!
//! [`ConversationStore`] keeps the ordered turn history of every session,
//! hands out per-session leases so only one reasoning cycle mutates a
//! session at a time, and enforces the token budget and idle TTL.

pub mod eviction;
pub mod store;

pub use store::{ConversationStore, SessionLease};
