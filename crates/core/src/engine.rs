//! ReasoningEngine trait: the abstraction over LLM backends.
//!
//! An engine receives the conversation context plus the available tool
//! schema and answers with either a tool-invocation proposal or text,
//! as one response or as a stream of chunks. The orchestrator only ever
//! talks to this trait, so engines can be swapped freely.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::EngineError;
use crate::session::Role;

/// A tool invocation proposed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Engine-assigned call ID
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as a JSON string
    pub arguments: String,
}

/// One message of engine context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineMessage {
    pub role: Role,

    pub content: String,

    /// Tool invocations requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,

    /// If this is a tool result, which invocation it answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl EngineMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// An assistant message carrying tool invocations.
    pub fn tool_request(content: impl Into<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        Self {
            tool_calls,
            ..Self::assistant(content)
        }
    }

    /// The result of a tool invocation.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// A tool definition sent to the engine so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A request to the reasoning engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRequest {
    /// The model to use
    pub model: String,

    /// The context messages
    pub messages: Vec<EngineMessage>,

    /// Temperature (0.0 = deterministic)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Tools the engine may propose. Empty forces a text answer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

fn default_temperature() -> f32 {
    0.2
}

/// Token usage information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A complete (non-streaming) engine response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    /// The generated message
    pub message: EngineMessage,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded
    pub model: String,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Tool invocations (complete, typically in the final chunk)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Receiver side of an engine stream.
pub type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, EngineError>>;

/// The core ReasoningEngine trait.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    /// A human-readable name for this engine.
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: EngineRequest) -> Result<EngineResponse, EngineError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// Default implementation calls `complete()` and wraps the result as a single chunk.
    async fn stream(&self, request: EngineRequest) -> Result<ChunkReceiver, EngineError> {
        let response = self.complete(request).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx
            .send(Ok(StreamChunk {
                content: Some(response.message.content),
                tool_calls: response.message.tool_calls,
                done: true,
                usage: response.usage,
            }))
            .await;
        Ok(rx)
    }
}

/// Generate a fresh tool call ID for engines that do not supply one.
pub fn new_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoEngine;

    #[async_trait]
    impl ReasoningEngine for EchoEngine {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: EngineRequest) -> Result<EngineResponse, EngineError> {
            let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(EngineResponse {
                message: EngineMessage::assistant(last),
                usage: None,
                model: request.model,
            })
        }
    }

    #[tokio::test]
    async fn default_stream_wraps_complete() {
        let engine = EchoEngine;
        let mut rx = engine
            .stream(EngineRequest {
                model: "m".into(),
                messages: vec![EngineMessage::user("hello")],
                temperature: default_temperature(),
                max_tokens: None,
                tools: vec![],
            })
            .await
            .unwrap();

        let chunk = rx.recv().await.unwrap().unwrap();
        assert_eq!(chunk.content.as_deref(), Some("hello"));
        assert!(chunk.done);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn tool_result_message_links_call() {
        let msg = EngineMessage::tool_result("call_1", "[]");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn call_ids_are_unique() {
        assert_ne!(new_call_id(), new_call_id());
    }
}
