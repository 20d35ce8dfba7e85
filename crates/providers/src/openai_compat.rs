//! OpenAI-compatible reasoning engine.
//!
//! Works with: OpenAI, OpenRouter, Azure-style proxies, Ollama, vLLM,
//! Together AI, and any endpoint exposing `/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool use / function calling, with streamed argument deltas

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use juris_core::engine::{
    ChunkReceiver, EngineMessage, EngineRequest, EngineResponse, ReasoningEngine, StreamChunk,
    ToolDefinition, ToolInvocation, Usage, new_call_id,
};
use juris_core::error::EngineError;
use juris_core::session::Role;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// An OpenAI-compatible reasoning engine.
pub struct OpenAiCompatEngine {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatEngine {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Create an OpenAI engine (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Ollama engine (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama ignores the key
        )
    }

    fn to_api_messages(messages: &[EngineMessage]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                    Role::System => "system".into(),
                    Role::Tool => "tool".into(),
                },
                content: Some(m.content.clone()),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect()
    }

    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(request: &EngineRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }
        body
    }

    async fn post(
        &self,
        request: &EngineRequest,
        stream: bool,
    ) -> Result<reqwest::Response, EngineError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder
            .json(&Self::request_body(request, stream))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(e.to_string())
                } else {
                    EngineError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(EngineError::RateLimited { retry_after_secs });
        }

        if status == 401 || status == 403 {
            return Err(EngineError::Authentication(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(engine = %self.name, status, body = %error_body, "Engine returned error");
            return Err(EngineError::Api {
                status_code: status,
                message: error_body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl ReasoningEngine for OpenAiCompatEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: EngineRequest) -> Result<EngineResponse, EngineError> {
        debug!(engine = %self.name, model = %request.model, "Sending completion request");

        let response = self.post(&request, false).await?;

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| EngineError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::InvalidResponse("No choices in response".into()))?;

        let tool_calls: Vec<ToolInvocation> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolInvocation {
                id: if tc.id.is_empty() { new_call_id() } else { tc.id },
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        Ok(EngineResponse {
            message: EngineMessage::tool_request(
                choice.message.content.unwrap_or_default(),
                tool_calls,
            ),
            usage: api_response.usage.map(Usage::from),
            model: api_response.model,
        })
    }

    async fn stream(&self, request: EngineRequest) -> Result<ChunkReceiver, EngineError> {
        debug!(engine = %self.name, model = %request.model, "Sending streaming request");

        let response = self.post(&request, true).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let engine_name = self.name.clone();

        // Read the SSE byte stream and forward parsed chunks.
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(EngineError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for chunk in decoder.feed(&String::from_utf8_lossy(&bytes), &engine_name) {
                    let done = chunk.done;
                    if tx.send(Ok(chunk)).await.is_err() {
                        return; // receiver dropped
                    }
                    if done {
                        return;
                    }
                }
            }

            // Stream ended without [DONE]
            let _ = tx.send(Ok(decoder.finish(None))).await;
        });

        Ok(rx)
    }
}

/// Incremental SSE parser for chat completion streams.
///
/// Content deltas are emitted as they arrive; tool call fragments are
/// accumulated by index and emitted complete in the final chunk.
#[derive(Default)]
struct SseDecoder {
    buffer: String,
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
}

impl SseDecoder {
    fn feed(&mut self, text: &str, engine_name: &str) -> Vec<StreamChunk> {
        self.buffer.push_str(text);
        let mut chunks = Vec::new();

        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim_end_matches('\r').to_string();
            self.buffer.replace_range(..=line_end, "");

            // Skip empty lines and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                chunks.push(self.finish(None));
                return chunks;
            }

            match serde_json::from_str::<StreamResponse>(data) {
                Ok(stream_resp) => {
                    if let Some(choice) = stream_resp.choices.into_iter().next() {
                        for tc_delta in choice.delta.tool_calls.unwrap_or_default() {
                            let acc = self.tool_calls.entry(tc_delta.index).or_default();
                            if let Some(id) = tc_delta.id {
                                acc.id = id;
                            }
                            if let Some(func) = tc_delta.function {
                                if let Some(name) = func.name {
                                    acc.name = name;
                                }
                                if let Some(args) = func.arguments {
                                    acc.arguments.push_str(&args);
                                }
                            }
                        }

                        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                            chunks.push(StreamChunk {
                                content: Some(content),
                                ..StreamChunk::default()
                            });
                        }
                    }

                    // Usage arrives in the last chunk when stream_options asks for it
                    if let Some(usage) = stream_resp.usage {
                        chunks.push(self.finish(Some(usage.into())));
                        return chunks;
                    }
                }
                Err(e) => {
                    trace!(engine = %engine_name, data = %data, error = %e, "Ignoring unparseable SSE chunk");
                }
            }
        }

        chunks
    }

    fn finish(&mut self, usage: Option<Usage>) -> StreamChunk {
        let tool_calls = std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(ToolCallAccumulator::into_invocation)
            .collect();
        StreamChunk {
            content: None,
            tool_calls,
            done: true,
            usage,
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

// --- Streaming SSE types ---

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_invocation(self) -> ToolInvocation {
        ToolInvocation {
            id: if self.id.is_empty() { new_call_id() } else { self.id },
            name: self.name,
            arguments: self.arguments,
        }
    }
}
