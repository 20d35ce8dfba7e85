//! Shared test helpers for orchestrator and coordinator tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use juris_config::{SessionsConfig, TelemetryConfig};
use juris_core::engine::{
    ChunkReceiver, EngineMessage, EngineRequest, EngineResponse, ReasoningEngine, StreamChunk,
    ToolInvocation,
};
use juris_core::error::{EngineError, RetrievalError};
use juris_core::retrieval::{Passage, SearchBackend, SearchRequest};
use juris_retrieval::{CaseLookupTool, RetrievalTool, TOOL_NAME};
use juris_sessions::ConversationStore;
use juris_telemetry::TraceEmitter;
use tokio::sync::{Notify, mpsc};

use crate::orchestrator::{AgentSettings, Orchestrator};

/// An engine that plays back scripted replies in order and records every
/// request it receives.
///
/// Streams split content on spaces, one chunk per word. With a gate, the
/// stream pauses after its first chunk until the gate is notified.
pub struct ScriptedEngine {
    replies: Mutex<VecDeque<Result<EngineMessage, EngineError>>>,
    requests: Mutex<Vec<EngineRequest>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedEngine {
    pub fn new(replies: Vec<Result<EngineMessage, EngineError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn gated(replies: Vec<Result<EngineMessage, EngineError>>, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(replies)
        }
    }

    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next(&self, request: EngineRequest) -> Result<EngineMessage, EngineError> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(EngineError::InvalidResponse("script exhausted".into())))
    }
}

#[async_trait]
impl ReasoningEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: EngineRequest) -> Result<EngineResponse, EngineError> {
        let model = request.model.clone();
        Ok(EngineResponse {
            message: self.next(request)?,
            usage: None,
            model,
        })
    }

    async fn stream(&self, request: EngineRequest) -> Result<ChunkReceiver, EngineError> {
        let message = self.next(request)?;
        let gate = self.gate.clone();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let words: Vec<String> = message
                .content
                .split_inclusive(' ')
                .map(str::to_string)
                .collect();
            for (i, word) in words.into_iter().enumerate() {
                let chunk = StreamChunk {
                    content: Some(word),
                    ..StreamChunk::default()
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
                if i == 0
                    && let Some(gate) = &gate
                {
                    gate.notified().await;
                }
            }
            let _ = tx
                .send(Ok(StreamChunk {
                    tool_calls: message.tool_calls,
                    done: true,
                    ..StreamChunk::default()
                }))
                .await;
        });
        Ok(rx)
    }
}

/// An engine that never answers.
pub struct HangingEngine;

#[async_trait]
impl ReasoningEngine for HangingEngine {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn complete(&self, _request: EngineRequest) -> Result<EngineResponse, EngineError> {
        futures::future::pending().await
    }
}

/// A final text answer.
pub fn text(content: &str) -> Result<EngineMessage, EngineError> {
    Ok(EngineMessage::assistant(content))
}

/// A reply proposing one search.
pub fn search(id: &str, query: &str) -> Result<EngineMessage, EngineError> {
    Ok(EngineMessage::tool_request("", vec![search_call(id, query)]))
}

pub fn search_call(id: &str, query: &str) -> ToolInvocation {
    ToolInvocation {
        id: id.into(),
        name: TOOL_NAME.into(),
        arguments: serde_json::json!({ "query": query }).to_string(),
    }
}

/// A backend that always returns the same passages and counts calls.
pub struct FixedBackend {
    passages: Vec<Passage>,
    calls: AtomicUsize,
}

impl FixedBackend {
    pub fn new(passages: Vec<Passage>) -> Self {
        Self {
            passages,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchBackend for FixedBackend {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn search(&self, _request: &SearchRequest) -> Result<Vec<Passage>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.passages.clone())
    }
}

/// A backend that always fails and records the requests it saw.
pub struct FailingBackend {
    error: RetrievalError,
    seen: Mutex<Vec<SearchRequest>>,
}

impl FailingBackend {
    pub fn new(error: RetrievalError) -> Self {
        Self {
            error,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<SearchRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Passage>, RetrievalError> {
        self.seen.lock().unwrap().push(request.clone());
        Err(self.error.clone())
    }
}

pub fn passage(document_id: &str, score: f32) -> Passage {
    let mut metadata = BTreeMap::new();
    metadata.insert("name".to_string(), format!("{document_id} case"));
    Passage {
        source_id: format!("{document_id}#0"),
        document_id: document_id.into(),
        snippet: format!("Passage from {document_id}."),
        score,
        document_date: None,
        metadata,
    }
}

/// Three Konrad v. State passages scored 0.91, 0.77 and 0.65.
pub fn konrad_passages() -> Vec<Passage> {
    let mut first = passage("konrad-v-state", 0.91);
    first
        .metadata
        .insert("citation".to_string(), "14 Alaska 212".to_string());
    vec![
        first,
        Passage {
            source_id: "konrad-v-state#1".into(),
            ..passage("konrad-v-state", 0.77)
        },
        passage("konrad-appeal", 0.65),
    ]
}

pub fn test_settings() -> AgentSettings {
    AgentSettings {
        retry_backoff: Duration::ZERO,
        ..AgentSettings::default()
    }
}

pub struct Fixture {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<ConversationStore>,
    pub emitter: TraceEmitter,
}

pub fn fixture(
    engine: Arc<dyn ReasoningEngine>,
    backend: Arc<dyn SearchBackend>,
    settings: AgentSettings,
    sessions: SessionsConfig,
) -> Fixture {
    let store = Arc::new(ConversationStore::new(&sessions));
    let emitter = TraceEmitter::new(&TelemetryConfig::default());
    let orchestrator = Arc::new(Orchestrator::new(
        engine,
        Arc::new(RetrievalTool::new(backend)),
        store.clone(),
        emitter.clone(),
        settings,
    ));
    Fixture {
        orchestrator,
        store,
        emitter,
    }
}

/// Like [`fixture`], with the case lookup tools attached.
pub fn fixture_with_cases(
    engine: Arc<dyn ReasoningEngine>,
    backend: Arc<dyn SearchBackend>,
    cases: CaseLookupTool,
    sessions: SessionsConfig,
) -> Fixture {
    let store = Arc::new(ConversationStore::new(&sessions));
    let emitter = TraceEmitter::new(&TelemetryConfig::default());
    let orchestrator = Arc::new(
        Orchestrator::new(
            engine,
            Arc::new(RetrievalTool::new(backend)),
            store.clone(),
            emitter.clone(),
            test_settings(),
        )
        .with_case_lookup(Arc::new(cases)),
    );
    Fixture {
        orchestrator,
        store,
        emitter,
    }
}

/// A reply proposing one call to a named tool.
pub fn tool_request(id: &str, name: &str, arguments: serde_json::Value) -> Result<EngineMessage, EngineError> {
    Ok(EngineMessage::tool_request(
        "",
        vec![ToolInvocation {
            id: id.into(),
            name: name.into(),
            arguments: arguments.to_string(),
        }],
    ))
}
