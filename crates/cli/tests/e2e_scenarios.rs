//! End-to-end scenarios for the juris reasoning cycle.
//!
//! These drive the full pipeline (conversation store, orchestrator, retrieval
//! adapter, streaming coordinator, tracing) with a deterministic engine and
//! in-memory corpora.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use juris_agent::{
    AgentSettings, ChatRequest, CycleOutcome, Orchestrator, ResponseEvent, StreamCoordinator,
};
use juris_config::{SessionsConfig, TelemetryConfig};
use juris_core::engine::{
    ChunkReceiver, EngineMessage, EngineRequest, EngineResponse, ReasoningEngine, StreamChunk,
    ToolInvocation,
};
use juris_core::error::{EngineError, RetrievalError};
use juris_core::retrieval::{Passage, SearchBackend, SearchRequest};
use juris_core::session::{Role, SessionId, Turn};
use juris_core::tokens::estimate_turn_tokens;
use juris_retrieval::{RetrievalTool, StaticCorpus, TOOL_NAME};
use juris_sessions::ConversationStore;
use juris_telemetry::{SpanKind, TraceEmitter};
use tokio::sync::{Notify, mpsc};

// ── Deterministic engine ─────────────────────────────────────────────────

/// Replies from a script, in order. Records every request.
struct ScriptedEngine {
    replies: Mutex<VecDeque<EngineMessage>>,
    requests: Mutex<Vec<EngineRequest>>,
}

impl ScriptedEngine {
    fn new(replies: Vec<EngineMessage>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ReasoningEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "e2e_scripted"
    }

    async fn complete(&self, request: EngineRequest) -> Result<EngineResponse, EngineError> {
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        let message = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| EngineError::InvalidResponse("script exhausted".into()))?;
        Ok(EngineResponse {
            message,
            usage: None,
            model,
        })
    }
}

/// Keeps proposing new searches while tools are offered; answers once they
/// are withdrawn.
struct PersistentSearcher {
    rounds: AtomicUsize,
}

#[async_trait::async_trait]
impl ReasoningEngine for PersistentSearcher {
    fn name(&self) -> &str {
        "e2e_persistent"
    }

    async fn complete(&self, request: EngineRequest) -> Result<EngineResponse, EngineError> {
        let message = if request.tools.is_empty() {
            EngineMessage::assistant("Best effort answer [1].")
        } else {
            let n = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
            EngineMessage::tool_request("", vec![search_call(&format!("call_{n}"), &format!("query {n}"))])
        };
        Ok(EngineResponse {
            message,
            usage: None,
            model: request.model,
        })
    }
}

/// Streams its answer word by word, pausing after the first word until
/// released.
struct PausingEngine {
    answer: String,
    release: Arc<Notify>,
}

#[async_trait::async_trait]
impl ReasoningEngine for PausingEngine {
    fn name(&self) -> &str {
        "e2e_pausing"
    }

    async fn complete(&self, request: EngineRequest) -> Result<EngineResponse, EngineError> {
        Ok(EngineResponse {
            message: EngineMessage::assistant(self.answer.as_str()),
            usage: None,
            model: request.model,
        })
    }

    async fn stream(&self, _request: EngineRequest) -> Result<ChunkReceiver, EngineError> {
        let (tx, rx) = mpsc::channel(8);
        let words: Vec<String> = self.answer.split_inclusive(' ').map(String::from).collect();
        let release = self.release.clone();
        tokio::spawn(async move {
            for (i, word) in words.into_iter().enumerate() {
                let chunk = StreamChunk {
                    content: Some(word),
                    ..StreamChunk::default()
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
                if i == 0 {
                    release.notified().await;
                }
            }
            let _ = tx
                .send(Ok(StreamChunk {
                    done: true,
                    ..StreamChunk::default()
                }))
                .await;
        });
        Ok(rx)
    }
}

fn search_call(id: &str, query: &str) -> ToolInvocation {
    ToolInvocation {
        id: id.into(),
        name: TOOL_NAME.into(),
        arguments: serde_json::json!({ "query": query }).to_string(),
    }
}

fn search(id: &str, query: &str) -> EngineMessage {
    EngineMessage::tool_request("", vec![search_call(id, query)])
}

// ── Corpora ──────────────────────────────────────────────────────────────

struct FixedCorpus {
    passages: Vec<Passage>,
}

#[async_trait::async_trait]
impl SearchBackend for FixedCorpus {
    fn name(&self) -> &str {
        "e2e_fixed"
    }

    async fn search(&self, _request: &SearchRequest) -> Result<Vec<Passage>, RetrievalError> {
        Ok(self.passages.clone())
    }
}

/// Fails every search and counts the attempts.
struct BrokenCorpus {
    error: RetrievalError,
    attempts: AtomicUsize,
}

impl BrokenCorpus {
    fn new(error: RetrievalError) -> Self {
        Self {
            error,
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl SearchBackend for BrokenCorpus {
    fn name(&self) -> &str {
        "e2e_broken"
    }

    async fn search(&self, _request: &SearchRequest) -> Result<Vec<Passage>, RetrievalError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

fn passage(source_id: &str, document_id: &str, score: f32) -> Passage {
    let mut metadata = BTreeMap::new();
    metadata.insert("name".to_string(), "Konrad v. State".to_string());
    Passage {
        source_id: source_id.into(),
        document_id: document_id.into(),
        snippet: format!("Text of {source_id}."),
        score,
        document_date: None,
        metadata,
    }
}

fn konrad_corpus() -> Arc<FixedCorpus> {
    Arc::new(FixedCorpus {
        passages: vec![
            passage("konrad#2", "konrad-v-state", 0.65),
            passage("konrad#0", "konrad-v-state", 0.91),
            passage("konrad#1", "konrad-v-state", 0.77),
        ],
    })
}

// ── Wiring ───────────────────────────────────────────────────────────────

struct Harness {
    coordinator: StreamCoordinator,
    store: Arc<ConversationStore>,
    emitter: TraceEmitter,
}

fn settings() -> AgentSettings {
    AgentSettings {
        retry_backoff: Duration::ZERO,
        ..AgentSettings::default()
    }
}

fn harness(engine: Arc<dyn ReasoningEngine>, corpus: Arc<dyn SearchBackend>) -> Harness {
    harness_with(engine, corpus, settings(), SessionsConfig::default())
}

fn harness_with(
    engine: Arc<dyn ReasoningEngine>,
    corpus: Arc<dyn SearchBackend>,
    settings: AgentSettings,
    sessions: SessionsConfig,
) -> Harness {
    let store = Arc::new(ConversationStore::new(&sessions));
    let emitter = TraceEmitter::new(&TelemetryConfig::default());
    let orchestrator = Arc::new(Orchestrator::new(
        engine,
        Arc::new(RetrievalTool::new(corpus)),
        store.clone(),
        emitter.clone(),
        settings,
    ));
    Harness {
        coordinator: StreamCoordinator::new(orchestrator, 64),
        store,
        emitter,
    }
}

async fn ask(h: &Harness, session: &str, message: &str) -> CycleOutcome {
    h.coordinator
        .ask(&SessionId::from(session), &ChatRequest::new(message))
        .await
        .unwrap()
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_cites_only_referenced_passages() {
    let engine = Arc::new(ScriptedEngine::new(vec![
        search("call_1", "Konrad v State"),
        EngineMessage::assistant(
            "Konrad's manslaughter conviction was affirmed [1]. The self-defense \
             instructions were held adequate [3].",
        ),
    ]));
    let h = harness(engine.clone(), konrad_corpus());

    let outcome = ask(&h, "s1", "Tell me about Konrad v State").await;

    assert_eq!(outcome.tool_calls.len(), 1);
    let call = &outcome.tool_calls[0];
    let scores: Vec<f32> = call.passages.iter().map(|p| p.score).collect();
    assert_eq!(scores, vec![0.91, 0.77, 0.65]);

    let cited: Vec<&str> = outcome
        .citations
        .iter()
        .map(|c| c.source_id.as_str())
        .collect();
    assert_eq!(cited, vec!["konrad#0", "konrad#2"]);
    assert!(outcome.citations.iter().all(|c| c.tool_call_id == call.id));
    assert!(!outcome.partial_evidence);
    assert_eq!(engine.calls(), 2);

    let session = h.store.snapshot(&SessionId::from("s1")).await.unwrap();
    let answer = session.turns.last().unwrap();
    assert_eq!(answer.role, Role::Assistant);
    assert_eq!(answer.citations.len(), 2);
}

#[tokio::test]
async fn scenario_b_timeouts_degrade_without_reaching_the_ui() {
    let engine = Arc::new(ScriptedEngine::new(vec![
        search("call_1", "Ravin v State privacy"),
        EngineMessage::assistant("I couldn't check the case law right now."),
    ]));
    let corpus = Arc::new(BrokenCorpus::new(RetrievalError::Timeout { timeout_ms: 8000 }));
    let h = harness(engine, corpus.clone());

    let events: Vec<ResponseEvent> = h
        .coordinator
        .stream(SessionId::from("s1"), ChatRequest::new("What did Ravin hold?"))
        .collect()
        .await;

    assert_eq!(corpus.attempts.load(Ordering::SeqCst), 2);
    match events.last().unwrap() {
        ResponseEvent::Done {
            citations,
            partial_evidence,
            degraded,
            fallback,
            ..
        } => {
            assert!(citations.is_empty());
            assert!(*partial_evidence);
            assert!(*degraded);
            assert!(!*fallback);
        }
        other => panic!("expected done, got {other:?}"),
    }
    assert!(events.iter().all(|e| e.event_type() != "error"));
}

#[tokio::test]
async fn scenario_c_cancelled_stream_persists_no_answer() {
    let release = Arc::new(Notify::new());
    let engine = Arc::new(PausingEngine {
        answer: "Miller v. Sears concerned a products liability claim.".into(),
        release: release.clone(),
    });
    let h = harness(engine, Arc::new(StaticCorpus::alaska_sample()));
    let session = SessionId::from("s1");

    let mut stream = h
        .coordinator
        .stream(session.clone(), ChatRequest::new("Miller v. Sears?"));
    let first = stream.next().await.unwrap();
    assert_eq!(first.event_type(), "partial_text");

    stream.cancel();
    release.notify_waiters();
    let rest: Vec<ResponseEvent> = stream.collect().await;
    assert_eq!(rest.last().unwrap().event_type(), "error");
    assert!(rest.iter().all(|e| e.event_type() != "done"));

    // Waiting for the lease means the cycle has finished.
    let _lease = h.store.acquire(&session).await.unwrap();
    let snapshot = h.store.snapshot(&session).await.unwrap();
    assert!(snapshot.turns.iter().all(|t| t.role != Role::Assistant));
}

#[tokio::test]
async fn scenario_d_budget_keeps_the_last_two_turns() {
    let turns = [
        Turn::user("first question about Konrad"),
        Turn::assistant("first answer about Konrad"),
        Turn::user("second question on Ravin"),
    ];
    let budget = estimate_turn_tokens(&turns[1]) + estimate_turn_tokens(&turns[2]);
    let store = ConversationStore::new(&SessionsConfig {
        budget_tokens: budget,
        ..SessionsConfig::default()
    });
    let session = SessionId::from("s1");

    store.append(&session, turns[0].clone()).await;
    store.append(&session, turns[1].clone()).await;
    let evicted = store.append(&session, turns[2].clone()).await;

    assert_eq!(evicted, 1);
    let context = store.get_context(&session, budget).await;
    assert_eq!(context.len(), 2);
    assert_eq!(context[0].content, turns[1].content);
    assert_eq!(context[1].content, turns[2].content);
}

// ── Properties ───────────────────────────────────────────────────────────

#[tokio::test]
async fn turns_are_time_ordered_and_round_trip() {
    let engine = Arc::new(ScriptedEngine::new(vec![
        search("call_1", "Konrad"),
        EngineMessage::assistant("Affirmed [1]."),
        EngineMessage::assistant("Nothing further."),
    ]));
    let h = harness(engine, konrad_corpus());
    let stored = ask(&h, "s1", "Konrad?").await;
    ask(&h, "s1", "Anything else?").await;

    let session = h.store.snapshot(&SessionId::from("s1")).await.unwrap();
    assert!(
        session
            .turns
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp)
    );

    let context = h.store.get_context(&SessionId::from("s1"), 100_000).await;
    let first_answer = context
        .iter()
        .find(|t| t.role == Role::Assistant)
        .unwrap();
    assert_eq!(first_answer.content, "Affirmed [1].");
    assert_eq!(first_answer.citations, stored.citations);
}

#[tokio::test]
async fn identical_state_gives_identical_tool_calls() {
    let script = || {
        vec![
            search("call_1", "Konrad self defense"),
            search("call_2", "Konrad appeal"),
            EngineMessage::assistant("Affirmed [1]."),
        ]
    };

    let mut runs = Vec::new();
    for _ in 0..2 {
        let h = harness(Arc::new(ScriptedEngine::new(script())), konrad_corpus());
        let outcome = ask(&h, "s1", "Tell me about Konrad v State").await;
        let queries: Vec<(String, usize)> = outcome
            .tool_calls
            .iter()
            .map(|c| (c.query.clone(), c.top_k))
            .collect();
        runs.push(queries);
    }

    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[0].len(), 2);
}

#[tokio::test]
async fn always_failing_corpus_terminates() {
    let engine = Arc::new(PersistentSearcher {
        rounds: AtomicUsize::new(0),
    });
    let corpus = Arc::new(BrokenCorpus::new(RetrievalError::Unavailable(
        "connection refused".into(),
    )));
    let h = harness(engine, corpus);

    let outcome = tokio::time::timeout(Duration::from_secs(5), ask(&h, "s1", "Konrad?"))
        .await
        .expect("cycle must terminate");
    assert!(outcome.degraded || outcome.partial_evidence);
    assert!(outcome.citations.is_empty());
    assert!(!outcome.fallback);
}

#[tokio::test]
async fn endless_searching_stops_at_the_round_limit() {
    let engine = Arc::new(PersistentSearcher {
        rounds: AtomicUsize::new(0),
    });
    let settings = AgentSettings {
        max_rounds: 3,
        ..settings()
    };
    let h = harness_with(engine.clone(), konrad_corpus(), settings, SessionsConfig::default());

    let outcome = ask(&h, "s1", "Konrad?").await;
    assert!(outcome.partial_evidence);
    assert!(!outcome.degraded);
    assert_eq!(engine.rounds.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.citations.len(), 1);
}

#[tokio::test]
async fn citations_never_come_from_another_session_or_cycle() {
    let engine = Arc::new(ScriptedEngine::new(vec![
        search("call_1", "Konrad"),
        EngineMessage::assistant("Affirmed [1]."),
        // Second session cites a marker with no evidence behind it.
        EngineMessage::assistant("As noted before [1]."),
        // Same session, next cycle, no new search.
        EngineMessage::assistant("Still affirmed [1]."),
    ]));
    let h = harness(engine, konrad_corpus());

    let first = ask(&h, "s1", "Konrad?").await;
    assert_eq!(first.citations.len(), 1);

    let other = ask(&h, "s2", "What did you say before?").await;
    assert!(other.citations.is_empty());
    assert_eq!(other.answer, "As noted before.");

    let later = ask(&h, "s1", "And now?").await;
    assert!(later.citations.is_empty());
}

#[tokio::test]
async fn every_request_flushes_a_closed_connected_trace() {
    let engine = Arc::new(ScriptedEngine::new(vec![
        search("call_1", "Konrad"),
        EngineMessage::assistant("Affirmed [1]."),
    ]));
    let h = harness(engine, konrad_corpus());
    ask(&h, "s1", "Konrad?").await;

    let trees = h.emitter.drain();
    assert_eq!(trees.len(), 1);
    let tree = &trees[0];
    assert!(tree.is_connected());
    assert!(tree.is_closed());
    assert_eq!(tree.count(SpanKind::Request), 1);
    assert_eq!(tree.count(SpanKind::ToolCall), 1);
    assert!(tree.count(SpanKind::Round) >= 1);
}
