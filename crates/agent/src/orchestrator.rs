//! The agent orchestrator: one bounded reasoning cycle per user turn.
//!
//! The cycle is an explicit state machine:
//!
//! ```text
//! Plan ── text ─────────────────────────────────────► Terminal
//! Plan ── tool calls ──► ToolExecute ──► Plan
//! ToolExecute ── retrieval down ──► Synthesize ──► Terminal (degraded)
//! Plan ── round limit ──► Synthesize ──► Terminal (partial evidence)
//! engine failure ──► Fallback
//! ```
//!
//! `round` counts planning calls and is capped at `max_rounds`, so the loop
//! always terminates. Collaborator errors never leave this module: they
//! become a retry, a degraded answer or the fixed fallback message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use juris_config::AppConfig;
use juris_core::engine::{
    EngineMessage, EngineRequest, ReasoningEngine, ToolDefinition, ToolInvocation,
};
use juris_core::error::{EngineError, RetrievalError};
use juris_core::retrieval::{SearchRequest, ToolCallRecord};
use juris_core::session::{Citation, Role, SessionId, Turn};
use juris_core::tokens::estimate_tool_tokens;
use juris_retrieval::{CaseLookupTool, CycleCache, RetrievalArgs, RetrievalTool, TOOL_NAME};
use juris_sessions::{ConversationStore, SessionLease};
use juris_telemetry::{RequestTrace, SpanHandle, SpanKind, SpanStatus, TraceEmitter, attrs};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{EventSink, ResponseEvent};
use crate::prompt::{
    BUSY_MESSAGE, CANCELLED_MESSAGE, DEFAULT_INSTRUCTIONS, DEGRADED_NOTE, EMPTY_MESSAGE,
    FALLBACK_MESSAGE, NO_ANSWER_MESSAGE, ROUND_LIMIT_NOTE, derive_query, format_evidence,
    history_messages, recent_exchanges,
};
use crate::synthesis::{EvidenceLedger, escape_dollars, markers_in, synthesize};

/// Limits and engine parameters for the reasoning loop.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub max_rounds: u32,
    pub retrieval_retries: u32,
    /// Wait before the first retry; doubles per attempt.
    pub retry_backoff: Duration,
    pub query_context_turns: usize,
    pub max_query_chars: usize,
    pub context_budget_tokens: usize,
    pub engine_timeout: Duration,
    pub instructions: String,
}

impl AgentSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let agent = &config.agent;
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: Some(config.max_tokens),
            max_rounds: agent.max_rounds.max(1),
            retrieval_retries: agent.retrieval_retries,
            retry_backoff: Duration::from_millis(250),
            query_context_turns: agent.query_context_turns,
            max_query_chars: agent.max_query_chars.max(1),
            context_budget_tokens: agent.context_budget_tokens,
            engine_timeout: Duration::from_millis(agent.engine_timeout_ms),
            instructions: agent
                .instructions
                .clone()
                .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string()),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// The result of a completed reasoning cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    /// Display text of the answer.
    pub answer: String,
    pub citations: Vec<Citation>,
    /// The answer was produced without full evidence (round limit or
    /// retrieval outage).
    pub partial_evidence: bool,
    /// Retrieval was unavailable during the cycle.
    pub degraded: bool,
    /// The reasoning engine failed and `answer` is the fixed apology.
    pub fallback: bool,
    pub rounds: u32,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// Why a cycle produced no answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CycleError {
    #[error("session {0} is busy")]
    Busy(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("empty utterance")]
    EmptyUtterance,
}

impl CycleError {
    /// The short message shown to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Busy(_) => BUSY_MESSAGE,
            Self::Cancelled => CANCELLED_MESSAGE,
            Self::EmptyUtterance => EMPTY_MESSAGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SynthesisReason {
    RoundLimit,
    Degraded,
}

impl SynthesisReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::RoundLimit => "round_limit",
            Self::Degraded => "degraded",
        }
    }
}

/// Answer text waiting for citation resolution.
struct Draft {
    text: String,
    partial_evidence: bool,
    degraded: bool,
}

enum Phase {
    Plan,
    ToolExecute {
        calls: Vec<ToolInvocation>,
        round_span: SpanHandle,
    },
    Synthesize(SynthesisReason),
    Terminal(Draft),
    Fallback,
}

/// Why an engine call did not produce a reply.
enum Interrupt {
    Cancelled,
    Engine(EngineError),
}

#[derive(Default)]
struct EngineReply {
    text: String,
    tool_calls: Vec<ToolInvocation>,
}

/// Working state of one reasoning cycle.
struct Cycle<'a> {
    session_id: &'a SessionId,
    lease: &'a SessionLease,
    utterance: &'a str,
    earlier_user_turns: Vec<String>,
    messages: Vec<EngineMessage>,
    ledger: EvidenceLedger,
    cache: CycleCache,
    records: Vec<ToolCallRecord>,
    round: u32,
    degraded: bool,
    sink: &'a EventSink,
    cancel: &'a CancellationToken,
    trace: &'a RequestTrace,
    root: &'a SpanHandle,
}

/// Runs reasoning cycles against the conversation store.
pub struct Orchestrator {
    engine: Arc<dyn ReasoningEngine>,
    retrieval: Arc<RetrievalTool>,
    cases: Option<Arc<CaseLookupTool>>,
    store: Arc<ConversationStore>,
    emitter: TraceEmitter,
    settings: AgentSettings,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ReasoningEngine>,
        retrieval: Arc<RetrievalTool>,
        store: Arc<ConversationStore>,
        emitter: TraceEmitter,
        settings: AgentSettings,
    ) -> Self {
        Self {
            engine,
            retrieval,
            cases: None,
            store,
            emitter,
            settings,
        }
    }

    /// Offer the case.law lookup tools beside corpus search.
    pub fn with_case_lookup(mut self, cases: Arc<CaseLookupTool>) -> Self {
        self.cases = Some(cases);
        self
    }

    /// Every tool offered while planning.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut tools = vec![self.retrieval.definition()];
        if let Some(cases) = &self.cases {
            tools.extend(cases.definitions());
        }
        tools
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn emitter(&self) -> &TraceEmitter {
        &self.emitter
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Answer one user utterance.
    ///
    /// Holds the session lease for the whole cycle, so cycles for one
    /// session run one at a time. Progress events go to `sink`; the caller
    /// sends the terminal event. Cancellation takes effect at the next
    /// await point and never persists a partial answer.
    pub async fn respond(
        &self,
        session_id: &SessionId,
        utterance: &str,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, CycleError> {
        let utterance = utterance.trim();
        if utterance.is_empty() {
            return Err(CycleError::EmptyUtterance);
        }

        let lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CycleError::Cancelled),
            lease = self.store.acquire(session_id) => lease.map_err(|e| {
                debug!(session_id = %session_id, error = %e, "Session busy");
                CycleError::Busy(session_id.to_string())
            })?,
        };

        let request_id = Uuid::new_v4().to_string();
        let trace = self.emitter.trace(session_id.as_str(), &request_id);
        let root = trace.start_span(SpanKind::Request, "request", None);
        info!(session_id = %session_id, request_id = %request_id, "Reasoning cycle started");

        let result = self
            .run_cycle(&lease, utterance, sink, cancel, &trace, &root)
            .await;

        match &result {
            Ok(outcome) => {
                info!(
                    session_id = %session_id,
                    request_id = %request_id,
                    rounds = outcome.rounds,
                    tool_calls = outcome.tool_calls.len(),
                    citations = outcome.citations.len(),
                    partial_evidence = outcome.partial_evidence,
                    degraded = outcome.degraded,
                    fallback = outcome.fallback,
                    "Reasoning cycle finished"
                );
                let status = if outcome.fallback {
                    SpanStatus::Error
                } else {
                    SpanStatus::Ok
                };
                trace.end_span(
                    &root,
                    status,
                    attrs! {
                        "rounds" => outcome.rounds,
                        "tool_calls" => outcome.tool_calls.len(),
                        "citations" => outcome.citations.len(),
                        "partial_evidence" => outcome.partial_evidence,
                        "degraded" => outcome.degraded,
                        "fallback" => outcome.fallback,
                    },
                );
            }
            Err(e) => {
                info!(session_id = %session_id, request_id = %request_id, reason = %e, "Reasoning cycle stopped");
                trace.end_span(&root, SpanStatus::Error, attrs! { "error" => e.to_string() });
            }
        }
        trace.flush();
        result
    }

    async fn run_cycle(
        &self,
        lease: &SessionLease,
        utterance: &str,
        sink: &EventSink,
        cancel: &CancellationToken,
        trace: &RequestTrace,
        root: &SpanHandle,
    ) -> Result<CycleOutcome, CycleError> {
        let session_id = lease.session_id();
        if lease.is_new().await {
            lease
                .append(Turn::system(self.settings.instructions.as_str()))
                .await;
        }
        lease.append(Turn::user(utterance)).await;

        // Tool schemas share the context budget with the history.
        let tool_tokens: usize = self.tool_definitions().iter().map(estimate_tool_tokens).sum();
        let history_budget = self
            .settings
            .context_budget_tokens
            .saturating_sub(tool_tokens);
        let context = recent_exchanges(
            &lease.context(history_budget).await,
            self.settings.query_context_turns,
        );

        let mut earlier_user_turns: Vec<String> = context
            .iter()
            .filter(|t| t.role == Role::User)
            .map(|t| t.content.clone())
            .collect();
        if earlier_user_turns.last().is_some_and(|t| t == utterance) {
            earlier_user_turns.pop();
        }

        let mut messages = history_messages(&context);
        let has_current = messages
            .last()
            .is_some_and(|m| m.role == Role::User && m.content == utterance);
        if !has_current {
            messages.push(EngineMessage::user(utterance));
        }

        let mut cycle = Cycle {
            session_id,
            lease,
            utterance,
            earlier_user_turns,
            messages,
            ledger: EvidenceLedger::new(),
            cache: CycleCache::new(),
            records: Vec::new(),
            round: 0,
            degraded: false,
            sink,
            cancel,
            trace,
            root,
        };

        let mut phase = Phase::Plan;
        loop {
            phase = match phase {
                Phase::Plan => self.plan(&mut cycle).await?,
                Phase::ToolExecute { calls, round_span } => {
                    self.execute_tools(&mut cycle, calls, round_span).await?
                }
                Phase::Synthesize(reason) => self.synthesize_final(&mut cycle, reason).await?,
                Phase::Terminal(draft) => return self.finish(cycle, draft).await,
                Phase::Fallback => return Ok(Self::fallback(cycle)),
            };
        }
    }

    async fn plan(&self, cycle: &mut Cycle<'_>) -> Result<Phase, CycleError> {
        if cycle.round >= self.settings.max_rounds {
            warn!(
                session_id = %cycle.session_id,
                rounds = cycle.round,
                "Round limit reached, forcing a final answer"
            );
            return Ok(Phase::Synthesize(SynthesisReason::RoundLimit));
        }

        cycle.round += 1;
        let round_span = cycle.trace.start_span(
            SpanKind::Round,
            &format!("round.{}", cycle.round),
            Some(cycle.root),
        );
        debug!(session_id = %cycle.session_id, round = cycle.round, "Planning");

        let tools = self.tool_definitions();
        match self.call_engine(cycle, tools, &round_span).await {
            Ok(reply) if reply.tool_calls.is_empty() => {
                cycle.trace.end_span(
                    &round_span,
                    SpanStatus::Ok,
                    attrs! { "round" => cycle.round, "tool_calls" => 0usize },
                );
                Ok(Phase::Terminal(Draft {
                    text: reply.text,
                    partial_evidence: false,
                    degraded: false,
                }))
            }
            Ok(reply) => {
                cycle.messages.push(EngineMessage::tool_request(
                    reply.text,
                    reply.tool_calls.clone(),
                ));
                Ok(Phase::ToolExecute {
                    calls: reply.tool_calls,
                    round_span,
                })
            }
            Err(Interrupt::Cancelled) => {
                cycle.trace.end_span(&round_span, SpanStatus::Error, attrs! { "cancelled" => true });
                Err(CycleError::Cancelled)
            }
            Err(Interrupt::Engine(e)) => {
                warn!(session_id = %cycle.session_id, round = cycle.round, error = %e, "Reasoning engine failed");
                cycle.trace.end_span(&round_span, SpanStatus::Error, attrs! { "error" => e.to_string() });
                Ok(Phase::Fallback)
            }
        }
    }

    async fn execute_tools(
        &self,
        cycle: &mut Cycle<'_>,
        calls: Vec<ToolInvocation>,
        round_span: SpanHandle,
    ) -> Result<Phase, CycleError> {
        for call in &calls {
            if cycle.cancel.is_cancelled() {
                cycle.trace.end_span(&round_span, SpanStatus::Error, attrs! { "cancelled" => true });
                return Err(CycleError::Cancelled);
            }

            let result = if cycle.degraded {
                "Search skipped: the case law search is unavailable.".to_string()
            } else {
                match self.run_tool_call(cycle, call, &round_span).await {
                    Ok(result) => result,
                    Err(e) => {
                        cycle.trace.end_span(&round_span, SpanStatus::Error, attrs! { "cancelled" => true });
                        return Err(e);
                    }
                }
            };
            cycle
                .messages
                .push(EngineMessage::tool_result(call.id.as_str(), result));
        }

        let status = if cycle.degraded {
            SpanStatus::Error
        } else {
            SpanStatus::Ok
        };
        cycle.trace.end_span(
            &round_span,
            status,
            attrs! {
                "round" => cycle.round,
                "tool_calls" => calls.len(),
                "degraded" => cycle.degraded,
            },
        );

        Ok(if cycle.degraded {
            Phase::Synthesize(SynthesisReason::Degraded)
        } else {
            Phase::Plan
        })
    }

    /// Run one tool invocation and return the text handed back to the engine.
    async fn run_tool_call(
        &self,
        cycle: &mut Cycle<'_>,
        call: &ToolInvocation,
        round_span: &SpanHandle,
    ) -> Result<String, CycleError> {
        if call.name == TOOL_NAME {
            return self.run_search(cycle, call, round_span).await;
        }
        match &self.cases {
            Some(cases) if CaseLookupTool::handles(&call.name) => {
                self.run_lookup(cases, cycle, call, round_span).await
            }
            _ => {
                warn!(tool = %call.name, "Engine requested an unknown tool");
                let available: Vec<String> =
                    self.tool_definitions().into_iter().map(|t| t.name).collect();
                Ok(format!(
                    "Error: unknown tool '{}'. Available tools: {}.",
                    call.name,
                    available.join(", ")
                ))
            }
        }
    }

    /// A case.law lookup. Its result goes back to the engine as text and
    /// adds no numbered evidence.
    async fn run_lookup(
        &self,
        cases: &CaseLookupTool,
        cycle: &mut Cycle<'_>,
        call: &ToolInvocation,
        round_span: &SpanHandle,
    ) -> Result<String, CycleError> {
        let subject = CaseLookupTool::subject(&call.arguments);
        cycle
            .sink
            .emit(ResponseEvent::ToolCallStarted {
                id: call.id.clone(),
                tool: call.name.clone(),
                query: subject.clone(),
                top_k: 0,
            })
            .await;
        let span = cycle
            .trace
            .start_span(SpanKind::ToolCall, &call.name, Some(round_span));

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cycle.cancel.cancelled() => {
                cycle.trace.end_span(&span, SpanStatus::Error, attrs! { "cancelled" => true });
                return Err(CycleError::Cancelled);
            }
            result = cases.call(&call.name, &call.arguments) => result,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let record = ToolCallRecord {
            id: call.id.clone(),
            tool_name: call.name.clone(),
            query: subject,
            top_k: 0,
            passages: Vec::new(),
            latency_ms,
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        };
        cycle
            .sink
            .emit(ResponseEvent::ToolCallFinished {
                id: record.id.clone(),
                passages: 0,
                latency_ms,
                success: record.success,
            })
            .await;
        let mut attributes = attrs! {
            "tool" => call.name.as_str(),
            "subject" => record.query.as_str(),
            "source" => cases.source_name(),
            "latency_ms" => latency_ms,
            "success" => record.success,
        };
        if let Some(error) = &record.error {
            attributes.insert("error".into(), error.as_str().into());
        }
        let status = if record.success {
            SpanStatus::Ok
        } else {
            SpanStatus::Error
        };
        cycle.trace.end_span(&span, status, attributes);
        info!(
            session_id = %cycle.session_id,
            tool = %call.name,
            subject = %record.query,
            latency_ms,
            success = record.success,
            "Case lookup finished"
        );
        cycle.records.push(record);

        Ok(match result {
            Ok(text) => text,
            Err(e) => format!("Error: {e}"),
        })
    }

    /// A corpus search through the retrieval adapter.
    async fn run_search(
        &self,
        cycle: &mut Cycle<'_>,
        call: &ToolInvocation,
        round_span: &SpanHandle,
    ) -> Result<String, CycleError> {
        let args = match RetrievalArgs::parse(&call.arguments) {
            Ok(args) => args,
            Err(e) => return Ok(format!("Error: {e}")),
        };
        let query = derive_query(
            &args.query,
            cycle.utterance,
            &cycle.earlier_user_turns,
            self.settings.query_context_turns,
            self.settings.max_query_chars,
        );
        let filters = args.effective_filters();
        let top_k = self.retrieval.clamp_top_k(args.top_k);
        let request = match self.retrieval.request(&query, top_k, Some(&filters)) {
            Ok(request) => request,
            Err(e) => return Ok(format!("Error: {e}")),
        };

        if let Some(previous) = cycle.cache.lookup(&request) {
            debug!(query = %request.query, "Reusing search result from this cycle");
            let markers = cycle.ledger.add(previous);
            return Ok(format_evidence(&cycle.ledger.select(&markers)));
        }

        cycle
            .sink
            .emit(ResponseEvent::ToolCallStarted {
                id: call.id.clone(),
                tool: TOOL_NAME.into(),
                query: request.query.clone(),
                top_k: request.top_k,
            })
            .await;
        let span = cycle
            .trace
            .start_span(SpanKind::ToolCall, TOOL_NAME, Some(round_span));

        let (record, failure, attempts) =
            match self.search_with_retry(&call.id, request.clone(), cycle.cancel).await {
                Ok(searched) => searched,
                Err(e) => {
                    cycle.trace.end_span(&span, SpanStatus::Error, attrs! { "cancelled" => true });
                    return Err(e);
                }
            };

        cycle
            .sink
            .emit(ResponseEvent::ToolCallFinished {
                id: record.id.clone(),
                passages: record.passages.len(),
                latency_ms: record.latency_ms,
                success: record.success,
            })
            .await;
        let status = if record.success {
            SpanStatus::Ok
        } else {
            SpanStatus::Error
        };
        let mut attributes = attrs! {
            "query" => record.query.as_str(),
            "top_k" => record.top_k,
            "passages" => record.passages.len(),
            "latency_ms" => record.latency_ms,
            "attempts" => attempts,
            "success" => record.success,
        };
        if let Some(error) = &record.error {
            attributes.insert("error".into(), error.as_str().into());
        }
        cycle.trace.end_span(&span, status, attributes);
        info!(
            session_id = %cycle.session_id,
            query = %record.query,
            passages = record.passages.len(),
            latency_ms = record.latency_ms,
            success = record.success,
            "Search finished"
        );

        let result = match failure {
            None => {
                let markers = cycle.ledger.add(&record);
                format_evidence(&cycle.ledger.select(&markers))
            }
            Some(RetrievalError::InvalidQuery(message)) => format!(
                "Error: the search rejected the query ({message}). Rephrase it and try again."
            ),
            Some(e) => {
                warn!(session_id = %cycle.session_id, error = %e, "Retrieval unavailable, degrading");
                cycle.degraded = true;
                format!("Error: the case law search is unavailable ({e}).")
            }
        };

        cycle.cache.insert(&request, record.clone());
        cycle.records.push(record);
        Ok(result)
    }

    /// Search with retries on recoverable errors, halving `top_k` each time.
    ///
    /// Returns the record, the final error if every attempt failed, and the
    /// number of attempts.
    async fn search_with_retry(
        &self,
        call_id: &str,
        mut request: SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<(ToolCallRecord, Option<RetrievalError>, u32), CycleError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        let outcome = loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CycleError::Cancelled),
                result = self.retrieval.execute(&request) => result,
            };
            match result {
                Ok(passages) => break Ok(passages),
                Err(e) if e.is_recoverable() && attempt <= self.settings.retrieval_retries => {
                    let backoff = self.settings.retry_backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "Search failed, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(CycleError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    request.top_k = (request.top_k / 2).max(1);
                }
                Err(e) => break Err(e),
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        let (passages, failure) = match outcome {
            Ok(passages) => (passages, None),
            Err(e) => (Vec::new(), Some(e)),
        };
        let record = ToolCallRecord {
            id: call_id.to_string(),
            tool_name: TOOL_NAME.into(),
            query: request.query,
            top_k: request.top_k,
            passages,
            latency_ms,
            success: failure.is_none(),
            error: failure.as_ref().map(ToString::to_string),
        };
        Ok((record, failure, attempt))
    }

    /// A tool-less engine call that must produce the final answer.
    async fn synthesize_final(
        &self,
        cycle: &mut Cycle<'_>,
        reason: SynthesisReason,
    ) -> Result<Phase, CycleError> {
        let span = cycle
            .trace
            .start_span(SpanKind::Synthesis, "synthesis", Some(cycle.root));
        let note = match reason {
            SynthesisReason::RoundLimit => ROUND_LIMIT_NOTE,
            SynthesisReason::Degraded => DEGRADED_NOTE,
        };
        cycle.messages.push(EngineMessage::system(note));

        match self.call_engine(cycle, Vec::new(), &span).await {
            Ok(reply) => {
                cycle.trace.end_span(
                    &span,
                    SpanStatus::Ok,
                    attrs! { "reason" => reason.as_str(), "evidence" => cycle.ledger.len() },
                );
                Ok(Phase::Terminal(Draft {
                    text: reply.text,
                    partial_evidence: true,
                    degraded: reason == SynthesisReason::Degraded,
                }))
            }
            Err(Interrupt::Cancelled) => {
                cycle.trace.end_span(&span, SpanStatus::Error, attrs! { "cancelled" => true });
                Err(CycleError::Cancelled)
            }
            Err(Interrupt::Engine(e)) => {
                warn!(session_id = %cycle.session_id, error = %e, "Reasoning engine failed during synthesis");
                cycle.trace.end_span(&span, SpanStatus::Error, attrs! { "error" => e.to_string() });
                Ok(Phase::Fallback)
            }
        }
    }

    /// Resolve citations, persist the assistant turn and report the outcome.
    async fn finish(&self, cycle: Cycle<'_>, draft: Draft) -> Result<CycleOutcome, CycleError> {
        let synthesis = synthesize(&draft.text, &cycle.ledger);
        let referenced = markers_in(&draft.text);
        if referenced.len() > synthesis.citations.len() {
            debug!(
                session_id = %cycle.session_id,
                referenced = referenced.len(),
                resolved = synthesis.citations.len(),
                "Dropped markers without evidence"
            );
        }
        let text = if synthesis.text.is_empty() {
            NO_ANSWER_MESSAGE.to_string()
        } else {
            synthesis.text
        };

        if cycle.cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }
        let turn = Turn::assistant(text.as_str()).with_citations(synthesis.citations.clone());
        cycle.lease.append(turn).await;

        for citation in &synthesis.citations {
            cycle
                .sink
                .emit(ResponseEvent::CitationAdded {
                    citation: citation.clone(),
                })
                .await;
        }

        Ok(CycleOutcome {
            answer: escape_dollars(&text),
            citations: synthesis.citations,
            partial_evidence: draft.partial_evidence,
            degraded: draft.degraded || cycle.degraded,
            fallback: false,
            rounds: cycle.round,
            tool_calls: cycle.records,
        })
    }

    /// The fixed apology. Never persisted.
    fn fallback(cycle: Cycle<'_>) -> CycleOutcome {
        CycleOutcome {
            answer: FALLBACK_MESSAGE.to_string(),
            citations: Vec::new(),
            partial_evidence: false,
            degraded: cycle.degraded,
            fallback: true,
            rounds: cycle.round,
            tool_calls: cycle.records,
        }
    }

    async fn call_engine(
        &self,
        cycle: &Cycle<'_>,
        tools: Vec<ToolDefinition>,
        parent: &SpanHandle,
    ) -> Result<EngineReply, Interrupt> {
        let span = cycle
            .trace
            .start_span(SpanKind::EngineCall, self.engine.name(), Some(parent));
        let request = EngineRequest {
            model: self.settings.model.clone(),
            messages: cycle.messages.clone(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            tools,
        };

        let started = Instant::now();
        let result = self.stream_reply(request, cycle.sink, cycle.cancel).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(reply) => cycle.trace.end_span(
                &span,
                SpanStatus::Ok,
                attrs! {
                    "model" => self.settings.model.as_str(),
                    "latency_ms" => latency_ms,
                    "tool_calls" => reply.tool_calls.len(),
                    "chars" => reply.text.len(),
                },
            ),
            Err(Interrupt::Cancelled) => cycle.trace.end_span(
                &span,
                SpanStatus::Error,
                attrs! { "cancelled" => true, "latency_ms" => latency_ms },
            ),
            Err(Interrupt::Engine(e)) => cycle.trace.end_span(
                &span,
                SpanStatus::Error,
                attrs! { "error" => e.to_string(), "latency_ms" => latency_ms },
            ),
        }
        result
    }

    /// Stream one engine reply, forwarding text as it arrives.
    async fn stream_reply(
        &self,
        request: EngineRequest,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<EngineReply, Interrupt> {
        let timeout_ms = self.settings.engine_timeout.as_millis() as u64;
        let timed_out = || {
            Interrupt::Engine(EngineError::Timeout(format!(
                "no complete reply within {timeout_ms}ms"
            )))
        };
        let deadline = tokio::time::sleep(self.settings.engine_timeout);
        tokio::pin!(deadline);

        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
            _ = &mut deadline => return Err(timed_out()),
            rx = self.engine.stream(request) => rx.map_err(Interrupt::Engine)?,
        };

        let mut reply = EngineReply::default();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
                _ = &mut deadline => return Err(timed_out()),
                chunk = rx.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                return Err(Interrupt::Engine(EngineError::StreamInterrupted(
                    "stream closed before the final chunk".into(),
                )));
            };
            let chunk = chunk.map_err(Interrupt::Engine)?;

            if let Some(content) = chunk.content.filter(|c| !c.is_empty()) {
                reply.text.push_str(&content);
                sink.emit(ResponseEvent::PartialText { content }).await;
            }
            reply.tool_calls.extend(chunk.tool_calls);
            if chunk.done {
                return Ok(reply);
            }
        }
    }
}
