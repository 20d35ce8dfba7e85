//! HTTP API v1: the surface the chat UI talks to.
//!
//! Endpoints:
//!
//! - `POST   /v1/chat/stream`     Send a message, get an SSE stream of response events
//! - `POST   /v1/chat`            Send a message, get the finished answer
//! - `GET    /v1/sessions/{id}`   Read a session's turns
//! - `DELETE /v1/sessions/{id}`   Reset a session
//! - `GET    /v1/demo`            Welcome text and example queries

use std::convert::Infallible;

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use juris_agent::{ChatRequest, CycleError, CycleOutcome, ResponseEvent};
use juris_config::DemoConfig;
use juris_core::error::SessionError;
use juris_core::session::{Citation, Session, SessionId};

use crate::SharedState;

/// Response header carrying the session a streamed answer belongs to.
pub const SESSION_HEADER: &str = "x-session-id";

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/chat/stream", post(chat_stream_handler))
        .route(
            "/sessions/{id}",
            get(get_session_handler).delete(reset_session_handler),
        )
        .route("/demo", get(demo_handler))
        .with_state(state)
}

// ── DTOs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    /// Omitted on the first message of a conversation.
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

impl ChatBody {
    fn session(&self) -> SessionId {
        match self.session_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => SessionId::from(id),
            _ => SessionId::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub partial_evidence: bool,
    pub degraded: bool,
    pub fallback: bool,
    pub rounds: u32,
    pub tool_calls: usize,
}

impl ChatResponse {
    fn new(session_id: &SessionId, outcome: CycleOutcome) -> Self {
        Self {
            session_id: session_id.to_string(),
            tool_calls: outcome.tool_calls.len(),
            answer: outcome.answer,
            citations: outcome.citations,
            partial_evidence: outcome.partial_evidence,
            degraded: outcome.degraded,
            fallback: outcome.fallback,
            rounds: outcome.rounds,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn cycle_error(error: &CycleError) -> ApiError {
    let status = match error {
        CycleError::Busy(_) => StatusCode::CONFLICT,
        CycleError::EmptyUtterance => StatusCode::BAD_REQUEST,
        CycleError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    };
    api_error(status, error.user_message())
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `POST /v1/chat`: answer and return once the cycle is done.
async fn chat_handler(
    State(state): State<SharedState>,
    Json(payload): Json<ChatBody>,
) -> Result<Json<ChatResponse>, ApiError> {
    let session_id = payload.session();
    info!(session_id = %session_id, "v1/chat request");

    let outcome = state
        .coordinator
        .ask(&session_id, &ChatRequest::new(payload.message))
        .await
        .map_err(|e| cycle_error(&e))?;

    Ok(Json(ChatResponse::new(&session_id, outcome)))
}

/// `POST /v1/chat/stream`: answer as a stream of server-sent events.
///
/// Each event is named after its `type`. Closing the connection cancels
/// the request.
async fn chat_stream_handler(
    State(state): State<SharedState>,
    Json(payload): Json<ChatBody>,
) -> Response {
    let session_id = payload.session();
    info!(session_id = %session_id, "v1/chat/stream SSE request");

    let events = state
        .coordinator
        .stream(session_id.clone(), ChatRequest::new(payload.message));
    let sse = Sse::new(sse_events(events)).keep_alive(KeepAlive::default());

    match HeaderValue::from_str(session_id.as_str()) {
        Ok(value) => ([(HeaderName::from_static(SESSION_HEADER), value)], sse).into_response(),
        Err(_) => sse.into_response(),
    }
}

fn sse_events(
    events: impl Stream<Item = ResponseEvent>,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().event(event.event_type()).data(data))
    })
}

/// `GET /v1/sessions/{id}`
async fn get_session_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    match state.store.snapshot(&SessionId::from(id.as_str())).await {
        Ok(session) => Ok(Json(session)),
        Err(SessionError::NotFound(_)) => Err(api_error(StatusCode::NOT_FOUND, "Session not found")),
        Err(SessionError::Busy(_)) => Err(api_error(StatusCode::CONFLICT, "Session is busy")),
    }
}

/// `DELETE /v1/sessions/{id}`
async fn reset_session_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.store.reset(&SessionId::from(id.as_str())).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) | Err(SessionError::NotFound(_)) => {
            Err(api_error(StatusCode::NOT_FOUND, "Session not found"))
        }
        Err(SessionError::Busy(_)) => Err(api_error(StatusCode::CONFLICT, "Session is busy")),
    }
}

/// `GET /v1/demo`
async fn demo_handler(State(state): State<SharedState>) -> Json<DemoConfig> {
    Json(state.demo.clone())
}

// ── Tests ─────────────────────────────────────────────────────────────────
