//! HTTP API gateway for juris.
//!
//! Exposes the chat API the UI talks to (streaming and blocking chat,
//! session read and reset, demo metadata) and a health check.
//!
//! Built on Axum.

pub mod api_v1;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, Method, header};
use axum::{Router, extract::State, response::Json, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use juris_agent::{AgentSettings, Orchestrator, StreamCoordinator};
use juris_config::{AppConfig, DemoConfig};
use juris_core::engine::ReasoningEngine;
use juris_core::retrieval::SearchBackend;
use juris_retrieval::{CaseLookupTool, RetrievalTool};
use juris_sessions::ConversationStore;
use juris_telemetry::{TelemetryStats, TraceEmitter};

/// How often sessions idle past their TTL are swept.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Chat messages are short; anything bigger is rejected before parsing.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub coordinator: StreamCoordinator,
    pub store: Arc<ConversationStore>,
    pub emitter: TraceEmitter,
    pub demo: DemoConfig,
    pub start_time: DateTime<Utc>,
}

pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    /// Wire the reasoning cycle around the given engine and corpus.
    pub fn new(
        config: &AppConfig,
        engine: Arc<dyn ReasoningEngine>,
        backend: Arc<dyn SearchBackend>,
    ) -> Self {
        let store = Arc::new(ConversationStore::new(&config.sessions));
        let emitter = TraceEmitter::new(&config.telemetry);
        let retrieval = Arc::new(RetrievalTool::from_config(backend, &config.corpus));
        let mut orchestrator = Orchestrator::new(
            engine,
            retrieval,
            store.clone(),
            emitter.clone(),
            AgentSettings::from_config(config),
        );
        if config.caselaw.enabled {
            orchestrator =
                orchestrator.with_case_lookup(Arc::new(CaseLookupTool::from_config(&config.caselaw)));
        }
        let orchestrator = Arc::new(orchestrator);

        Self {
            coordinator: StreamCoordinator::new(orchestrator, config.agent.stream_buffer),
            store,
            emitter,
            demo: config.demo.clone(),
            start_time: Utc::now(),
        }
    }

    /// State backed by the configured engine and corpus.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config,
            juris_providers::build_from_config(config),
            juris_retrieval::backend_from_config(&config.corpus),
        )
    }
}

/// Build the full router: `/health` plus the v1 API.
///
/// Layers applied:
/// - Request body size limit
/// - CORS for the chat UI (any origin, chat and session methods only)
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .expose_headers([HeaderName::from_static(api_v1::SESSION_HEADER)])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .with_state(state.clone())
        .nest("/v1", api_v1::v1_router(state))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
///
/// Runs until Ctrl-C, then stops the background tasks and exports any
/// traces still buffered.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let state = Arc::new(GatewayState::from_config(&config));
    let shutdown = CancellationToken::new();

    let exporter = state.emitter.spawn_exporter(
        juris_telemetry::sink_from_config(&config.telemetry),
        shutdown.clone(),
    );
    let sweeper = spawn_session_sweeper(state.store.clone(), PURGE_INTERVAL, shutdown.clone());

    let app = build_router(state);

    info!(addr = %addr, model = %config.model, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = signal.cancelled() => {}
            }
        })
        .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    let _ = exporter.await;
    info!("Gateway stopped");
    Ok(())
}

/// Periodically remove sessions idle past their TTL.
pub fn spawn_session_sweeper(
    store: Arc<ConversationStore>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = store.purge_expired().await;
                    if purged > 0 {
                        debug!(purged, "Session sweep");
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    })
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
    sessions: usize,
    telemetry: TelemetryStats,
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (Utc::now() - state.start_time).num_seconds(),
        sessions: state.store.len().await,
        telemetry: state.emitter.stats(),
    })
}
