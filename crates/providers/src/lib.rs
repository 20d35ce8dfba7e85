//! Reasoning engine implementations for juris.
//!
//! All engines implement the `juris_core::ReasoningEngine` trait.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatEngine;

use std::sync::Arc;

use juris_config::AppConfig;
use juris_core::engine::ReasoningEngine;
use tracing::warn;

/// Build the configured reasoning engine.
pub fn build_from_config(config: &AppConfig) -> Arc<dyn ReasoningEngine> {
    let api_key = config.api_key.clone().unwrap_or_default();
    if api_key.is_empty() && !is_local(&config.engine_url) {
        warn!(url = %config.engine_url, "No engine API key configured; requests will be rejected");
    }
    let name = engine_name(&config.engine_url);
    Arc::new(OpenAiCompatEngine::new(name, &config.engine_url, api_key))
}

fn is_local(url: &str) -> bool {
    url.contains("localhost") || url.contains("127.0.0.1")
}

/// Short name for well-known endpoints, used in logs and traces.
fn engine_name(url: &str) -> &'static str {
    if url.contains("api.openai.com") {
        "openai"
    } else if url.contains("openrouter.ai") {
        "openrouter"
    } else if url.contains(":11434") {
        "ollama"
    } else {
        "openai-compatible"
    }
}
