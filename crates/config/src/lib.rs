//! Configuration loading, validation, and management for juris.
//!
//! Loads configuration from `~/.juris/config.toml` with environment
//! variable overrides. Validated once at startup, then passed by value into
//! every component that needs it; nothing reads it from global state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.juris/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Reasoning engine API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// OpenAI-compatible base URL of the reasoning engine
    #[serde(default = "default_engine_url")]
    pub engine_url: String,

    /// Model name
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per engine response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Vector-search corpus
    #[serde(default)]
    pub corpus: CorpusConfig,

    /// case.law lookups offered beside corpus search
    #[serde(default)]
    pub caselaw: CaseLawConfig,

    /// Reasoning loop limits
    #[serde(default)]
    pub agent: AgentConfig,

    /// Conversation state store
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Trace export
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// HTTP gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Text shown by the chat UI
    #[serde(default)]
    pub demo: DemoConfig,
}

fn default_engine_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o".into()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    2048
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("engine_url", &self.engine_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("corpus", &self.corpus)
            .field("caselaw", &self.caselaw)
            .field("agent", &self.agent)
            .field("sessions", &self.sessions)
            .field("telemetry", &self.telemetry)
            .field("gateway", &self.gateway)
            .field("demo", &self.demo)
            .finish()
    }
}

impl std::fmt::Debug for CorpusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorpusConfig")
            .field("endpoint", &self.endpoint)
            .field("corpus_key", &self.corpus_key)
            .field("api_key", &redact(&self.api_key))
            .field("default_top_k", &self.default_top_k)
            .field("max_top_k", &self.max_top_k)
            .field("timeout_ms", &self.timeout_ms)
            .field("filter_template", &self.filter_template)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CorpusConfig {
    #[serde(default = "default_corpus_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub corpus_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Hard cap on top_k, must be within 1-20
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,

    #[serde(default = "default_corpus_timeout_ms")]
    pub timeout_ms: u64,

    /// Extra metadata filter always ANDed into searches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_template: Option<String>,
}

fn default_corpus_endpoint() -> String {
    "https://api.vectara.io".into()
}
fn default_top_k() -> usize {
    5
}
fn default_max_top_k() -> usize {
    20
}
fn default_corpus_timeout_ms() -> u64 {
    8_000
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            endpoint: default_corpus_endpoint(),
            corpus_key: String::new(),
            api_key: None,
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            timeout_ms: default_corpus_timeout_ms(),
            filter_template: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseLawConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Host of the case metadata JSON files
    #[serde(default = "default_caselaw_base_url")]
    pub base_url: String,

    #[serde(default = "default_corpus_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_caselaw_base_url() -> String {
    "https://static.case.law".into()
}

impl Default for CaseLawConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_caselaw_base_url(),
            timeout_ms: default_corpus_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum tool-invocation rounds per reasoning cycle
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Retries after a failed retrieval before degrading
    #[serde(default = "default_retrieval_retries")]
    pub retrieval_retries: u32,

    /// Prior user turns that may contribute to a derived query
    #[serde(default = "default_query_context_turns")]
    pub query_context_turns: usize,

    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,

    /// Token budget for the history sent to the engine
    #[serde(default = "default_context_budget")]
    pub context_budget_tokens: usize,

    #[serde(default = "default_engine_timeout_ms")]
    pub engine_timeout_ms: u64,

    /// Capacity of the per-request event channel
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Replaces the built-in legal assistant instructions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

fn default_max_rounds() -> u32 {
    4
}
fn default_retrieval_retries() -> u32 {
    1
}
fn default_query_context_turns() -> usize {
    2
}
fn default_max_query_chars() -> usize {
    512
}
fn default_context_budget() -> usize {
    3_000
}
fn default_engine_timeout_ms() -> u64 {
    60_000
}
fn default_stream_buffer() -> usize {
    128
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            retrieval_retries: default_retrieval_retries(),
            query_context_turns: default_query_context_turns(),
            max_query_chars: default_max_query_chars(),
            context_budget_tokens: default_context_budget(),
            engine_timeout_ms: default_engine_timeout_ms(),
            stream_buffer: default_stream_buffer(),
            instructions: None,
        }
    }
}

/// What to do with a request for a session that is already answering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Wait for the in-flight request to finish
    #[default]
    Queue,
    /// Fail fast with `SessionBusy`
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Token budget per session; oldest unpinned turns are evicted past it
    #[serde(default = "default_session_budget")]
    pub budget_tokens: usize,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default)]
    pub busy_policy: BusyPolicy,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_session_budget() -> usize {
    6_000
}
fn default_ttl_secs() -> u64 {
    3_600
}
fn default_max_sessions() -> usize {
    1_000
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            budget_tokens: default_session_budget(),
            ttl_secs: default_ttl_secs(),
            busy_policy: BusyPolicy::default(),
            max_sessions: default_max_sessions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Push endpoint for span trees; spans are logged when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Flushed trees waiting for export before the oldest is dropped
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    #[serde(default = "default_project")]
    pub project: String,
}

fn default_true() -> bool {
    true
}
fn default_buffer_capacity() -> usize {
    256
}
fn default_project() -> String {
    "juris".into()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            buffer_capacity: default_buffer_capacity(),
            project: default_project(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    8501
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    #[serde(default = "default_demo_name")]
    pub name: String,

    #[serde(default = "default_demo_welcome")]
    pub welcome: String,

    #[serde(default = "default_demo_description")]
    pub description: String,

    /// Example queries shown to the user
    #[serde(default)]
    pub examples: Vec<String>,
}

fn default_demo_name() -> String {
    "legal-agent".into()
}
fn default_demo_welcome() -> String {
    "Welcome to the Legal Assistant.".into()
}
fn default_demo_description() -> String {
    "Ask about past court cases and get answers grounded in the case law corpus, with citations."
        .into()
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            name: default_demo_name(),
            welcome: default_demo_welcome(),
            description: default_demo_description(),
            examples: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.juris/config.toml),
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides using the given lookup.
    ///
    /// Checked variables:
    /// - `JURIS_API_KEY`, then `OPENAI_API_KEY` (only when no key is configured)
    /// - `JURIS_MODEL`, `JURIS_ENGINE_URL`
    /// - `JURIS_CORPUS_KEY`, `JURIS_CORPUS_API_KEY`
    /// - `JURIS_TRACING_ENDPOINT`
    /// - `QUERY_EXAMPLES` (comma separated)
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = lookup("JURIS_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
        }
        if let Some(model) = lookup("JURIS_MODEL") {
            self.model = model;
        }
        if let Some(url) = lookup("JURIS_ENGINE_URL") {
            self.engine_url = url;
        }
        if let Some(key) = lookup("JURIS_CORPUS_KEY") {
            self.corpus.corpus_key = key;
        }
        if let Some(key) = lookup("JURIS_CORPUS_API_KEY") {
            self.corpus.api_key = Some(key);
        }
        if let Some(endpoint) = lookup("JURIS_TRACING_ENDPOINT") {
            self.telemetry.endpoint = Some(endpoint);
        }
        if let Some(examples) = lookup("QUERY_EXAMPLES") {
            self.demo.examples = examples
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".juris")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if !(1..=20).contains(&self.corpus.max_top_k) {
            return Err(ConfigError::ValidationError(
                "corpus.max_top_k must be between 1 and 20".into(),
            ));
        }

        if self.corpus.default_top_k == 0 || self.corpus.default_top_k > self.corpus.max_top_k {
            return Err(ConfigError::ValidationError(
                "corpus.default_top_k must be between 1 and corpus.max_top_k".into(),
            ));
        }

        if self.caselaw.enabled && !self.caselaw.base_url.starts_with("http") {
            return Err(ConfigError::ValidationError(
                "caselaw.base_url must be an http(s) URL".into(),
            ));
        }

        if self.agent.max_rounds == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_rounds must be > 0".into(),
            ));
        }

        if self.agent.context_budget_tokens == 0 || self.sessions.budget_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "token budgets must be > 0".into(),
            ));
        }

        if self.agent.stream_buffer == 0 || self.telemetry.buffer_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "buffer sizes must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an engine API key is available.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            engine_url: default_engine_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            corpus: CorpusConfig::default(),
            caselaw: CaseLawConfig::default(),
            agent: AgentConfig::default(),
            sessions: SessionsConfig::default(),
            telemetry: TelemetryConfig::default(),
            gateway: GatewayConfig::default(),
            demo: DemoConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
