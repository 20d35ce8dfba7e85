//! case.law lookups offered to the engine beside corpus search.
//!
//! Every lookup takes a case citation (`253 P.2d 136`) and reads the case
//! record JSON published on static.case.law. `validate_url` only checks a
//! link against the known case.law URL shapes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use juris_config::CaseLawConfig;
use juris_core::engine::ToolDefinition;
use juris_core::error::RetrievalError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::citation::{CaseCitation, CitationError, validate_url};

pub const OPINION_TEXT: &str = "get_opinion_text";
pub const CASE_NAME: &str = "get_case_name";
pub const CITED_CASES: &str = "get_cited_cases";
pub const CASE_PDF: &str = "get_case_document_pdf";
pub const CASE_PAGE: &str = "get_case_document_page";
pub const VALIDATE_URL: &str = "validate_url";

pub const TOOL_NAMES: [&str; 6] = [
    OPINION_TEXT,
    CASE_NAME,
    CITED_CASES,
    CASE_PDF,
    CASE_PAGE,
    VALIDATE_URL,
];

pub const CASE_NOT_FOUND: &str = "Case not found; please check the citation.";

const MAX_CITED_CASES: usize = 10;
const MAX_OPINION_CHARS: usize = 12_000;
const SUMMARY_CHARS: usize = 1_200;

/// One opinion of a case (majority, dissent, concurrence...).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Opinion {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub text: String,
}

/// The parts of a case.law case record the lookups use.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "RawCase")]
pub struct CaseRecord {
    pub name: String,
    pub name_abbreviation: String,
    /// Page of the case within its volume PDF.
    pub first_page_order: Option<u32>,
    pub opinions: Vec<Opinion>,
    /// Citations of the cases this one cites, in document order.
    pub cites_to: Vec<String>,
}

#[derive(Deserialize)]
struct RawCase {
    #[serde(default)]
    name: String,
    #[serde(default)]
    name_abbreviation: String,
    #[serde(default)]
    first_page_order: Option<serde_json::Value>,
    #[serde(default)]
    casebody: RawBody,
    #[serde(default)]
    cites_to: Vec<RawCite>,
}

#[derive(Default, Deserialize)]
struct RawBody {
    #[serde(default)]
    opinions: Vec<Opinion>,
}

#[derive(Deserialize)]
struct RawCite {
    cite: String,
}

impl From<RawCase> for CaseRecord {
    fn from(raw: RawCase) -> Self {
        let first_page_order = raw.first_page_order.and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        Self {
            name: raw.name,
            name_abbreviation: raw.name_abbreviation,
            first_page_order,
            opinions: raw.casebody.opinions,
            cites_to: raw.cites_to.into_iter().map(|c| c.cite).collect(),
        }
    }
}

/// Where case records come from.
#[async_trait]
pub trait CaseSource: Send + Sync {
    fn name(&self) -> &str;

    /// The record for `citation`, or `None` when no such case is published.
    async fn fetch(&self, citation: &CaseCitation) -> Result<Option<CaseRecord>, RetrievalError>;
}

/// Reads case records over HTTP from static.case.law (or a mirror).
pub struct CaseLawClient {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl CaseLawClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            client,
        }
    }

    pub fn from_config(config: &CaseLawConfig) -> Self {
        Self::new(&config.base_url, Duration::from_millis(config.timeout_ms))
    }
}

#[async_trait]
impl CaseSource for CaseLawClient {
    fn name(&self) -> &str {
        "case.law"
    }

    async fn fetch(&self, citation: &CaseCitation) -> Result<Option<CaseRecord>, RetrievalError> {
        let url = format!("{}/{}", self.base_url, citation.json_path());
        debug!(url = %url, "Fetching case record");

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                RetrievalError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                RetrievalError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        // The static host answers 403 rather than 404 for missing keys.
        if matches!(status, 403 | 404) {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RetrievalError::Unavailable(format!("status {status} for {url}")));
        }

        let record = response
            .json::<CaseRecord>()
            .await
            .map_err(|e| RetrievalError::Unavailable(format!("Failed to parse case record: {e}")))?;
        Ok(Some(record))
    }
}

/// In-memory case records for demos and tests.
#[derive(Default)]
pub struct StaticCases {
    cases: HashMap<CaseCitation, CaseRecord>,
}

impl StaticCases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record under `citation`. Unparseable citations are ignored.
    pub fn with_case(mut self, citation: &str, record: CaseRecord) -> Self {
        if let Ok(citation) = citation.parse() {
            self.cases.insert(citation, record);
        }
        self
    }
}

#[async_trait]
impl CaseSource for StaticCases {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self, citation: &CaseCitation) -> Result<Option<CaseRecord>, RetrievalError> {
        Ok(self.cases.get(citation).cloned())
    }
}

#[derive(Deserialize)]
struct CitationArgs {
    #[serde(default)]
    case_citation: String,
    #[serde(default)]
    summarize: bool,
}

#[derive(Deserialize)]
struct UrlArgs {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Serialize)]
struct CitedCase {
    citation: String,
    name: String,
    name_abbreviation: String,
}

/// The case lookup tools.
pub struct CaseLookupTool {
    source: Arc<dyn CaseSource>,
    timeout: Duration,
}

impl CaseLookupTool {
    pub fn new(source: Arc<dyn CaseSource>) -> Self {
        Self {
            source,
            timeout: Duration::from_secs(8),
        }
    }

    pub fn from_config(config: &CaseLawConfig) -> Self {
        Self::new(Arc::new(CaseLawClient::from_config(config)))
            .with_timeout(Duration::from_millis(config.timeout_ms))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn handles(name: &str) -> bool {
        TOOL_NAMES.contains(&name)
    }

    /// The citation or URL a call is about, for events and logs.
    pub fn subject(arguments: &str) -> String {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(arguments) else {
            return String::new();
        };
        value
            .get("case_citation")
            .or_else(|| value.get("url"))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    /// Run one lookup and return the text handed back to the engine.
    ///
    /// A citation with no published case is an answer ([`CASE_NOT_FOUND`]),
    /// not an error.
    pub async fn call(&self, name: &str, arguments: &str) -> Result<String, RetrievalError> {
        if name == VALIDATE_URL {
            let args: UrlArgs = parse_args(arguments)?;
            let verdict = if validate_url(args.url.trim()) {
                "URL is valid"
            } else {
                "URL is bad"
            };
            return Ok(verdict.into());
        }
        if !Self::handles(name) {
            return Err(RetrievalError::InvalidQuery(format!("unknown case tool '{name}'")));
        }

        let args: CitationArgs = parse_args(arguments)?;
        let citation: CaseCitation = args
            .case_citation
            .parse()
            .map_err(|e: CitationError| RetrievalError::InvalidQuery(e.to_string()))?;
        let Some(record) = self.fetch(&citation).await? else {
            return Ok(CASE_NOT_FOUND.into());
        };

        let text = match name {
            OPINION_TEXT => opinion_text(&record, args.summarize),
            CASE_NAME => serde_json::json!({
                "name": record.name,
                "name_abbreviation": record.name_abbreviation,
            })
            .to_string(),
            CASE_PDF => citation.pdf_url(record.first_page_order),
            CASE_PAGE => citation.page_url(),
            _ => self.cited_cases(&record).await?,
        };
        Ok(text)
    }

    async fn fetch(&self, citation: &CaseCitation) -> Result<Option<CaseRecord>, RetrievalError> {
        match tokio::time::timeout(self.timeout, self.source.fetch(citation)).await {
            Ok(result) => result,
            Err(_) => Err(RetrievalError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    async fn cited_cases(&self, record: &CaseRecord) -> Result<String, RetrievalError> {
        let lookups = record.cites_to.iter().take(MAX_CITED_CASES).map(|cite| async move {
            let found = match cite.parse::<CaseCitation>() {
                Ok(citation) => self.fetch(&citation).await.ok().flatten(),
                Err(_) => None,
            };
            let (name, name_abbreviation) = match found {
                Some(case) => (case.name, case.name_abbreviation),
                None => ("Case not found".to_string(), "Case not found".to_string()),
            };
            CitedCase {
                citation: cite.clone(),
                name,
                name_abbreviation,
            }
        });
        let cited = futures::future::join_all(lookups).await;
        serde_json::to_string(&cited).map_err(|e| RetrievalError::Unavailable(e.to_string()))
    }

    /// Tool definitions offered to the reasoning engine.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let citation = serde_json::json!({
            "type": "string",
            "description": "The case citation: volume, reporter and first page, e.g. '253 P.2d 136'"
        });
        let by_citation = |name: &str, description: &str| ToolDefinition {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "case_citation": citation },
                "required": ["case_citation"]
            }),
        };

        vec![
            ToolDefinition {
                name: OPINION_TEXT.into(),
                description: "Given a case citation, returns the full opinion text of the case. \
                    With summarize=true, returns the opening of each opinion instead. Several \
                    opinions are returned with their type and separated by semicolons."
                    .into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "case_citation": citation,
                        "summarize": {
                            "type": "boolean",
                            "description": "Return a short excerpt instead of the full text",
                            "default": false
                        }
                    },
                    "required": ["case_citation"]
                }),
            },
            by_citation(
                CASE_NAME,
                "Given a case citation, returns its name and name abbreviation.",
            ),
            by_citation(
                CITED_CASES,
                "Given a case citation, returns up to 10 cases cited by its opinion, each with \
                 citation, name and name_abbreviation.",
            ),
            by_citation(
                CASE_PDF,
                "Given a case citation, returns a link to a PDF of the case record.",
            ),
            by_citation(
                CASE_PAGE,
                "Given a case citation, returns a link to a page about the case. Use it only \
                 after get_case_document_pdf failed.",
            ),
            ToolDefinition {
                name: VALIDATE_URL.into(),
                description: "Given a link, says whether it is a valid case.law link. Invalid \
                    links must not be shown to the user."
                    .into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "A link to a case law document" }
                    },
                    "required": ["url"]
                }),
            },
        ]
    }
}

fn parse_args<T: DeserializeOwned>(raw: &str) -> Result<T, RetrievalError> {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw)
        .map_err(|e| RetrievalError::InvalidQuery(format!("bad tool arguments: {e}")))
}

fn opinion_text(record: &CaseRecord, summarize: bool) -> String {
    let render = |text: &str| {
        if summarize {
            excerpt(text, SUMMARY_CHARS)
        } else {
            excerpt(text, MAX_OPINION_CHARS)
        }
    };
    match record.opinions.as_slice() {
        [] => "No opinion text is published for this case.".into(),
        [only] => render(&only.text),
        many => many
            .iter()
            .map(|o| format!("Opinion type: {}, text: {};", o.kind, render(&o.text)))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// The start of `text`, at most `max_chars` long, cut after a sentence when
/// one ends in the second half.
fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    let cut = head
        .rfind(". ")
        .filter(|i| *i >= head.len() / 2)
        .map(|i| i + 1)
        .unwrap_or(head.len());
    format!("{} ...", head[..cut].trim_end())
}
