//! `juris ask`: single-question or interactive chat in the terminal.

use std::io::Write;

use anyhow::{Context, bail};
use futures::StreamExt;
use juris_agent::{ChatRequest, ResponseEvent, StreamCoordinator};
use juris_config::AppConfig;
use juris_core::session::{Citation, SessionId};
use juris_gateway::GatewayState;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub async fn run(message: Option<String>, session: Option<String>) -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    if !config.has_api_key() {
        warn!(
            config = %AppConfig::config_dir().join("config.toml").display(),
            "No engine API key configured; set JURIS_API_KEY or OPENAI_API_KEY"
        );
    }

    let state = GatewayState::from_config(&config);
    let shutdown = CancellationToken::new();
    let exporter = state.emitter.spawn_exporter(
        juris_telemetry::sink_from_config(&config.telemetry),
        shutdown.clone(),
    );

    let session_id = session
        .map(|s| SessionId::from(s.as_str()))
        .unwrap_or_default();

    let result = match message {
        Some(message) => answer(&state.coordinator, &session_id, message).await,
        None => interactive(&state.coordinator, &session_id).await,
    };

    shutdown.cancel();
    let _ = exporter.await;
    result
}

async fn interactive(coordinator: &StreamCoordinator, session_id: &SessionId) -> anyhow::Result<()> {
    println!();
    println!("  juris: case law research");
    println!("  Session: {session_id}");
    println!("  Type your question and press Enter. Type 'exit' to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if matches!(line, "exit" | "quit") {
            break;
        }
        if line.is_empty() {
            continue;
        }

        println!();
        if let Err(e) = answer(coordinator, session_id, line.to_string()).await {
            eprintln!("  {e}");
        }
        println!();
    }
    Ok(())
}

/// Stream one answer to stdout. Search activity goes to stderr.
///
/// Ctrl-C cancels the request; the stream then ends with an error event.
async fn answer(
    coordinator: &StreamCoordinator,
    session_id: &SessionId,
    message: String,
) -> anyhow::Result<()> {
    let mut stream = coordinator.stream(session_id.clone(), ChatRequest::new(message));
    let mut stdout = std::io::stdout();
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                stream.cancel();
                continue;
            }
        };
        let Some(event) = event else {
            return Ok(());
        };

        match event {
            ResponseEvent::PartialText { content } => {
                print!("{content}");
                stdout.flush()?;
            }
            ResponseEvent::ToolCallStarted { tool, query, top_k, .. } => {
                if top_k > 0 {
                    eprintln!("  [searching] {query}");
                } else {
                    eprintln!("  [{tool}] {query}");
                }
            }
            ResponseEvent::ToolCallFinished {
                passages,
                latency_ms,
                success,
                ..
            } => {
                if success {
                    eprintln!("  [{passages} passages, {latency_ms} ms]");
                } else {
                    eprintln!("  [search failed]");
                }
            }
            ResponseEvent::CitationAdded { .. } => {}
            ResponseEvent::Done {
                answer,
                citations,
                partial_evidence,
                degraded,
                fallback,
                ..
            } => {
                if fallback {
                    println!();
                    println!("{answer}");
                } else {
                    println!();
                }
                print!("{}", footer(&citations, partial_evidence, degraded));
                stdout.flush()?;
            }
            ResponseEvent::Error { message } => bail!(message),
        }
    }
}

/// Evidence notes and the source list printed after an answer.
fn footer(citations: &[Citation], partial_evidence: bool, degraded: bool) -> String {
    let mut out = String::new();
    if degraded {
        out.push_str("\n(The case law search was unavailable; this answer is unverified.)\n");
    } else if partial_evidence {
        out.push_str("\n(Based on partial evidence.)\n");
    }
    if !citations.is_empty() {
        out.push_str("\nSources:\n");
        for c in citations {
            out.push_str(&format!("  [{}] {}", c.marker, c.document_ref));
            if let Some(url) = &c.url {
                out.push_str(&format!("  {url}"));
            }
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn citation(marker: usize, document_ref: &str, url: Option<&str>) -> Citation {
        Citation {
            marker,
            source_id: format!("{document_ref}#0"),
            snippet: String::new(),
            score: 0.9,
            document_ref: document_ref.into(),
            tool_call_id: "call_1".into(),
            url: url.map(String::from),
        }
    }

    #[test]
    fn footer_lists_sources_with_links() {
        let out = footer(
            &[
                citation(
                    1,
                    "konrad-v-state",
                    Some("https://case.law/caselaw/?reporter=alaska&volume=14&case=0212-01"),
                ),
                citation(3, "ravin-v-state", None),
            ],
            false,
            false,
        );
        assert!(out.contains("Sources:"));
        assert!(out.contains("[1] konrad-v-state  https://case.law/"));
        assert!(out.contains("[3] ravin-v-state\n"));
    }

    #[test]
    fn footer_flags_unverified_answers() {
        assert!(footer(&[], true, true).contains("unverified"));
        assert!(footer(&[], true, false).contains("partial evidence"));
        assert!(footer(&[], false, false).is_empty());
    }
}
