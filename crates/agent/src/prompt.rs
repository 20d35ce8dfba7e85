//! Prompt assembly: instructions, history, evidence, search queries.

use juris_core::engine::EngineMessage;
use juris_core::session::{Role, Turn};

use crate::synthesis::{EvidenceEntry, strip_markers};

/// Standing instructions for the legal assistant. Stored as the pinned
/// first turn of every session.
pub const DEFAULT_INSTRUCTIONS: &str = "\
You are a helpful legal assistant with expertise in case law for the state of Alaska.
- The search_caselaw tool is your source for information about cases. Do not answer from your own knowledge.
- For a question with several parts, split it into sub-questions and search for each one separately, then combine the answers.
- If a search returns nothing useful, rephrase the query and search again.
- Search results are numbered passages like [3]. Support every statement with the marker of the passage it comes from, e.g. 'The conviction was affirmed [3].' Only use markers of passages you were given.
- When describing a ruling, use this form where the metadata allows: 'On <decision date>, the <court> ruled in <case name> that <ruling>.'
- Citations have three parts: volume, reporter and first page, e.g. '253 P.2d 136', '10 Alaska 11', '6 C.M.A. 3'. Never construct or guess a citation.
- If two cases conflict, treat the one with the more recent decision date as controlling.
- If the answer relies on decisions older than five years, tell the user the information may be outdated.
- To summarize a case, call get_opinion_text with summarize set to true.
- To point the user to a case document, call get_case_document_pdf first and get_case_document_page only if that fails. Show the link with the case's name abbreviation as its text.
- Check every URL with validate_url before showing it. Never provide URLs you were not given, and never construct URLs yourself.
- Never discuss politics, and always respond politely.";

/// Sent before a forced final answer once the round limit is reached.
pub const ROUND_LIMIT_NOTE: &str = "The search budget for this question is used up. \
Answer now using only the passages above, citing them with their [n] markers. \
Say which parts of the question the evidence does not cover.";

/// Sent before a final answer when the corpus could not be searched.
pub const DEGRADED_NOTE: &str = "The case law search is unavailable right now. \
Answer briefly from the passages above, if any. Tell the user the answer could not be \
verified against the case law corpus and suggest trying again later.";

/// Fixed answer when the reasoning engine fails.
pub const FALLBACK_MESSAGE: &str = "I'm sorry, I couldn't complete an answer right now. \
Please try again in a moment.";

/// Used when a forced final answer comes back empty.
pub const NO_ANSWER_MESSAGE: &str = "I wasn't able to find enough in the case law to answer \
that. Could you rephrase the question or narrow it to a specific case?";

pub const BUSY_MESSAGE: &str = "I'm still working on your previous question. \
Please wait for it to finish.";

pub const CANCELLED_MESSAGE: &str = "Request cancelled.";

pub const EMPTY_MESSAGE: &str = "Please enter a question.";

/// The turns a reasoning cycle plans with: every pinned turn plus the
/// current exchange and at most `context_turns` exchanges before it.
///
/// An exchange starts at a user turn. The current utterance is the last
/// user turn in `turns`.
pub fn recent_exchanges(turns: &[Turn], context_turns: usize) -> Vec<Turn> {
    let user_starts: Vec<usize> = turns
        .iter()
        .enumerate()
        .filter(|(_, t)| t.role == Role::User && !t.pinned)
        .map(|(i, _)| i)
        .collect();
    let start = user_starts
        .len()
        .checked_sub(context_turns + 1)
        .map_or(0, |i| user_starts[i]);
    turns
        .iter()
        .enumerate()
        .filter(|(i, t)| t.pinned || *i >= start)
        .map(|(_, t)| t.clone())
        .collect()
}

/// Convert stored turns into engine context.
///
/// Past assistant answers lose their evidence markers; tool turns are not
/// replayed.
pub fn history_messages(turns: &[Turn]) -> Vec<EngineMessage> {
    turns
        .iter()
        .filter_map(|turn| match turn.role {
            Role::System => Some(EngineMessage::system(turn.content.as_str())),
            Role::User => Some(EngineMessage::user(turn.content.as_str())),
            Role::Assistant => Some(EngineMessage::assistant(strip_markers(&turn.content))),
            Role::Tool => None,
        })
        .collect()
}

/// Render numbered passages as a tool result.
pub fn format_evidence(entries: &[&EvidenceEntry]) -> String {
    if entries.is_empty() {
        return "No passages matched the query.".into();
    }

    entries
        .iter()
        .map(|entry| {
            let meta = &entry.passage.metadata;
            let mut header = format!("[{}]", entry.marker);
            if let Some(name) = meta.get("name") {
                header.push(' ');
                header.push_str(name);
            }
            if let Some(citation) = meta.get("citation") {
                header.push_str(&format!(" ({citation})"));
            }
            if let Some(court) = meta.get("court") {
                header.push_str(&format!(", {court}"));
            }
            if let Some(date) = entry.passage.document_date {
                header.push_str(&format!(", decided {date}"));
            }
            header.push_str(&format!(", score {:.2}", entry.passage.score));
            format!("{header}\n{}", entry.passage.snippet)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The query sent to the corpus.
///
/// The engine's proposed query wins. Without one, the query is the current
/// utterance preceded by at most `context_turns` earlier user turns. Either
/// way it is capped at `max_chars`, keeping the most recent text.
pub fn derive_query(
    proposed: &str,
    utterance: &str,
    earlier_user_turns: &[String],
    context_turns: usize,
    max_chars: usize,
) -> String {
    let proposed = proposed.trim();
    let query = if proposed.is_empty() {
        let skip = earlier_user_turns.len().saturating_sub(context_turns);
        earlier_user_turns[skip..]
            .iter()
            .map(|t| t.trim())
            .chain(std::iter::once(utterance.trim()))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        proposed.split_whitespace().collect::<Vec<_>>().join(" ")
    };
    keep_tail(&query, max_chars)
}

fn keep_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use juris_core::retrieval::Passage;
    use std::collections::BTreeMap;

    #[test]
    fn history_drops_tool_turns_and_old_markers() {
        let turns = vec![
            Turn::system("be helpful"),
            Turn::user("Tell me about Konrad"),
            Turn::tool("[1] Konrad v. State"),
            Turn::assistant("Konrad's conviction was affirmed [1]."),
        ];
        let messages = history_messages(&turns);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[2].content, "Konrad's conviction was affirmed.");
    }

    #[test]
    fn planning_window_keeps_pinned_and_recent_exchanges() {
        let mut turns = vec![Turn::system("instructions")];
        for i in 0..5 {
            turns.push(Turn::user(format!("q{i}")));
            turns.push(Turn::assistant(format!("a{i}")));
        }
        turns.push(Turn::user("current"));

        let window = recent_exchanges(&turns, 2);
        let contents: Vec<&str> = window.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["instructions", "q3", "a3", "q4", "a4", "current"]);

        let window = recent_exchanges(&turns, 0);
        let contents: Vec<&str> = window.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["instructions", "current"]);
    }

    #[test]
    fn short_history_is_kept_whole() {
        let turns = vec![Turn::system("instructions"), Turn::user("q0"), Turn::assistant("a0"), Turn::user("now")];
        assert_eq!(recent_exchanges(&turns, 2).len(), 4);
    }

    #[test]
    fn evidence_lists_metadata_and_snippet() {
        let mut metadata = BTreeMap::new();
        metadata.insert("name".to_string(), "Konrad v. State".to_string());
        metadata.insert("citation".to_string(), "14 Alaska 212".to_string());
        let entry = EvidenceEntry {
            marker: 2,
            tool_call_id: "call_1".into(),
            passage: Passage {
                source_id: "konrad#0".into(),
                document_id: "konrad".into(),
                snippet: "The conviction was affirmed.".into(),
                score: 0.91,
                document_date: chrono::NaiveDate::from_ymd_opt(1953, 2, 17),
                metadata,
            },
        };
        let text = format_evidence(&[&entry]);
        assert!(text.starts_with("[2] Konrad v. State (14 Alaska 212), decided 1953-02-17, score 0.91\n"));
        assert!(text.ends_with("The conviction was affirmed."));
    }

    #[test]
    fn empty_evidence_says_so() {
        assert_eq!(format_evidence(&[]), "No passages matched the query.");
    }

    #[test]
    fn proposed_query_wins() {
        let q = derive_query("  konrad   self defense ", "what about it?", &[], 2, 512);
        assert_eq!(q, "konrad self defense");
    }

    #[test]
    fn fallback_query_uses_only_recent_user_turns() {
        let earlier = vec![
            "first question".to_string(),
            "Tell me about Ravin".to_string(),
            "and privacy?".to_string(),
        ];
        let q = derive_query("", "what did the court hold", &earlier, 2, 512);
        assert_eq!(q, "Tell me about Ravin and privacy? what did the court hold");
        assert!(!q.contains("first question"));
    }

    #[test]
    fn query_is_capped_keeping_the_end() {
        let q = derive_query("", "adverse possession", &["x".repeat(600)], 2, 40);
        assert!(q.chars().count() <= 40);
        assert!(q.ends_with("adverse possession"));
    }
}
