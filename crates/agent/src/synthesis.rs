//! Evidence numbering and citation synthesis.
//!
//! Passages retrieved during one reasoning cycle are numbered `[1]..[n]` in
//! retrieval order. The engine cites with those markers; the final answer
//! keeps only citations whose markers actually appear in the text.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use juris_core::retrieval::{Passage, ToolCallRecord};
use juris_core::session::Citation;
use juris_retrieval::case_url;
use regex_lite::{Captures, Regex};

/// One numbered passage in the cycle's evidence.
#[derive(Debug, Clone)]
pub struct EvidenceEntry {
    pub marker: usize,
    pub tool_call_id: String,
    pub passage: Passage,
}

impl EvidenceEntry {
    fn citation(&self) -> Citation {
        let mut citation = self.passage.cite(self.marker, &self.tool_call_id);
        citation.url = self.passage.metadata.get("citation").and_then(|c| case_url(c));
        citation
    }
}

/// Evidence gathered within a single reasoning cycle.
#[derive(Debug, Default)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number the passages of a successful tool call.
    ///
    /// A passage already in the ledger keeps its earlier marker. Returns the
    /// markers in the record's passage order.
    pub fn add(&mut self, record: &ToolCallRecord) -> Vec<usize> {
        record
            .passages
            .iter()
            .map(|passage| {
                if let Some(existing) = self
                    .entries
                    .iter()
                    .find(|e| e.passage.source_id == passage.source_id)
                {
                    return existing.marker;
                }
                let marker = self.entries.len() + 1;
                self.entries.push(EvidenceEntry {
                    marker,
                    tool_call_id: record.id.clone(),
                    passage: passage.clone(),
                });
                marker
            })
            .collect()
    }

    pub fn get(&self, marker: usize) -> Option<&EvidenceEntry> {
        marker.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    /// Entries for the given markers, in the given order.
    pub fn select(&self, markers: &[usize]) -> Vec<&EvidenceEntry> {
        markers.iter().filter_map(|m| self.get(*m)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The answer text with its citations.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub text: String,
    pub citations: Vec<Citation>,
}

fn marker_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\s?)\[(\d+(?:\s*,\s*\d+)*)\]").ok())
        .as_ref()
}

/// Resolve `[n]` markers against the ledger.
///
/// Markers that name no ledger entry are removed from the text. Citations
/// are listed in order of first appearance, each passage once.
pub fn synthesize(text: &str, ledger: &EvidenceLedger) -> Synthesis {
    let Some(re) = marker_regex() else {
        return Synthesis {
            text: text.trim().to_string(),
            citations: Vec::new(),
        };
    };
    let mut cited: Vec<usize> = Vec::new();
    let cleaned = re.replace_all(text, |caps: &Captures| {
        let known: Vec<usize> = caps[2]
            .split(',')
            .filter_map(|n| n.trim().parse::<usize>().ok())
            .filter(|n| ledger.get(*n).is_some())
            .collect();
        if known.is_empty() {
            return String::new();
        }
        for n in &known {
            if !cited.contains(n) {
                cited.push(*n);
            }
        }
        let list: Vec<String> = known.iter().map(usize::to_string).collect();
        format!("{}[{}]", &caps[1], list.join(", "))
    });

    let citations = ledger
        .select(&cited)
        .into_iter()
        .map(EvidenceEntry::citation)
        .collect();

    Synthesis {
        text: cleaned.trim().to_string(),
        citations,
    }
}

/// Remove every `[n]` marker. Markers from earlier cycles refer to evidence
/// that is no longer numbered.
pub fn strip_markers(text: &str) -> String {
    match marker_regex() {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// Markers present in a text, for checks and logging.
pub fn markers_in(text: &str) -> BTreeSet<usize> {
    let Some(re) = marker_regex() else {
        return BTreeSet::new();
    };
    re.captures_iter(text)
        .flat_map(|caps| {
            caps[2]
                .split(',')
                .filter_map(|n| n.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Escape `$` outside LaTeX spans so the UI's markdown renderer does not
/// treat dollar amounts as math.
///
/// `$$...$$` is always math. `$...$` on one line is math when its content
/// does not start with a digit or whitespace and does not end in whitespace.
/// Already escaped `\$` is left alone.
pub fn escape_dollars(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && chars.get(i + 1) == Some(&'$') {
            out.push_str("\\$");
            i += 2;
            continue;
        }
        if c != '$' {
            out.push(c);
            i += 1;
            continue;
        }

        if chars.get(i + 1) == Some(&'$')
            && let Some(end) = find_display_end(&chars, i + 2)
        {
            out.extend(&chars[i..end + 2]);
            i = end + 2;
            continue;
        }
        if let Some(end) = find_inline_end(&chars, i + 1) {
            out.extend(&chars[i..=end]);
            i = end + 1;
            continue;
        }

        out.push_str("\\$");
        i += 1;
    }
    out
}

fn find_display_end(chars: &[char], from: usize) -> Option<usize> {
    (from..chars.len().saturating_sub(1))
        .find(|&j| chars[j] == '$' && chars[j + 1] == '$')
        .filter(|&j| j > from)
}

fn find_inline_end(chars: &[char], from: usize) -> Option<usize> {
    let first = *chars.get(from)?;
    if first.is_ascii_digit() || first.is_whitespace() || first == '$' {
        return None;
    }
    let end = (from..chars.len())
        .take_while(|&j| chars[j] != '\n')
        .find(|&j| chars[j] == '$')?;
    (!chars[end - 1].is_whitespace()).then_some(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn passage(id: &str, score: f32, citation: Option<&str>) -> Passage {
        let mut metadata = BTreeMap::new();
        if let Some(c) = citation {
            metadata.insert("citation".to_string(), c.to_string());
        }
        Passage {
            source_id: format!("{id}#0"),
            document_id: id.into(),
            snippet: format!("{id} snippet"),
            score,
            document_date: None,
            metadata,
        }
    }

    fn record(id: &str, passages: Vec<Passage>) -> ToolCallRecord {
        ToolCallRecord {
            id: id.into(),
            tool_name: "search_caselaw".into(),
            query: "q".into(),
            top_k: 5,
            passages,
            latency_ms: 1,
            success: true,
            error: None,
        }
    }

    fn ledger() -> EvidenceLedger {
        let mut ledger = EvidenceLedger::new();
        ledger.add(&record(
            "call_1",
            vec![
                passage("konrad", 0.91, Some("14 Alaska 212")),
                passage("ravin", 0.77, None),
                passage("miller", 0.65, None),
            ],
        ));
        ledger
    }

    #[test]
    fn ledger_numbers_across_calls_and_reuses_markers() {
        let mut ledger = ledger();
        let markers = ledger.add(&record(
            "call_2",
            vec![passage("ravin", 0.8, None), passage("nome", 0.4, None)],
        ));
        assert_eq!(markers, vec![2, 4]);
        assert_eq!(ledger.len(), 4);
        assert_eq!(ledger.get(4).unwrap().tool_call_id, "call_2");
        assert_eq!(ledger.get(2).unwrap().tool_call_id, "call_1");
        assert!(ledger.get(0).is_none());
    }

    #[test]
    fn synthesize_keeps_only_referenced_passages() {
        let s = synthesize("Konrad's conviction was affirmed [1]. See also [3].", &ledger());
        let markers: Vec<usize> = s.citations.iter().map(|c| c.marker).collect();
        assert_eq!(markers, vec![1, 3]);
        assert_eq!(s.citations[0].document_ref, "konrad");
        assert_eq!(
            s.citations[0].url.as_deref(),
            Some("https://case.law/caselaw/?reporter=alaska&volume=14&case=0212-01")
        );
        assert!(s.citations[1].url.is_none());
    }

    #[test]
    fn synthesize_strips_unknown_markers() {
        let s = synthesize("Held [7]. Affirmed [1, 9].", &ledger());
        assert_eq!(s.text, "Held. Affirmed [1].");
        assert_eq!(s.citations.len(), 1);
    }

    #[test]
    fn synthesize_with_empty_ledger_has_no_citations() {
        let s = synthesize("I could not verify this [1].", &EvidenceLedger::new());
        assert_eq!(s.text, "I could not verify this.");
        assert!(s.citations.is_empty());
    }

    #[test]
    fn repeated_markers_cite_once() {
        let s = synthesize("A [2]. B [2]. C [1, 2].", &ledger());
        let markers: Vec<usize> = s.citations.iter().map(|c| c.marker).collect();
        assert_eq!(markers, vec![2, 1]);
    }

    #[test]
    fn markers_found_and_stripped() {
        assert_eq!(markers_in("x [1] y [2, 3]"), BTreeSet::from([1, 2, 3]));
        assert_eq!(strip_markers("Affirmed [1]. Reversed [2, 3]."), "Affirmed. Reversed.");
    }

    #[test]
    fn escape_dollars_outside_math() {
        assert_eq!(escape_dollars("damages of $5,000"), "damages of \\$5,000");
        assert_eq!(escape_dollars("$5 and $10"), "\\$5 and \\$10");
        assert_eq!(escape_dollars("rate $x$ applies"), "rate $x$ applies");
        assert_eq!(escape_dollars("$$a+b$$ costs $3"), "$$a+b$$ costs \\$3");
        assert_eq!(escape_dollars("already \\$2"), "already \\$2");
        assert_eq!(escape_dollars("no dollars"), "no dollars");
    }
}
