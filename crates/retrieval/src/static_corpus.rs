//! In-memory corpus with keyword scoring.
//!
//! Used for offline demos and tests. Scores are the fraction of query terms
//! found in the passage, so results are deterministic.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use juris_core::error::RetrievalError;
use juris_core::retrieval::{Passage, SearchBackend, SearchRequest};

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "was", "what", "who", "how", "did", "does", "that", "this", "with",
    "are", "were", "which", "case", "about",
];

#[derive(Debug, Clone, Default)]
pub struct StaticCorpus {
    passages: Vec<Passage>,
}

impl StaticCorpus {
    pub fn new(passages: Vec<Passage>) -> Self {
        Self { passages }
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// A handful of Alaska case summaries for running without a corpus.
    pub fn alaska_sample() -> Self {
        let case = |id: &str, name: &str, citation: &str, date: &str, court: &str, text: &str| {
            let mut metadata = BTreeMap::new();
            metadata.insert("name".to_string(), name.to_string());
            metadata.insert("citation".to_string(), citation.to_string());
            metadata.insert("court".to_string(), court.to_string());
            metadata.insert("decision_date".to_string(), date.to_string());
            Passage {
                source_id: format!("{id}#0"),
                document_id: id.to_string(),
                snippet: text.to_string(),
                score: 0.0,
                document_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").ok(),
                metadata,
            }
        };

        Self::new(vec![
            case(
                "konrad-v-state",
                "Konrad v. State",
                "14 Alaska 212",
                "1953-02-17",
                "Alaska Territorial Court",
                "Konrad was convicted of manslaughter. The court held the jury instructions \
                 on self-defense adequate and affirmed the conviction.",
            ),
            case(
                "miller-v-sears",
                "Miller v. Sears",
                "636 P.2d 1183",
                "1981-11-20",
                "Alaska Supreme Court",
                "In Miller v. Sears the Alaska Supreme Court held that a seller of a used car \
                 may be liable for misrepresentation of the vehicle's condition.",
            ),
            case(
                "ravin-v-state",
                "Ravin v. State",
                "537 P.2d 494",
                "1975-05-27",
                "Alaska Supreme Court",
                "Ravin v. State held that the Alaska Constitution's right to privacy protects \
                 an adult's possession of a small amount of marijuana in the home.",
            ),
            case(
                "adverse-possession-nome",
                "Nome 2000 v. Fagerstrom",
                "799 P.2d 304",
                "1990-10-19",
                "Alaska Supreme Court",
                "Adverse possession requires possession that is continuous, open and notorious, \
                 exclusive and hostile to the true owner for the statutory period.",
            ),
        ])
    }
}

fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

fn matches_filters(passage: &Passage, filters: &BTreeMap<String, String>) -> bool {
    filters
        .iter()
        .all(|(k, v)| passage.metadata.get(k).is_some_and(|m| m.eq_ignore_ascii_case(v)))
}

#[async_trait]
impl SearchBackend for StaticCorpus {
    fn name(&self) -> &str {
        "static"
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Passage>, RetrievalError> {
        let query_terms = terms(&request.query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<Passage> = self
            .passages
            .iter()
            .filter(|p| matches_filters(p, &request.filters))
            .filter_map(|p| {
                let name = p.metadata.get("name").map(String::as_str).unwrap_or_default();
                let haystack = terms(&format!("{name} {}", p.snippet));
                let found = query_terms.iter().filter(|t| haystack.contains(*t)).count();
                (found > 0).then(|| Passage {
                    score: found as f32 / query_terms.len() as f32,
                    ..p.clone()
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(request.top_k);
        Ok(hits)
    }
}
