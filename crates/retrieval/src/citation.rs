//! Case citation parsing and case.law links.
//!
//! A case citation is `volume reporter first_page`, e.g. `253 P.2d 136`.
//! The reporter is turned into the slug used by static.case.law
//! (`P.2d` becomes `p2d`, `So. 2d` becomes `so-2d`).

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex_lite::Regex;
use thiserror::Error;

const STATIC_BASE: &str = "https://static.case.law";
const BROWSE_BASE: &str = "https://case.law/caselaw/";

/// A parsed case citation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaseCitation {
    pub volume: u32,
    /// Reporter slug, lowercase, dots removed, words joined by `-`.
    pub reporter: String,
    pub first_page: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CitationError {
    #[error("Citation must look like 'volume reporter page', got '{0}'")]
    Malformed(String),

    #[error("Citation volume/page must be numeric in '{0}'")]
    NotNumeric(String),
}

impl FromStr for CaseCitation {
    type Err = CitationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(CitationError::Malformed(s.to_string()));
        }
        let volume = parts[0]
            .parse()
            .map_err(|_| CitationError::NotNumeric(s.to_string()))?;
        let first_page = parts[parts.len() - 1]
            .parse()
            .map_err(|_| CitationError::NotNumeric(s.to_string()))?;
        let reporter = parts[1..parts.len() - 1]
            .join("-")
            .replace('.', "")
            .to_lowercase();
        if reporter.is_empty() {
            return Err(CitationError::Malformed(s.to_string()));
        }
        Ok(Self {
            volume,
            reporter,
            first_page,
        })
    }
}

impl fmt::Display for CaseCitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.volume, self.reporter, self.first_page)
    }
}

impl CaseCitation {
    /// Path of the case metadata JSON below the static host.
    pub fn json_path(&self) -> String {
        format!(
            "{}/{}/cases/{:04}-01.json",
            self.reporter, self.volume, self.first_page
        )
    }

    /// Scanned volume PDF, opened at `page` when known.
    pub fn pdf_url(&self, page: Option<u32>) -> String {
        let url = format!("{STATIC_BASE}/{}/{}.pdf", self.reporter, self.volume);
        match page {
            Some(page) => format!("{url}#page={page}"),
            None => url,
        }
    }

    /// Human-browsable page on case.law.
    pub fn page_url(&self) -> String {
        format!(
            "{BROWSE_BASE}?reporter={}&volume={}&case={:04}-01",
            self.reporter, self.volume, self.first_page
        )
    }
}

fn url_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^https://static\.case\.law/[a-z0-9-]+/\d+(\.pdf(#page=\d+)?|/cases/\d{4}-\d{2}\.json)$",
            r"^https://case\.law/caselaw/\?reporter=[a-z0-9-]+&volume=\d+&case=\d{4}-\d{2}$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Whether a URL points at a case.law resource this agent links to.
pub fn validate_url(url: &str) -> bool {
    url_patterns().iter().any(|re| re.is_match(url))
}

/// Link for a passage whose metadata carries a case citation.
pub fn case_url(citation: &str) -> Option<String> {
    let parsed: CaseCitation = citation.parse().ok()?;
    let url = parsed.page_url();
    validate_url(&url).then_some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_reporter() {
        let c: CaseCitation = "10 Alaska 11".parse().unwrap();
        assert_eq!(c.volume, 10);
        assert_eq!(c.reporter, "alaska");
        assert_eq!(c.first_page, 11);
    }

    #[test]
    fn parses_dotted_and_multiword_reporters() {
        let c: CaseCitation = "253 P.2d 136".parse().unwrap();
        assert_eq!(c.reporter, "p2d");
        let c: CaseCitation = "6 So. 2d 90".parse().unwrap();
        assert_eq!(c.reporter, "so-2d");
    }

    #[test]
    fn rejects_bad_citations() {
        assert!(matches!(
            "P.2d 136".parse::<CaseCitation>(),
            Err(CitationError::Malformed(_))
        ));
        assert!(matches!(
            "x P.2d 136".parse::<CaseCitation>(),
            Err(CitationError::NotNumeric(_))
        ));
    }

    #[test]
    fn urls_are_well_formed() {
        let c: CaseCitation = "253 P.2d 136".parse().unwrap();
        assert_eq!(c.json_path(), "p2d/253/cases/0136-01.json");
        assert_eq!(c.pdf_url(None), "https://static.case.law/p2d/253.pdf");
        assert_eq!(c.pdf_url(Some(141)), "https://static.case.law/p2d/253.pdf#page=141");
        assert!(validate_url(&format!("{STATIC_BASE}/{}", c.json_path())));
        assert!(validate_url(&c.pdf_url(None)));
        assert!(validate_url(&c.pdf_url(Some(141))));
        assert!(validate_url(&c.page_url()));
    }

    #[test]
    fn foreign_urls_rejected() {
        assert!(!validate_url("https://example.com/p2d/253.pdf"));
        assert!(!validate_url("http://static.case.law/p2d/253.pdf"));
        assert!(!validate_url("https://case.lawXcaselaw/"));
    }

    #[test]
    fn case_url_for_metadata() {
        assert_eq!(
            case_url("10 Alaska 11").as_deref(),
            Some("https://case.law/caselaw/?reporter=alaska&volume=10&case=0011-01")
        );
        assert!(case_url("not a citation").is_none());
    }
}
