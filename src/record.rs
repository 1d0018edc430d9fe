//! Bibliographic record model shared by every pipeline stage.
//!
//! Records are created by a source search, merged during deduplication and
//! annotated by extraction/enrichment. Nothing is persisted beyond the flat
//! CSV/JSON files written per run.

use crate::error::SysrevError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Literature database a record was retrieved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceDb {
    PubMed,
    OpenAlex,
    Crossref,
    #[serde(rename = "gscholar")]
    GoogleScholar,
    ClinicalTrials,
}

impl SourceDb {
    /// All sources in the default search order
    pub const ALL: [SourceDb; 5] = [
        SourceDb::PubMed,
        SourceDb::OpenAlex,
        SourceDb::Crossref,
        SourceDb::GoogleScholar,
        SourceDb::ClinicalTrials,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceDb::PubMed => "pubmed",
            SourceDb::OpenAlex => "openalex",
            SourceDb::Crossref => "crossref",
            SourceDb::GoogleScholar => "gscholar",
            SourceDb::ClinicalTrials => "clinicaltrials",
        }
    }
}

impl fmt::Display for SourceDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceDb {
    type Err = SysrevError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pubmed" => Ok(SourceDb::PubMed),
            "openalex" => Ok(SourceDb::OpenAlex),
            "crossref" => Ok(SourceDb::Crossref),
            "gscholar" | "scholar" => Ok(SourceDb::GoogleScholar),
            "clinicaltrials" | "ctgov" => Ok(SourceDb::ClinicalTrials),
            other => Err(SysrevError::Validation(format!("Unknown source: {}", other))),
        }
    }
}

/// Qualitative outcome direction reported by a study
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectDirection {
    Increase,
    Decrease,
    Mixed,
    NoChange,
}

impl EffectDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectDirection::Increase => "increase",
            EffectDirection::Decrease => "decrease",
            EffectDirection::Mixed => "mixed",
            EffectDirection::NoChange => "no_change",
        }
    }
}

impl fmt::Display for EffectDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single bibliographic record
///
/// Identifier fields (`pmid`, `doi`, `url`) are empty strings when unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BibRecord {
    #[serde(default)]
    pub pmid: String,
    #[serde(default)]
    pub doi: String,
    #[serde(default)]
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub abstract_text: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub journal: String,
    #[serde(default)]
    pub year: Option<i32>,
    pub source: SourceDb,
    #[serde(default)]
    pub citations: Option<u64>,
    #[serde(default)]
    pub sample_size: Option<u32>,
    #[serde(default)]
    pub effect_direction: Option<EffectDirection>,
}

impl BibRecord {
    /// Create an empty record for a source
    pub fn new(source: SourceDb, title: impl Into<String>) -> Self {
        Self {
            pmid: String::new(),
            doi: String::new(),
            url: String::new(),
            title: title.into(),
            abstract_text: String::new(),
            authors: Vec::new(),
            journal: String::new(),
            year: None,
            source,
            citations: None,
            sample_size: None,
            effect_direction: None,
        }
    }

    /// Stable identifier: PMID, then DOI, then URL, then title hash
    pub fn key(&self) -> String {
        if !self.pmid.is_empty() {
            format!("pmid:{}", self.pmid)
        } else if !self.doi.is_empty() {
            format!("doi:{}", self.doi)
        } else if !self.url.is_empty() {
            format!("url:{}", self.url)
        } else {
            format!("title:{}", title_hash(&self.title))
        }
    }

    /// Title and abstract joined, the text extractors and screeners read
    pub fn text(&self) -> String {
        if self.abstract_text.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n{}", self.title, self.abstract_text)
        }
    }
}

/// Normalise a DOI: lower-case, resolver and `doi:` prefixes removed
pub fn normalize_doi(raw: &str) -> String {
    let doi = raw.trim().to_lowercase();
    let stripped = [
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
        "doi:",
    ]
    .iter()
    .find_map(|prefix| doi.strip_prefix(prefix))
    .unwrap_or(&doi);
    stripped.trim().to_string()
}

/// Lower-case alphanumeric characters of a title, whitespace removed
pub fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// SHA-256 hex digest of the normalised title
///
/// Returns an empty string for titles without alphanumeric content.
pub fn title_hash(title: &str) -> String {
    let normalized = normalize_title(title);
    if normalized.is_empty() {
        return String::new();
    }
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_doi() {
        assert_eq!(normalize_doi("https://doi.org/10.1000/ABC"), "10.1000/abc");
        assert_eq!(normalize_doi("doi:10.1/x "), "10.1/x");
        assert_eq!(normalize_doi("http://dx.doi.org/10.2/Y"), "10.2/y");
        assert_eq!(normalize_doi(""), "");
    }

    #[test]
    fn test_title_hash_ignores_case_and_punctuation() {
        let a = title_hash("Gut Microbiota in Fibromyalgia: A Review");
        let b = title_hash("gut microbiota in fibromyalgia - a review.");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(title_hash("  --  ").is_empty());
    }

    #[test]
    fn test_key_priority() {
        let mut record = BibRecord::new(SourceDb::PubMed, "Some title");
        assert!(record.key().starts_with("title:"));
        record.url = "https://example.org/a".to_string();
        assert_eq!(record.key(), "url:https://example.org/a");
        record.doi = "10.1/a".to_string();
        assert_eq!(record.key(), "doi:10.1/a");
        record.pmid = "123".to_string();
        assert_eq!(record.key(), "pmid:123");
    }

    #[test]
    fn test_source_round_trip() {
        for source in SourceDb::ALL {
            let parsed: SourceDb = source.as_str().parse().expect("known source");
            assert_eq!(parsed, source);
        }
        assert!("medline".parse::<SourceDb>().is_err());
        assert_eq!(
            serde_json::to_string(&SourceDb::GoogleScholar).expect("serialize"),
            "\"gscholar\""
        );
    }
}
