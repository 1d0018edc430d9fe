//! Multi-source literature search.
//!
//! Each configured source is queried one after another with a fixed delay in
//! between. A failing source is logged, recorded in its summary and
//! contributes no records; it never aborts the search.

use crate::clinicaltrials::ClinicalTrialsSource;
use crate::config::PipelineConfig;
use crate::crossref::CrossrefSource;
use crate::error::Result;
use crate::gscholar::ScholarSource;
use crate::openalex::OpenAlexSource;
use crate::pubmed::PubMedSource;
use crate::record::{BibRecord, SourceDb};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// A search request shared by all sources
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    /// Per-source cap
    pub max_results: usize,
    pub year_from: Option<i32>,
    pub year_to: Option<i32>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, max_results: usize) -> Self {
        Self {
            text: text.into(),
            max_results,
            year_from: None,
            year_to: None,
        }
    }

    pub fn from_config(text: impl Into<String>, config: &PipelineConfig) -> Self {
        Self {
            text: text.into(),
            max_results: config.max_results,
            year_from: config.year_from,
            year_to: config.year_to,
        }
    }
}

/// Common interface for all literature databases
#[async_trait]
pub trait LiteratureSource: Send + Sync {
    fn kind(&self) -> SourceDb;

    /// Search for records matching the query, at most `max_results`
    async fn search(&self, query: &SearchQuery) -> Result<Vec<BibRecord>>;
}

/// Outcome of one source within a multi-source search
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub source: SourceDb,
    pub count: usize,
    pub error: Option<String>,
}

/// Concatenated records plus per-source summaries
#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub records: Vec<BibRecord>,
    pub sources: Vec<SourceSummary>,
}

/// Sequential, rate-limited search over several sources
pub struct MultiSearch {
    sources: Vec<Box<dyn LiteratureSource>>,
    delay: Duration,
}

impl MultiSearch {
    pub fn new(delay: Duration) -> Self {
        Self {
            sources: Vec::new(),
            delay,
        }
    }

    /// Build the sources listed in the configuration
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let mut search = Self::new(config.http().delay);
        for kind in &config.sources {
            let source: Box<dyn LiteratureSource> = match kind {
                SourceDb::PubMed => Box::new(PubMedSource::new(config)?),
                SourceDb::OpenAlex => Box::new(OpenAlexSource::new(config)?),
                SourceDb::Crossref => Box::new(CrossrefSource::new(config)?),
                SourceDb::GoogleScholar => Box::new(ScholarSource::new(config)?),
                SourceDb::ClinicalTrials => Box::new(ClinicalTrialsSource::new(config)?),
            };
            search.push(source);
        }
        Ok(search)
    }

    pub fn push(&mut self, source: Box<dyn LiteratureSource>) {
        self.sources.push(source);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Query every source in order
    pub async fn run(&self, query: &SearchQuery) -> SearchOutcome {
        info!(
            query = %query.text,
            sources = self.sources.len(),
            max_results = query.max_results,
            "Starting multi-source search"
        );

        let mut outcome = SearchOutcome::default();

        for (idx, source) in self.sources.iter().enumerate() {
            if idx > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let kind = source.kind();
            match source.search(query).await {
                Ok(mut records) => {
                    records.truncate(query.max_results);
                    info!(source = %kind, count = records.len(), "Source search complete");
                    outcome.sources.push(SourceSummary {
                        source: kind,
                        count: records.len(),
                        error: None,
                    });
                    outcome.records.extend(records);
                }
                Err(e) => {
                    warn!(source = %kind, error = %e, "Source search failed, continuing");
                    outcome.sources.push(SourceSummary {
                        source: kind,
                        count: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        info!(total = outcome.records.len(), "Multi-source search complete");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SysrevError;

    struct FixedSource {
        kind: SourceDb,
        titles: Vec<&'static str>,
    }

    #[async_trait]
    impl LiteratureSource for FixedSource {
        fn kind(&self) -> SourceDb {
            self.kind
        }

        async fn search(&self, _query: &SearchQuery) -> Result<Vec<BibRecord>> {
            Ok(self
                .titles
                .iter()
                .map(|t| BibRecord::new(self.kind, *t))
                .collect())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl LiteratureSource for FailingSource {
        fn kind(&self) -> SourceDb {
            SourceDb::Crossref
        }

        async fn search(&self, _query: &SearchQuery) -> Result<Vec<BibRecord>> {
            Err(SysrevError::Api {
                code: 503,
                message: "unavailable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_failing_source_is_tolerated() {
        let mut search = MultiSearch::new(Duration::ZERO);
        search.push(Box::new(FixedSource {
            kind: SourceDb::PubMed,
            titles: vec!["a", "b"],
        }));
        search.push(Box::new(FailingSource));
        search.push(Box::new(FixedSource {
            kind: SourceDb::OpenAlex,
            titles: vec!["c"],
        }));

        let outcome = search.run(&SearchQuery::new("microbiome", 10)).await;

        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.sources.len(), 3);
        assert_eq!(outcome.sources[1].count, 0);
        assert!(outcome.sources[1]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("503")));
        assert_eq!(outcome.records[2].source, SourceDb::OpenAlex);
    }

    #[tokio::test]
    async fn test_results_capped_per_source() {
        let mut search = MultiSearch::new(Duration::ZERO);
        search.push(Box::new(FixedSource {
            kind: SourceDb::PubMed,
            titles: vec!["a", "b", "c", "d"],
        }));

        let outcome = search.run(&SearchQuery::new("tb", 2)).await;
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.sources[0].count, 2);
    }

    #[test]
    fn test_from_config_builds_configured_sources() -> Result<()> {
        let config = PipelineConfig {
            sources: vec![SourceDb::PubMed, SourceDb::ClinicalTrials],
            ..Default::default()
        };
        let search = MultiSearch::from_config(&config)?;
        assert_eq!(search.len(), 2);
        Ok(())
    }
}
