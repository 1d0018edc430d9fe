//! Semantic Scholar enrichment.
//!
//! Looks records up by DOI to fill empty abstracts and missing citation counts.
//!
//! API Details:
//! - Batch endpoint: POST /graph/v1/paper/batch
//! - Max 500 papers per request
//! - Rate limit: 1 req/s (unauthenticated), higher with API key

use crate::config::HttpSettings;
use crate::error::{Result, SysrevError};
use crate::http::{build_client, fetch_text, polite_user_agent};
use crate::record::{normalize_doi, BibRecord};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Semantic Scholar API base URL
const SS_API_BASE: &str = "https://api.semanticscholar.org/graph/v1";

/// Maximum papers per batch request
const MAX_BATCH_SIZE: usize = 500;

/// Pause between batch requests
const BATCH_DELAY: Duration = Duration::from_secs(1);

/// Fields Semantic Scholar can fill for one DOI
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaperDetails {
    pub abstract_text: String,
    pub citations: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SSPaper {
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    #[serde(rename = "citationCount")]
    citation_count: Option<u64>,
    #[serde(rename = "externalIds")]
    external_ids: Option<SSExternalIds>,
}

#[derive(Debug, Deserialize)]
struct SSExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
}

pub struct SemanticScholarClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    max_retries: u32,
}

impl SemanticScholarClient {
    pub fn new(settings: &HttpSettings, api_key: Option<String>) -> Result<Self> {
        let client = build_client(settings, &polite_user_agent(&settings.mailto))?;
        Ok(Self {
            client,
            api_key,
            base_url: SS_API_BASE.to_string(),
            max_retries: settings.max_retries,
        })
    }

    /// Point the client at another Graph API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Fill empty abstracts and missing citation counts in place.
    ///
    /// Returns the number of records that gained a value. A failed batch is
    /// logged and skipped.
    pub async fn enrich(&self, records: &mut [BibRecord]) -> usize {
        let dois = dois_needing_enrichment(records);
        if dois.is_empty() {
            debug!("No records need enrichment");
            return 0;
        }

        let batch_count = dois.len().div_ceil(MAX_BATCH_SIZE);
        info!(total = dois.len(), batches = batch_count, "Starting Semantic Scholar enrichment");

        let mut found = HashMap::new();
        for (batch_idx, chunk) in dois.chunks(MAX_BATCH_SIZE).enumerate() {
            match self.fetch_batch(chunk).await {
                Ok(papers) => {
                    info!(batch = batch_idx + 1, found = papers.len(), "Batch completed");
                    found.extend(papers);
                }
                Err(e) => {
                    warn!(batch = batch_idx + 1, error = %e, "Batch failed");
                }
            }

            if batch_idx + 1 < batch_count {
                tokio::time::sleep(BATCH_DELAY).await;
            }
        }

        let updated = apply_details(records, &found);
        info!(found = found.len(), updated = updated, "Semantic Scholar enrichment complete");
        updated
    }

    async fn fetch_batch(&self, dois: &[String]) -> Result<HashMap<String, PaperDetails>> {
        let url = format!(
            "{}/paper/batch?fields=abstract,externalIds,citationCount",
            self.base_url
        );
        let ids: Vec<String> = dois.iter().map(|d| format!("DOI:{}", d)).collect();
        let body = serde_json::json!({ "ids": ids });

        debug!(count = ids.len(), "Sending batch request");

        let text = fetch_text(
            || {
                let request = self.client.post(&url).json(&body);
                match &self.api_key {
                    Some(key) => request.header("x-api-key", key),
                    None => request,
                }
            },
            self.max_retries,
            "Semantic Scholar",
        )
        .await?;
        parse_batch(&text)
    }
}

/// Distinct normalised DOIs of records missing an abstract or citation count
fn dois_needing_enrichment(records: &[BibRecord]) -> Vec<String> {
    let mut dois: Vec<String> = records
        .iter()
        .filter(|r| r.abstract_text.is_empty() || r.citations.is_none())
        .map(|r| normalize_doi(&r.doi))
        .filter(|d| !d.is_empty())
        .collect();
    dois.sort();
    dois.dedup();
    dois
}

/// Parse a batch response (array with `null` for unknown ids) keyed by normalised DOI
fn parse_batch(body: &str) -> Result<HashMap<String, PaperDetails>> {
    let papers: Vec<Option<SSPaper>> = serde_json::from_str(body).map_err(|e| {
        SysrevError::Parse(format!("Failed to parse Semantic Scholar response: {}", e))
    })?;

    Ok(papers
        .into_iter()
        .flatten()
        .filter_map(|paper| {
            let doi = normalize_doi(&paper.external_ids?.doi?);
            if doi.is_empty() {
                return None;
            }
            let details = PaperDetails {
                abstract_text: paper.abstract_text.unwrap_or_default().trim().to_string(),
                citations: paper.citation_count,
            };
            Some((doi, details))
        })
        .collect())
}

/// Copy found details onto records without overwriting present values
fn apply_details(records: &mut [BibRecord], found: &HashMap<String, PaperDetails>) -> usize {
    let mut updated = 0;
    for record in records.iter_mut() {
        let Some(details) = found.get(&normalize_doi(&record.doi)) else {
            continue;
        };
        let mut changed = false;
        if record.abstract_text.is_empty() && !details.abstract_text.is_empty() {
            record.abstract_text = details.abstract_text.clone();
            changed = true;
        }
        if record.citations.is_none() && details.citations.is_some() {
            record.citations = details.citations;
            changed = true;
        }
        if changed {
            updated += 1;
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SourceDb;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn with_doi(title: &str, doi: &str) -> BibRecord {
        let mut r = BibRecord::new(SourceDb::Crossref, title);
        r.doi = doi.to_string();
        r
    }

    #[test]
    fn test_dois_needing_enrichment() {
        let mut complete = with_doi("complete", "10.1/c");
        complete.abstract_text = "Has one.".to_string();
        complete.citations = Some(3);

        let records = vec![
            with_doi("a", "https://doi.org/10.1/A"),
            with_doi("a again", "10.1/a"),
            complete,
            with_doi("no doi", ""),
        ];
        assert_eq!(dois_needing_enrichment(&records), vec!["10.1/a".to_string()]);
    }

    #[test]
    fn test_parse_batch() -> Result<()> {
        let body = r#"[
            {"paperId": "x1", "abstract": " Gut dysbiosis in fibromyalgia. ", "citationCount": 212,
             "externalIds": {"DOI": "10.1097/J.PAIN.1", "PubMed": "31219947"}},
            null,
            {"paperId": "x2", "abstract": null, "citationCount": 4, "externalIds": {}}
        ]"#;
        let found = parse_batch(body)?;
        assert_eq!(found.len(), 1);
        let details = &found["10.1097/j.pain.1"];
        assert_eq!(details.abstract_text, "Gut dysbiosis in fibromyalgia.");
        assert_eq!(details.citations, Some(212));
        Ok(())
    }

    #[test]
    fn test_parse_batch_rejects_non_array() {
        assert!(parse_batch(r#"{"error": "Unrecognized"}"#).is_err());
    }

    #[test]
    fn test_apply_details_keeps_present_values() {
        let mut has_abstract = with_doi("b", "10.1/b");
        has_abstract.abstract_text = "Original.".to_string();

        let mut records = vec![with_doi("a", "10.1/A"), has_abstract, with_doi("c", "10.1/c")];
        let found = HashMap::from([
            (
                "10.1/a".to_string(),
                PaperDetails {
                    abstract_text: "Filled.".to_string(),
                    citations: Some(5),
                },
            ),
            (
                "10.1/b".to_string(),
                PaperDetails {
                    abstract_text: "Replacement.".to_string(),
                    citations: None,
                },
            ),
        ]);

        assert_eq!(apply_details(&mut records, &found), 1);
        assert_eq!(records[0].abstract_text, "Filled.");
        assert_eq!(records[0].citations, Some(5));
        assert_eq!(records[1].abstract_text, "Original.");
        assert!(records[2].abstract_text.is_empty());
    }

    #[tokio::test]
    async fn test_enrich_retries_rate_limited_batch() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/paper/batch"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/paper/batch"))
            .and(header("x-api-key", "s2-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"abstract": "Filled.", "citationCount": 9, "externalIds": {"DOI": "10.1/A"}}]"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let settings = HttpSettings {
            max_retries: 1,
            ..HttpSettings::default()
        };
        let client =
            SemanticScholarClient::new(&settings, Some("s2-key".to_string()))?.with_base_url(server.uri());
        let mut records = vec![with_doi("a", "10.1/a")];

        assert_eq!(client.enrich(&mut records).await, 1);
        assert_eq!(records[0].abstract_text, "Filled.");
        assert_eq!(records[0].citations, Some(9));
        Ok(())
    }
}
