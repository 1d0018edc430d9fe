//! OpenAlex works search source.
//!
//! API notes:
//! - `mailto` puts requests in the polite pool (10 req/s vs 1 req/s)
//! - `per-page` is capped at 200
//! - abstracts come back as an inverted index and are rebuilt here

use crate::config::{HttpSettings, PipelineConfig};
use crate::error::{Result, SysrevError};
use crate::http::{build_client, fetch_text, polite_user_agent};
use crate::record::{normalize_doi, BibRecord, SourceDb};
use crate::search::{LiteratureSource, SearchQuery};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

/// OpenAlex API base URL
const OPENALEX_API_BASE: &str = "https://api.openalex.org";

/// Maximum results per page (OpenAlex limit)
const MAX_PER_PAGE: usize = 200;

/// Fields requested from /works
const SELECT_FIELDS: &str = "id,display_name,publication_year,doi,cited_by_count,abstract_inverted_index,authorships,primary_location,best_oa_location,ids";

pub struct OpenAlexSource {
    client: Client,
    settings: HttpSettings,
}

impl OpenAlexSource {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let settings = config.http();
        let client = build_client(&settings, &polite_user_agent(&settings.mailto))?;
        Ok(Self { client, settings })
    }
}

#[async_trait]
impl LiteratureSource for OpenAlexSource {
    fn kind(&self) -> SourceDb {
        SourceDb::OpenAlex
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<BibRecord>> {
        let per_page = query.max_results.clamp(1, MAX_PER_PAGE);
        let mut records = Vec::new();
        let mut page = 1;

        while records.len() < query.max_results {
            if page > 1 {
                tokio::time::sleep(self.settings.delay).await;
            }

            let url = build_search_url(query, page, per_page, &self.settings.mailto);
            debug!(url = %url, page = page, "Fetching OpenAlex page");

            let body = fetch_text(|| self.client.get(&url), self.settings.max_retries, "OpenAlex").await?;
            let parsed = parse_response(&body)?;
            info!(
                page = page,
                returned = parsed.returned,
                count = parsed.records.len(),
                total = parsed.total,
                "Parsed OpenAlex results"
            );

            records.extend(parsed.records);
            if is_last_page(parsed.returned, per_page, page * per_page, parsed.total) {
                break;
            }
            page += 1;
        }

        records.truncate(query.max_results);
        Ok(records)
    }
}

/// Build OpenAlex API search URL
fn build_search_url(query: &SearchQuery, page: usize, per_page: usize, mailto: &str) -> String {
    let mut url = format!(
        "{}/works?search={}&per-page={}&page={}&mailto={}",
        OPENALEX_API_BASE,
        urlencoding::encode(&query.text),
        per_page,
        page,
        urlencoding::encode(mailto)
    );

    let mut filters = Vec::new();
    if let Some(from) = query.year_from {
        filters.push(format!("publication_year:>{}", from - 1));
    }
    if let Some(to) = query.year_to {
        filters.push(format!("publication_year:<{}", to + 1));
    }
    if !filters.is_empty() {
        url.push_str(&format!("&filter={}", filters.join(",")));
    }

    url.push_str("&select=");
    url.push_str(SELECT_FIELDS);
    url
}

// === OpenAlex API Response Types ===

#[derive(Debug, Deserialize)]
struct OpenAlexResponse {
    meta: OpenAlexMeta,
    #[serde(default)]
    results: Vec<OpenAlexWork>,
}

#[derive(Debug, Deserialize)]
struct OpenAlexMeta {
    #[serde(default)]
    count: i64,
}

#[derive(Debug, Deserialize)]
struct OpenAlexWork {
    id: Option<String>,
    display_name: Option<String>,
    publication_year: Option<i32>,
    doi: Option<String>,
    cited_by_count: Option<u64>,
    abstract_inverted_index: Option<serde_json::Value>,
    #[serde(default)]
    authorships: Vec<OpenAlexAuthorship>,
    primary_location: Option<OpenAlexLocation>,
    best_oa_location: Option<OpenAlexLocation>,
    ids: Option<OpenAlexIds>,
}

#[derive(Debug, Deserialize)]
struct OpenAlexAuthorship {
    author: Option<OpenAlexAuthor>,
}

#[derive(Debug, Deserialize)]
struct OpenAlexAuthor {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAlexLocation {
    source: Option<OpenAlexSourceInfo>,
    landing_page_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAlexSourceInfo {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAlexIds {
    pmid: Option<String>,
}

/// One parsed /works page
struct WorksPage {
    records: Vec<BibRecord>,
    /// Works in the page before untitled ones were dropped
    returned: usize,
    /// Total hits reported in `meta.count`
    total: i64,
}

/// Paging ends on a short page or once `seen` covers every hit
fn is_last_page(returned: usize, per_page: usize, seen: usize, total: i64) -> bool {
    returned < per_page || seen as i64 >= total
}

/// Parse a /works page into records and the total hit count
fn parse_response(json_str: &str) -> Result<WorksPage> {
    let response: OpenAlexResponse = serde_json::from_str(json_str)
        .map_err(|e| SysrevError::Parse(format!("Failed to parse OpenAlex response: {}", e)))?;

    let returned = response.results.len();
    let records = response
        .results
        .into_iter()
        .filter_map(work_to_record)
        .collect();

    Ok(WorksPage {
        records,
        returned,
        total: response.meta.count,
    })
}

fn work_to_record(work: OpenAlexWork) -> Option<BibRecord> {
    let title = work.display_name.filter(|t| !t.trim().is_empty())?;
    let mut record = BibRecord::new(SourceDb::OpenAlex, title.trim());

    record.doi = work.doi.as_deref().map(normalize_doi).unwrap_or_default();
    record.year = work.publication_year;
    record.citations = work.cited_by_count;
    record.authors = work
        .authorships
        .into_iter()
        .filter_map(|a| a.author.and_then(|a| a.display_name))
        .collect();

    // PMIDs come back as https://pubmed.ncbi.nlm.nih.gov/<id>
    if let Some(pmid) = work.ids.and_then(|ids| ids.pmid) {
        record.pmid = pmid
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
    }

    if let Some(location) = &work.primary_location {
        record.journal = location
            .source
            .as_ref()
            .and_then(|s| s.display_name.clone())
            .unwrap_or_default();
        record.url = location.landing_page_url.clone().unwrap_or_default();
    }
    if record.url.is_empty() {
        record.url = work
            .best_oa_location
            .and_then(|l| l.landing_page_url)
            .or(work.id)
            .unwrap_or_default();
    }

    if let Some(index) = &work.abstract_inverted_index {
        record.abstract_text = reconstruct_abstract(index);
    }

    Some(record)
}

/// Rebuild plaintext from OpenAlex's `{word: [positions]}` abstract index
fn reconstruct_abstract(inverted_index: &serde_json::Value) -> String {
    let Some(obj) = inverted_index.as_object() else {
        return String::new();
    };

    let mut words: Vec<(i64, &str)> = obj
        .iter()
        .flat_map(|(word, positions)| {
            positions
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|p| p.as_i64())
                .map(move |p| (p, word.as_str()))
        })
        .collect();

    words.sort_by_key(|(pos, _)| *pos);
    words.iter().map(|(_, w)| *w).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_search_url() {
        let query = SearchQuery {
            year_from: Some(2020),
            year_to: Some(2024),
            ..SearchQuery::new("gut microbiome fibromyalgia", 50)
        };

        let url = build_search_url(&query, 2, 50, "me@lab.org");
        assert!(url.contains("search=gut%20microbiome%20fibromyalgia"));
        assert!(url.contains("per-page=50"));
        assert!(url.contains("page=2"));
        assert!(url.contains("mailto=me%40lab.org"));
        assert!(url.contains("filter=publication_year:>2019,publication_year:<2025"));
    }

    #[test]
    fn test_parse_response() -> Result<()> {
        let body = r#"{
            "meta": {"count": 1, "per_page": 25, "page": 1},
            "results": [{
                "id": "https://openalex.org/W1",
                "display_name": "Rifampicin and gut dysbiosis",
                "publication_year": 2021,
                "doi": "https://doi.org/10.1/ABC",
                "cited_by_count": 12,
                "abstract_inverted_index": {"Antibiotics": [0], "dysbiosis.": [2], "cause": [1]},
                "authorships": [{"author": {"display_name": "A. Author"}}, {"author": null}],
                "primary_location": {"source": {"display_name": "Gut Microbes"}, "landing_page_url": null},
                "best_oa_location": {"source": null, "landing_page_url": "https://oa.example/1"},
                "ids": {"openalex": "https://openalex.org/W1", "pmid": "https://pubmed.ncbi.nlm.nih.gov/345"}
            }, {
                "id": "https://openalex.org/W2",
                "display_name": null
            }]
        }"#;

        let page = parse_response(body)?;
        assert_eq!(page.total, 1);
        assert_eq!(page.returned, 2);
        assert_eq!(page.records.len(), 1);

        let r = &page.records[0];
        assert_eq!(r.doi, "10.1/abc");
        assert_eq!(r.pmid, "345");
        assert_eq!(r.year, Some(2021));
        assert_eq!(r.citations, Some(12));
        assert_eq!(r.authors, vec!["A. Author"]);
        assert_eq!(r.journal, "Gut Microbes");
        assert_eq!(r.url, "https://oa.example/1");
        assert_eq!(r.abstract_text, "Antibiotics cause dysbiosis.");
        Ok(())
    }

    #[test]
    fn test_untitled_work_does_not_end_paging() {
        // Full page of 200 where one work was dropped for lacking a title
        assert!(!is_last_page(200, 200, 200, 5000));
        assert!(is_last_page(150, 200, 200, 5000));
        assert!(is_last_page(200, 200, 400, 400));
    }
}
