//! Crossref works search source.
//!
//! Uses `query.bibliographic` with offset pagination. Crossref abstracts are
//! JATS XML fragments; tags are stripped before storing.

use crate::config::{HttpSettings, PipelineConfig};
use crate::error::{Result, SysrevError};
use crate::http::{build_client, fetch_text, polite_user_agent};
use crate::record::{normalize_doi, BibRecord, SourceDb};
use crate::search::{LiteratureSource, SearchQuery};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

/// Crossref API base URL
const CROSSREF_API_URL: &str = "https://api.crossref.org/works";

/// Crossref caps `rows` at 1000
const MAX_ROWS: usize = 1000;

const SELECT_FIELDS: &str = "DOI,title,author,container-title,published,abstract,is-referenced-by-count,URL";

pub struct CrossrefSource {
    client: Client,
    settings: HttpSettings,
    tag_regex: Regex,
}

impl CrossrefSource {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let settings = config.http();
        let client = build_client(&settings, &polite_user_agent(&settings.mailto))?;
        Ok(Self {
            client,
            settings,
            tag_regex: tag_regex()?,
        })
    }

    fn params(&self, query: &SearchQuery, rows: usize, offset: usize) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("query.bibliographic", query.text.clone()),
            ("rows", rows.to_string()),
            ("offset", offset.to_string()),
            ("select", SELECT_FIELDS.to_string()),
            ("mailto", self.settings.mailto.clone()),
        ];
        if let Some(filter) = build_filter(query) {
            params.push(("filter", filter));
        }
        params
    }
}

#[async_trait]
impl LiteratureSource for CrossrefSource {
    fn kind(&self) -> SourceDb {
        SourceDb::Crossref
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<BibRecord>> {
        let rows = query.max_results.clamp(1, MAX_ROWS);
        let mut records = Vec::new();
        let mut offset = 0;

        while records.len() < query.max_results {
            if offset > 0 {
                tokio::time::sleep(self.settings.delay).await;
            }

            let params = self.params(query, rows, offset);
            debug!(offset = offset, rows = rows, "Fetching Crossref page");
            let body = fetch_text(
                || self.client.get(CROSSREF_API_URL).query(&params),
                self.settings.max_retries,
                "Crossref",
            )
            .await?;

            let parsed = parse_response(&body, &self.tag_regex)?;
            info!(
                offset = offset,
                returned = parsed.returned,
                count = parsed.records.len(),
                total = parsed.total,
                "Parsed Crossref results"
            );
            records.extend(parsed.records);

            offset += rows;
            if is_last_page(parsed.returned, rows, offset, parsed.total) {
                break;
            }
        }

        records.truncate(query.max_results);
        Ok(records)
    }
}

/// Publication date filter, e.g. `from-pub-date:2015,until-pub-date:2020`
fn build_filter(query: &SearchQuery) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(from) = query.year_from {
        parts.push(format!("from-pub-date:{}", from));
    }
    if let Some(to) = query.year_to {
        parts.push(format!("until-pub-date:{}", to));
    }
    (!parts.is_empty()).then(|| parts.join(","))
}

fn tag_regex() -> Result<Regex> {
    Regex::new(r"<[^>]+>").map_err(|e| SysrevError::Parse(e.to_string()))
}

// === Crossref API Response Types ===

#[derive(Debug, Deserialize)]
struct CrossrefResponse {
    message: CrossrefMessage,
}

#[derive(Debug, Deserialize)]
struct CrossrefMessage {
    #[serde(rename = "total-results", default)]
    total_results: u64,
    #[serde(default)]
    items: Vec<CrossrefItem>,
}

#[derive(Debug, Deserialize)]
struct CrossrefItem {
    #[serde(rename = "DOI", default)]
    doi: String,
    #[serde(rename = "URL", default)]
    url: String,
    #[serde(default)]
    title: Vec<String>,
    #[serde(default)]
    author: Vec<CrossrefAuthor>,
    #[serde(rename = "container-title", default)]
    container_title: Vec<String>,
    #[serde(default)]
    published: Option<CrossrefPublished>,
    #[serde(rename = "abstract", default)]
    abstract_text: Option<String>,
    #[serde(rename = "is-referenced-by-count", default)]
    cited_by: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CrossrefAuthor {
    #[serde(default)]
    given: String,
    #[serde(default)]
    family: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct CrossrefPublished {
    #[serde(rename = "date-parts", default)]
    date_parts: Vec<Vec<Option<i32>>>,
}

/// One parsed /works page
struct ItemsPage {
    records: Vec<BibRecord>,
    /// Items in the page before untitled ones were dropped
    returned: usize,
    total: u64,
}

/// Paging ends on a short page or once `offset` passes every hit
fn is_last_page(returned: usize, rows: usize, offset: usize, total: u64) -> bool {
    returned < rows || offset as u64 >= total
}

fn parse_response(body: &str, tag_regex: &Regex) -> Result<ItemsPage> {
    let data: CrossrefResponse = serde_json::from_str(body)
        .map_err(|e| SysrevError::Parse(format!("Failed to parse Crossref response: {}", e)))?;

    let returned = data.message.items.len();
    let records = data
        .message
        .items
        .into_iter()
        .filter_map(|item| item_to_record(item, tag_regex))
        .collect();

    Ok(ItemsPage {
        records,
        returned,
        total: data.message.total_results,
    })
}

fn item_to_record(item: CrossrefItem, tag_regex: &Regex) -> Option<BibRecord> {
    let title = item.title.into_iter().next().filter(|t| !t.trim().is_empty())?;
    let mut record = BibRecord::new(SourceDb::Crossref, strip_tags(&title, tag_regex));

    record.doi = normalize_doi(&item.doi);
    record.url = item.url;
    record.journal = item.container_title.into_iter().next().unwrap_or_default();
    record.citations = item.cited_by;
    record.authors = item
        .author
        .iter()
        .map(|a| {
            if a.name.is_empty() {
                format!("{} {}", a.given, a.family).trim().to_string()
            } else {
                a.name.clone()
            }
        })
        .filter(|s| !s.is_empty())
        .collect();
    record.year = item
        .published
        .and_then(|p| p.date_parts.into_iter().next())
        .and_then(|parts| parts.into_iter().next().flatten());
    record.abstract_text = item
        .abstract_text
        .map(|s| strip_tags(&s, tag_regex))
        .unwrap_or_default();

    Some(record)
}

/// Strip JATS/HTML tags and collapse whitespace
fn strip_tags(text: &str, tag_regex: &Regex) -> String {
    tag_regex
        .replace_all(text, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
