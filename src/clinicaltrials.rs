//! ClinicalTrials.gov v2 registry source.
//!
//! Endpoint: https://clinicaltrials.gov/api/v2/studies
//!
//! Registry entries map onto records as:
//!   - title       = officialTitle, else briefTitle
//!   - abstract    = briefSummary
//!   - url         = https://clinicaltrials.gov/study/<NCT id>
//!   - sample_size = enrollmentInfo.count

use crate::config::{HttpSettings, PipelineConfig};
use crate::error::{Result, SysrevError};
use crate::http::{build_client, fetch_text, polite_user_agent};
use crate::record::{BibRecord, SourceDb};
use crate::search::{LiteratureSource, SearchQuery};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

const CT_API_URL: &str = "https://clinicaltrials.gov/api/v2/studies";

/// v2 API page size cap
const MAX_PAGE_SIZE: usize = 1000;

pub struct ClinicalTrialsSource {
    client: Client,
    settings: HttpSettings,
}

impl ClinicalTrialsSource {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let settings = config.http();
        let client = build_client(&settings, &polite_user_agent(&settings.mailto))?;
        Ok(Self { client, settings })
    }
}

#[async_trait]
impl LiteratureSource for ClinicalTrialsSource {
    fn kind(&self) -> SourceDb {
        SourceDb::ClinicalTrials
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<BibRecord>> {
        let page_size = query.max_results.clamp(1, MAX_PAGE_SIZE);
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("query.term", query.text.clone()),
                ("pageSize", page_size.to_string()),
                ("format", "json".to_string()),
            ];
            if let Some(range) = start_date_range(query) {
                params.push(("filter.advanced", range));
            }
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let body = fetch_text(
                || self.client.get(CT_API_URL).query(&params),
                self.settings.max_retries,
                "ClinicalTrials.gov",
            )
            .await?;

            let (page, next) = parse_response(&body)?;
            debug!(count = page.len(), has_next = next.is_some(), "Parsed ClinicalTrials.gov page");
            records.extend(page);

            match next {
                Some(token) if records.len() < query.max_results => {
                    page_token = Some(token);
                    tokio::time::sleep(self.settings.delay).await;
                }
                _ => break,
            }
        }

        records.truncate(query.max_results);
        info!(count = records.len(), "ClinicalTrials.gov search complete");
        Ok(records)
    }
}

/// Essie expression restricting study start dates
fn start_date_range(query: &SearchQuery) -> Option<String> {
    if query.year_from.is_none() && query.year_to.is_none() {
        return None;
    }
    let from = query
        .year_from
        .map(|y| format!("{}-01-01", y))
        .unwrap_or_else(|| "MIN".to_string());
    let to = query
        .year_to
        .map(|y| format!("{}-12-31", y))
        .unwrap_or_else(|| "MAX".to_string());
    Some(format!("AREA[StartDate]RANGE[{},{}]", from, to))
}

// === v2 API Response Types ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudiesResponse {
    #[serde(default)]
    studies: Vec<Study>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Study {
    protocol_section: Option<ProtocolSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolSection {
    identification_module: Option<IdentificationModule>,
    status_module: Option<StatusModule>,
    description_module: Option<DescriptionModule>,
    design_module: Option<DesignModule>,
    sponsor_collaborators_module: Option<SponsorModule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentificationModule {
    nct_id: Option<String>,
    brief_title: Option<String>,
    official_title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusModule {
    start_date_struct: Option<DateStruct>,
}

#[derive(Debug, Deserialize)]
struct DateStruct {
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescriptionModule {
    brief_summary: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DesignModule {
    enrollment_info: Option<EnrollmentInfo>,
}

#[derive(Debug, Deserialize)]
struct EnrollmentInfo {
    count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SponsorModule {
    lead_sponsor: Option<Sponsor>,
}

#[derive(Debug, Deserialize)]
struct Sponsor {
    name: Option<String>,
}

fn parse_response(body: &str) -> Result<(Vec<BibRecord>, Option<String>)> {
    let response: StudiesResponse = serde_json::from_str(body)
        .map_err(|e| SysrevError::Parse(format!("Failed to parse ClinicalTrials.gov response: {}", e)))?;

    let records = response
        .studies
        .into_iter()
        .filter_map(|s| s.protocol_section)
        .filter_map(study_to_record)
        .collect();

    Ok((records, response.next_page_token.filter(|t| !t.is_empty())))
}

fn study_to_record(proto: ProtocolSection) -> Option<BibRecord> {
    let ident = proto.identification_module?;
    let nct_id = ident.nct_id.filter(|id| !id.is_empty())?;
    let title = ident
        .official_title
        .or(ident.brief_title)
        .filter(|t| !t.trim().is_empty())?;

    let mut record = BibRecord::new(SourceDb::ClinicalTrials, title.trim());
    record.url = format!("https://clinicaltrials.gov/study/{}", nct_id);
    record.journal = "ClinicalTrials.gov".to_string();
    record.abstract_text = proto
        .description_module
        .and_then(|d| d.brief_summary)
        .unwrap_or_default();
    record.year = proto
        .status_module
        .and_then(|s| s.start_date_struct)
        .and_then(|d| d.date)
        .and_then(|d| d.get(..4).and_then(|y| y.parse().ok()));
    record.sample_size = proto
        .design_module
        .and_then(|d| d.enrollment_info)
        .and_then(|e| e.count)
        .filter(|n| *n > 0);
    if let Some(sponsor) = proto
        .sponsor_collaborators_module
        .and_then(|s| s.lead_sponsor)
        .and_then(|s| s.name)
    {
        record.authors.push(sponsor);
    }

    Some(record)
}
