//! Google Scholar scraping source.
//!
//! Scholar has no API; result pages are fetched as HTML (10 hits per page)
//! and parsed with `scraper`. Requests carry a random jitter on top of the
//! fixed delay, and a CAPTCHA interstitial aborts the source.

use crate::config::{HttpSettings, PipelineConfig};
use crate::error::{Result, SysrevError};
use crate::http::{build_client, fetch_text};
use crate::record::{BibRecord, SourceDb};
use crate::search::{LiteratureSource, SearchQuery};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Default Google Scholar URL
pub const DEFAULT_SCHOLAR_URL: &str = "https://scholar.google.com";

/// Results per Scholar page
const PAGE_SIZE: usize = 10;

/// Browser user agent; Scholar rejects obvious bots
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

pub struct ScholarSource {
    client: Client,
    settings: HttpSettings,
    base_url: String,
    cookie: Option<String>,
}

impl ScholarSource {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let settings = config.http();
        let client = build_client(&settings, USER_AGENT)?;
        let base_url = config
            .scholar_mirror
            .as_deref()
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_SCHOLAR_URL.to_string());

        if config.scholar_cookie.is_none() {
            debug!("No scholar_cookie configured; Scholar may serve a CAPTCHA");
        }

        Ok(Self {
            client,
            settings,
            base_url,
            cookie: config.scholar_cookie.clone(),
        })
    }

    async fn fetch_page(&self, url: &Url) -> Result<String> {
        fetch_text(
            || {
                let request = self
                    .client
                    .get(url.as_str())
                    .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
                    .header("Accept-Language", "en-US,en;q=0.9");
                match &self.cookie {
                    Some(cookie) => request.header("Cookie", cookie),
                    None => request,
                }
            },
            self.settings.max_retries,
            "Google Scholar",
        )
        .await
    }
}

#[async_trait]
impl LiteratureSource for ScholarSource {
    fn kind(&self) -> SourceDb {
        SourceDb::GoogleScholar
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<BibRecord>> {
        let pages = query.max_results.div_ceil(PAGE_SIZE).max(1);
        let parser = ResultParser::new()?;
        let mut records = Vec::new();

        info!(query = %query.text, url = %self.base_url, pages = pages, "Starting Google Scholar query");

        for page in 0..pages {
            let url = build_search_url(&self.base_url, query, page * PAGE_SIZE)?;

            let jitter = Duration::from_millis(rand::random::<u64>() % 1500 + 500);
            tokio::time::sleep(self.settings.delay + jitter).await;

            debug!(page = page + 1, url = %url, "Fetching Scholar page");
            let html = self.fetch_page(&url).await?;

            if is_captcha(&html) {
                warn!(page = page + 1, "CAPTCHA detected");
                return Err(SysrevError::Captcha);
            }

            let page_records = parser.parse(&html);
            info!(page = page + 1, count = page_records.len(), "Parsed Scholar results");
            let done = page_records.len() < PAGE_SIZE;
            records.extend(page_records);
            if done {
                break;
            }
        }

        records.truncate(query.max_results);
        Ok(records)
    }
}

fn is_captcha(html: &str) -> bool {
    html.contains("gs_captcha") || html.contains("unusual traffic") || html.contains("Solving the above CAPTCHA")
}

/// Build Google Scholar search URL
fn build_search_url(base_url: &str, query: &SearchQuery, start: usize) -> Result<Url> {
    let mut url = Url::parse(&format!("{}/scholar", base_url))
        .map_err(|e| SysrevError::Config(format!("Invalid Scholar base URL: {}", e)))?;

    {
        let mut params = url.query_pairs_mut();
        params.append_pair("q", &query.text);
        params.append_pair("hl", "en");
        params.append_pair("start", &start.to_string());
        // articles only, no patents
        params.append_pair("as_sdt", "0,5");
        if let Some(year) = query.year_from {
            params.append_pair("as_ylo", &year.to_string());
        }
        if let Some(year) = query.year_to {
            params.append_pair("as_yhi", &year.to_string());
        }
    }

    Ok(url)
}

/// Compiled selectors and patterns for Scholar result pages
pub struct ResultParser {
    item: Selector,
    title: Selector,
    link: Selector,
    meta: Selector,
    snippet: Selector,
    footer_links: Selector,
    year: Regex,
    cited_by: Regex,
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| SysrevError::Parse(format!("Bad selector {}: {}", css, e)))
}

impl ResultParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            item: selector("div.gs_r.gs_or.gs_scl")?,
            title: selector("h3.gs_rt")?,
            link: selector("h3.gs_rt a")?,
            meta: selector("div.gs_a")?,
            snippet: selector("div.gs_rs")?,
            footer_links: selector("div.gs_fl a")?,
            year: Regex::new(r"\b(19|20)\d{2}\b").map_err(|e| SysrevError::Parse(e.to_string()))?,
            cited_by: Regex::new(r"Cited by\s*(\d+)").map_err(|e| SysrevError::Parse(e.to_string()))?,
        })
    }

    /// Parse one result page into records
    pub fn parse(&self, html: &str) -> Vec<BibRecord> {
        let document = Html::parse_document(html);
        let mut records = Vec::new();

        for item in document.select(&self.item) {
            let (title, url) = match item.select(&self.link).next() {
                Some(link) => (
                    link.text().collect::<String>(),
                    link.value().attr("href").unwrap_or_default().to_string(),
                ),
                None => match item.select(&self.title).next() {
                    Some(t) => (t.text().collect::<String>(), String::new()),
                    None => continue,
                },
            };
            let title = clean_title(&title);
            if title.is_empty() {
                continue;
            }

            let mut record = BibRecord::new(SourceDb::GoogleScholar, title);
            record.url = url;

            // "A Author, B Author - Journal, 2020 - publisher.com"
            if let Some(meta) = item.select(&self.meta).next() {
                let meta_text = meta.text().collect::<String>().replace('\u{a0}', " ");
                let parts: Vec<&str> = meta_text.split(" - ").collect();

                record.authors = parts[0]
                    .split(',')
                    .map(|a| a.trim().trim_end_matches('…').trim())
                    .filter(|a| !a.is_empty())
                    .map(String::from)
                    .collect();

                if let Some(venue_year) = parts.get(1) {
                    match self.year.find(venue_year) {
                        Some(m) => {
                            record.year = m.as_str().parse().ok();
                            record.journal = venue_year[..m.start()].trim().trim_end_matches(',').trim().to_string();
                        }
                        None => record.journal = venue_year.trim().to_string(),
                    }
                }
            }

            if let Some(snippet) = item.select(&self.snippet).next() {
                record.abstract_text = snippet.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ");
            }

            record.citations = item
                .select(&self.footer_links)
                .filter(|a| a.value().attr("href").is_some_and(|h| h.contains("cites=")))
                .find_map(|a| {
                    let text = a.text().collect::<String>();
                    self.cited_by
                        .captures(&text)
                        .and_then(|c| c.get(1))
                        .and_then(|m| m.as_str().parse().ok())
                });

            records.push(record);
        }

        records
    }
}

/// Drop Scholar's `[PDF]`/`[HTML]` type markers
fn clean_title(raw: &str) -> String {
    let mut title = raw.trim();
    while let Some(rest) = title.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => title = rest[end + 1..].trim_start(),
            None => break,
        }
    }
    title.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
      <div class="gs_r gs_or gs_scl">
        <h3 class="gs_rt"><span>[PDF]</span> <a href="https://example.org/paper1">Drug-resistant tuberculosis outcomes</a></h3>
        <div class="gs_a">J Smith, K Lee - The Lancet Infectious Diseases, 2021 - thelancet.com</div>
        <div class="gs_rs">Among 312 patients treatment success increased.</div>
        <div class="gs_fl gs_flb"><a href="/scholar?cites=123">Cited by 57</a><a href="/related">Related articles</a></div>
      </div>
      <div class="gs_r gs_or gs_scl">
        <h3 class="gs_rt"><span>[CITATION]</span> Untitled stewardship report</h3>
        <div class="gs_a">WHO - Geneva</div>
      </div>
    </body></html>"#;

    #[test]
    fn test_build_search_url() -> Result<()> {
        let query = SearchQuery {
            year_from: Some(2020),
            ..SearchQuery::new("machine learning", 10)
        };
        let url = build_search_url(DEFAULT_SCHOLAR_URL, &query, 20)?;
        assert!(url.as_str().contains("q=machine+learning"));
        assert!(url.as_str().contains("start=20"));
        assert!(url.as_str().contains("as_ylo=2020"));
        assert!(!url.as_str().contains("as_yhi"));
        Ok(())
    }

    #[test]
    fn test_parse_results() -> Result<()> {
        let records = ResultParser::new()?.parse(PAGE);
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.title, "Drug-resistant tuberculosis outcomes");
        assert_eq!(first.url, "https://example.org/paper1");
        assert_eq!(first.authors, vec!["J Smith", "K Lee"]);
        assert_eq!(first.journal, "The Lancet Infectious Diseases");
        assert_eq!(first.year, Some(2021));
        assert_eq!(first.citations, Some(57));

        let second = &records[1];
        assert_eq!(second.title, "Untitled stewardship report");
        assert!(second.url.is_empty());
        assert_eq!(second.journal, "Geneva");
        Ok(())
    }

    #[test]
    fn test_parse_empty_html() -> Result<()> {
        assert!(ResultParser::new()?.parse("<html><body></body></html>").is_empty());
        Ok(())
    }

    #[test]
    fn test_captcha_detection() {
        assert!(is_captcha("<div id=\"gs_captcha_ccl\"></div>"));
        assert!(!is_captcha("<div class=\"gs_r\"></div>"));
    }

    #[tokio::test]
    async fn test_fetch_page_retries_rate_limit() -> Result<()> {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scholar"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/scholar"))
            .and(header("Cookie", "GSP=ID=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .expect(1)
            .mount(&server)
            .await;

        let config = PipelineConfig {
            scholar_mirror: Some(server.uri()),
            scholar_cookie: Some("GSP=ID=abc".to_string()),
            max_retries: 1,
            ..PipelineConfig::default()
        };
        let source = ScholarSource::new(&config)?;
        let url = Url::parse(&format!("{}/scholar?q=tuberculosis", server.uri()))
            .map_err(|e| SysrevError::Config(e.to_string()))?;

        let html = source.fetch_page(&url).await?;
        assert!(html.contains("Drug-resistant tuberculosis outcomes"));
        Ok(())
    }
}
