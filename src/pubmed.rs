//! PubMed E-utilities source.
//!
//! Two calls per search:
//!   esearch: https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi (JSON PMID list)
//!   efetch:  https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi (XML abstracts)
//!
//! NCBI allows 3 req/s without an API key and 10 req/s with one; the fixed
//! delay between efetch chunks keeps us under that.

use crate::config::{HttpSettings, PipelineConfig};
use crate::error::{OptionExt, Result, SysrevError};
use crate::http::{build_client, fetch_text, polite_user_agent};
use crate::record::{normalize_doi, BibRecord, SourceDb};
use crate::search::{LiteratureSource, SearchQuery};
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::Client;
use tracing::{debug, info};

const ESEARCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi";
const EFETCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi";

/// PMIDs per efetch request
const EFETCH_CHUNK: usize = 200;

/// Tool name reported to NCBI
const TOOL: &str = "sysrev";

pub struct PubMedSource {
    client: Client,
    settings: HttpSettings,
    api_key: Option<String>,
}

impl PubMedSource {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let settings = config.http();
        let client = build_client(&settings, &polite_user_agent(&settings.mailto))?;
        Ok(Self {
            client,
            settings,
            api_key: config.pubmed_api_key.clone(),
        })
    }

    fn base_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("db", "pubmed".to_string()),
            ("tool", TOOL.to_string()),
            ("email", self.settings.mailto.clone()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    /// Search PubMed and return matching PMIDs
    async fn esearch(&self, query: &SearchQuery) -> Result<Vec<String>> {
        let mut params = self.base_params();
        params.push(("term", query.text.clone()));
        params.push(("retmax", query.max_results.to_string()));
        params.push(("retmode", "json".to_string()));
        if query.year_from.is_some() || query.year_to.is_some() {
            params.push(("datetype", "pdat".to_string()));
            params.push(("mindate", query.year_from.unwrap_or(1800).to_string()));
            params.push(("maxdate", query.year_to.unwrap_or(3000).to_string()));
        }

        let body = fetch_text(
            || self.client.get(ESEARCH_URL).query(&params),
            self.settings.max_retries,
            "PubMed esearch",
        )
        .await?;

        let ids = parse_esearch(&body)?;
        debug!(count = ids.len(), "PubMed esearch returned PMIDs");
        Ok(ids)
    }

    /// Fetch abstracts for PMIDs in chunks
    async fn efetch(&self, pmids: &[String]) -> Result<Vec<BibRecord>> {
        let mut records = Vec::with_capacity(pmids.len());

        for (idx, chunk) in pmids.chunks(EFETCH_CHUNK).enumerate() {
            if idx > 0 {
                tokio::time::sleep(self.settings.delay).await;
            }

            let mut params = self.base_params();
            params.push(("id", chunk.join(",")));
            params.push(("rettype", "abstract".to_string()));
            params.push(("retmode", "xml".to_string()));

            let xml = fetch_text(
                || self.client.get(EFETCH_URL).query(&params),
                self.settings.max_retries,
                "PubMed efetch",
            )
            .await?;

            let parsed = parse_pubmed_xml(&xml)?;
            debug!(chunk = idx, count = parsed.len(), "Parsed PubMed articles");
            records.extend(parsed);
        }

        Ok(records)
    }
}

#[async_trait]
impl LiteratureSource for PubMedSource {
    fn kind(&self) -> SourceDb {
        SourceDb::PubMed
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<BibRecord>> {
        let pmids = self.esearch(query).await?;
        if pmids.is_empty() {
            return Ok(Vec::new());
        }
        tokio::time::sleep(self.settings.delay).await;
        let records = self.efetch(&pmids).await?;
        info!(pmids = pmids.len(), records = records.len(), "PubMed search complete");
        Ok(records)
    }
}

/// Extract the PMID list from an esearch JSON body
fn parse_esearch(body: &str) -> Result<Vec<String>> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| SysrevError::Parse(format!("Failed to parse esearch response: {}", e)))?;

    let ids = value
        .get("esearchresult")
        .and_then(|r| r.get("idlist"))
        .and_then(|l| l.as_array())
        .ok_or_parse("esearch response has no idlist")?;

    Ok(ids
        .iter()
        .filter_map(|v| v.as_str().map(String::from))
        .collect())
}

/// Elements whose text we collect
#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Pmid,
    Title,
    Abstract,
    LastName,
    ForeName,
    CollectiveName,
    Journal,
    Year,
    MedlineDate,
    Doi,
}

/// Per-article accumulator
#[derive(Default)]
struct ArticleState {
    pmid: String,
    title: String,
    abstract_parts: Vec<String>,
    authors: Vec<String>,
    journal: String,
    year: Option<i32>,
    doi: String,
    last_name: String,
    fore_name: String,
    in_pub_date: bool,
    /// Inside `PubmedData/ReferenceList`; ids there belong to cited papers
    in_reference_list: bool,
}

impl ArticleState {
    fn into_record(self) -> Option<BibRecord> {
        let title = collapse_whitespace(&self.title);
        if title.is_empty() {
            return None;
        }
        let mut record = BibRecord::new(SourceDb::PubMed, title);
        record.url = format!("https://pubmed.ncbi.nlm.nih.gov/{}/", self.pmid);
        record.pmid = self.pmid;
        record.doi = normalize_doi(&self.doi);
        record.abstract_text = self
            .abstract_parts
            .iter()
            .map(|p| collapse_whitespace(p))
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        record.authors = self.authors;
        record.journal = collapse_whitespace(&self.journal);
        record.year = self.year;
        Some(record)
    }
}

fn has_attr(e: &BytesStart<'_>, key: &[u8], value: &[u8]) -> bool {
    e.attributes()
        .flatten()
        .any(|a| a.key.as_ref() == key && a.value.as_ref() == value)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse efetch XML (`<PubmedArticleSet><PubmedArticle>...`) into records.
///
/// Inline markup inside titles and abstracts (`<i>`, `<sup>`) is flattened
/// into the surrounding text.
pub fn parse_pubmed_xml(xml: &str) -> Result<Vec<BibRecord>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut records = Vec::new();
    let mut current: Option<ArticleState> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if current.is_none() {
                    if e.name().as_ref() == b"PubmedArticle" {
                        current = Some(ArticleState::default());
                    }
                    continue;
                }
                let Some(state) = current.as_mut() else {
                    continue;
                };
                if state.in_reference_list {
                    continue;
                }
                match e.name().as_ref() {
                    b"ReferenceList" => state.in_reference_list = true,
                    b"PMID" if state.pmid.is_empty() => field = Some(Field::Pmid),
                    b"ArticleTitle" => field = Some(Field::Title),
                    b"AbstractText" => {
                        state.abstract_parts.push(String::new());
                        field = Some(Field::Abstract);
                    }
                    b"Author" => {
                        state.last_name.clear();
                        state.fore_name.clear();
                    }
                    b"LastName" => field = Some(Field::LastName),
                    b"ForeName" => field = Some(Field::ForeName),
                    b"CollectiveName" => field = Some(Field::CollectiveName),
                    b"Title" if state.journal.is_empty() => field = Some(Field::Journal),
                    b"PubDate" => state.in_pub_date = true,
                    b"Year" if state.in_pub_date => field = Some(Field::Year),
                    b"MedlineDate" if state.in_pub_date => field = Some(Field::MedlineDate),
                    b"ArticleId" if has_attr(e, b"IdType", b"doi") => field = Some(Field::Doi),
                    b"ELocationID" if has_attr(e, b"EIdType", b"doi") => field = Some(Field::Doi),
                    _ => {}
                }
            }
            Ok(Event::Text(ref e)) => {
                let (Some(state), Some(f)) = (current.as_mut(), field) else {
                    continue;
                };
                let text = e
                    .unescape()
                    .map_err(|err| SysrevError::Parse(format!("Bad PubMed XML text: {}", err)))?;
                let text = text.as_ref();
                match f {
                    Field::Pmid => state.pmid.push_str(text.trim()),
                    Field::Title => push_spaced(&mut state.title, text),
                    Field::Abstract => {
                        if let Some(part) = state.abstract_parts.last_mut() {
                            push_spaced(part, text);
                        }
                    }
                    Field::LastName => state.last_name.push_str(text),
                    Field::ForeName => state.fore_name.push_str(text),
                    Field::CollectiveName => state.authors.push(text.trim().to_string()),
                    Field::Journal => push_spaced(&mut state.journal, text),
                    Field::Year => {
                        if state.year.is_none() {
                            state.year = text.trim().parse().ok();
                        }
                    }
                    Field::MedlineDate => {
                        if state.year.is_none() {
                            state.year = text.trim().get(..4).and_then(|y| y.parse().ok());
                        }
                    }
                    Field::Doi => {
                        if state.doi.is_empty() {
                            state.doi = text.trim().to_string();
                        }
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                let name = e.name();
                let name = name.as_ref();
                if name == b"PubmedArticle" {
                    if let Some(record) = current.take().and_then(ArticleState::into_record) {
                        records.push(record);
                    }
                    field = None;
                    continue;
                }
                let Some(state) = current.as_mut() else {
                    continue;
                };
                match name {
                    b"PMID" | b"ArticleTitle" | b"AbstractText" | b"LastName" | b"ForeName"
                    | b"CollectiveName" | b"Title" | b"Year" | b"MedlineDate" | b"ArticleId"
                    | b"ELocationID" => field = None,
                    b"PubDate" => state.in_pub_date = false,
                    b"ReferenceList" => state.in_reference_list = false,
                    b"Author" => {
                        let name = match (state.fore_name.trim(), state.last_name.trim()) {
                            ("", "") => String::new(),
                            ("", last) => last.to_string(),
                            (fore, last) => format!("{} {}", fore, last),
                        };
                        if !name.is_empty() {
                            state.authors.push(name);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SysrevError::Parse(format!(
                    "PubMed XML error at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(records)
}

fn push_spaced(target: &mut String, text: &str) {
    if !target.is_empty() {
        target.push(' ');
    }
    target.push_str(text);
}

#[cfg(test)]
mod tests {
    use super::*;

    const EFETCH_SAMPLE: &str = r#"<?xml version="1.0" ?>
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation Status="MEDLINE" Owner="NLM">
      <PMID Version="1">31234567</PMID>
      <Article PubModel="Print">
        <Journal>
          <JournalIssue CitedMedium="Internet">
            <PubDate><Year>2019</Year><Month>Jun</Month></PubDate>
          </JournalIssue>
          <Title>Pain</Title>
        </Journal>
        <ArticleTitle>Altered microbiome composition in individuals with fibromyalgia.</ArticleTitle>
        <ELocationID EIdType="doi" ValidYN="Y">10.1097/j.pain.0000000000001640</ELocationID>
        <Abstract>
          <AbstractText Label="BACKGROUND">Fibromyalgia affects 2% of adults.</AbstractText>
          <AbstractText Label="RESULTS">In 77 women, <i>Faecalibacterium</i> was reduced (n = 77).</AbstractText>
        </Abstract>
        <AuthorList CompleteYN="Y">
          <Author ValidYN="Y"><LastName>Minerbi</LastName><ForeName>Amir</ForeName></Author>
          <Author ValidYN="Y"><LastName>Shen</LastName><ForeName>Shiqi</ForeName></Author>
          <Author ValidYN="Y"><CollectiveName>Microbiome Study Group</CollectiveName></Author>
        </AuthorList>
      </Article>
      <CommentsCorrectionsList>
        <CommentsCorrections RefType="Cites"><PMID Version="1">111</PMID></CommentsCorrections>
      </CommentsCorrectionsList>
    </MedlineCitation>
    <PubmedData>
      <ArticleIdList>
        <ArticleId IdType="pubmed">31234567</ArticleId>
        <ArticleId IdType="doi">10.1097/J.PAIN.0000000000001640</ArticleId>
      </ArticleIdList>
    </PubmedData>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">30000001</PMID>
      <Article>
        <Journal>
          <JournalIssue><PubDate><MedlineDate>2018 Nov-Dec</MedlineDate></PubDate></JournalIssue>
          <Title>Tuberculosis &amp; Lung Disease</Title>
        </Journal>
        <ArticleTitle>Antibiotic exposure and the gut microbiome.</ArticleTitle>
      </Article>
    </MedlineCitation>
  </PubmedArticle>
</PubmedArticleSet>"#;

    #[test]
    fn test_parse_pubmed_xml() -> Result<()> {
        let records = parse_pubmed_xml(EFETCH_SAMPLE)?;
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.pmid, "31234567");
        assert_eq!(first.doi, "10.1097/j.pain.0000000000001640");
        assert_eq!(first.journal, "Pain");
        assert_eq!(first.year, Some(2019));
        assert_eq!(
            first.authors,
            vec!["Amir Minerbi", "Shiqi Shen", "Microbiome Study Group"]
        );
        assert!(first.abstract_text.starts_with("Fibromyalgia affects 2% of adults."));
        assert!(first.abstract_text.contains("Faecalibacterium"));
        assert_eq!(first.url, "https://pubmed.ncbi.nlm.nih.gov/31234567/");

        let second = &records[1];
        assert_eq!(second.pmid, "30000001");
        assert_eq!(second.year, Some(2018));
        assert_eq!(second.journal, "Tuberculosis & Lung Disease");
        assert!(second.doi.is_empty());
        assert!(second.abstract_text.is_empty());
        Ok(())
    }

    #[test]
    fn test_reference_list_ids_are_ignored() -> Result<()> {
        let xml = r#"<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">111</PMID>
      <Article>
        <Journal><Title>Gut Microbes</Title></Journal>
        <ArticleTitle>Microbial signatures of chronic pain.</ArticleTitle>
      </Article>
    </MedlineCitation>
    <PubmedData>
      <ArticleIdList><ArticleId IdType="pubmed">111</ArticleId></ArticleIdList>
      <ReferenceList>
        <Reference>
          <Citation>Cited paper. Other Journal. 2015.</Citation>
          <ArticleIdList>
            <ArticleId IdType="doi">10.9999/cited.paper</ArticleId>
            <ArticleId IdType="pubmed">222</ArticleId>
          </ArticleIdList>
        </Reference>
      </ReferenceList>
    </PubmedData>
  </PubmedArticle>
</PubmedArticleSet>"#;

        let records = parse_pubmed_xml(xml)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pmid, "111");
        assert!(records[0].doi.is_empty());
        assert_eq!(records[0].journal, "Gut Microbes");
        Ok(())
    }

    #[test]
    fn test_parse_esearch() -> Result<()> {
        let body = r#"{"header":{},"esearchresult":{"count":"2","idlist":["1","2"]}}"#;
        assert_eq!(parse_esearch(body)?, vec!["1", "2"]);
        assert!(parse_esearch(r#"{"error":"bad"}"#).is_err());
        Ok(())
    }

    #[test]
    fn test_parse_empty_set() -> Result<()> {
        assert!(parse_pubmed_xml("<PubmedArticleSet></PubmedArticleSet>")?.is_empty());
        Ok(())
    }
}
