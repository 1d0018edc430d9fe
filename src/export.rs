//! CSV and JSON persistence for records and stage summaries.
//!
//! CSV rows are flat: authors are joined with `"; "`. The input format for
//! readers is picked from the file extension (`.json`, anything else is CSV).

use crate::error::Result;
use crate::record::{BibRecord, EffectDirection, SourceDb};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Separator used for the authors column
const AUTHOR_SEPARATOR: &str = "; ";

/// One CSV row
#[derive(Debug, Serialize, Deserialize)]
struct CsvRecord {
    key: String,
    source: SourceDb,
    pmid: String,
    doi: String,
    url: String,
    title: String,
    authors: String,
    journal: String,
    year: Option<i32>,
    citations: Option<u64>,
    sample_size: Option<u32>,
    effect_direction: Option<EffectDirection>,
    abstract_text: String,
}

impl From<&BibRecord> for CsvRecord {
    fn from(r: &BibRecord) -> Self {
        Self {
            key: r.key(),
            source: r.source,
            pmid: r.pmid.clone(),
            doi: r.doi.clone(),
            url: r.url.clone(),
            title: r.title.clone(),
            authors: r.authors.join(AUTHOR_SEPARATOR),
            journal: r.journal.clone(),
            year: r.year,
            citations: r.citations,
            sample_size: r.sample_size,
            effect_direction: r.effect_direction,
            abstract_text: r.abstract_text.clone(),
        }
    }
}

impl From<CsvRecord> for BibRecord {
    fn from(row: CsvRecord) -> Self {
        Self {
            pmid: row.pmid,
            doi: row.doi,
            url: row.url,
            title: row.title,
            abstract_text: row.abstract_text,
            authors: row
                .authors
                .split(AUTHOR_SEPARATOR.trim())
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect(),
            journal: row.journal,
            year: row.year,
            source: row.source,
            citations: row.citations,
            sample_size: row.sample_size,
            effect_direction: row.effect_direction,
        }
    }
}

/// Write records as CSV with a header row
pub fn write_csv(path: &Path, records: &[BibRecord]) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new().has_headers(true).from_path(path)?;
    for record in records {
        wtr.serialize(CsvRecord::from(record))?;
    }
    wtr.flush()?;
    info!(path = %path.display(), count = records.len(), "Saved CSV");
    Ok(())
}

/// Read records written by [`write_csv`]
pub fn read_csv(path: &Path) -> Result<Vec<BibRecord>> {
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let records = rdr
        .deserialize::<CsvRecord>()
        .map(|row| row.map(BibRecord::from))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Write any serializable value as pretty JSON
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content)?;
    info!(path = %path.display(), "Saved JSON");
    Ok(())
}

/// Read a JSON array of records
pub fn read_json(path: &Path) -> Result<Vec<BibRecord>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Read records, choosing the format from the extension
pub fn read_records(path: &Path) -> Result<Vec<BibRecord>> {
    if is_json(path) {
        read_json(path)
    } else {
        read_csv(path)
    }
}

/// Write records, choosing the format from the extension
pub fn write_records(path: &Path, records: &[BibRecord]) -> Result<()> {
    if is_json(path) {
        write_json(path, records)
    } else {
        write_csv(path, records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn sample() -> Vec<BibRecord> {
        let mut a = BibRecord::new(SourceDb::PubMed, "Gut microbiota, pain and fatigue");
        a.pmid = "31234567".to_string();
        a.doi = "10.1097/j.pain.1".to_string();
        a.authors = vec!["Amir Minerbi".to_string(), "Shiqi Shen".to_string()];
        a.abstract_text = "Line one.\nLine \"two\", with commas.".to_string();
        a.year = Some(2019);
        a.sample_size = Some(77);
        a.effect_direction = Some(EffectDirection::Decrease);

        let mut b = BibRecord::new(SourceDb::ClinicalTrials, "Shortened MDR-TB regimen");
        b.url = "https://clinicaltrials.gov/study/NCT04956640".to_string();
        b.citations = Some(0);

        let c = BibRecord::new(SourceDb::GoogleScholar, "Stewardship audit");

        vec![a, b, c]
    }

    fn by_key(records: &[BibRecord]) -> HashMap<String, BibRecord> {
        records.iter().map(|r| (r.key(), r.clone())).collect()
    }

    #[test]
    fn test_csv_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("records.csv");
        let records = sample();

        write_records(&path, &records)?;
        let loaded = read_records(&path)?;

        assert_eq!(by_key(&loaded), by_key(&records));
        Ok(())
    }

    #[test]
    fn test_json_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("records.JSON");
        let records = sample();

        write_records(&path, &records)?;
        assert_eq!(read_records(&path)?, records);
        Ok(())
    }

    #[test]
    fn test_read_missing_file_fails() {
        assert!(read_records(Path::new("/nonexistent/records.csv")).is_err());
    }
}
