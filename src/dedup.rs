//! Deduplication of merged multi-source result lists.
//!
//! Single pass with three seen-sets: normalised DOI, title hash and PMID.
//! The first record carrying a key wins; later records sharing any key are
//! duplicates. Only non-identifier fields are ever merged into the kept record,
//! so kept records stay pairwise key-disjoint and a second pass is a no-op.

use crate::record::{normalize_doi, title_hash, BibRecord};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Deduplication options
#[derive(Debug, Clone, Copy)]
pub struct DedupOptions {
    /// Fill empty non-identifier fields of the kept record from duplicates
    pub fill_missing: bool,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self { fill_missing: true }
    }
}

/// Which key identified a duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    Doi,
    Pmid,
    Title,
}

/// Counts from one deduplication pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    pub input: usize,
    pub unique: usize,
    pub duplicate_doi: usize,
    pub duplicate_pmid: usize,
    pub duplicate_title: usize,
}

impl DedupReport {
    pub fn removed(&self) -> usize {
        self.input - self.unique
    }
}

/// Seen keys, each mapped to the index of the kept record that owns it
#[derive(Default)]
struct SeenKeys {
    doi: HashMap<String, usize>,
    pmid: HashMap<String, usize>,
    title: HashMap<String, usize>,
}

struct RecordKeys {
    doi: String,
    pmid: String,
    title: String,
}

impl RecordKeys {
    fn of(record: &BibRecord) -> Self {
        Self {
            doi: normalize_doi(&record.doi),
            pmid: record.pmid.trim().to_string(),
            title: title_hash(&record.title),
        }
    }
}

fn lookup(map: &HashMap<String, usize>, key: &str) -> Option<usize> {
    if key.is_empty() {
        None
    } else {
        map.get(key).copied()
    }
}

impl SeenKeys {
    fn find(&self, keys: &RecordKeys) -> Option<(MatchKey, usize)> {
        lookup(&self.doi, &keys.doi)
            .map(|idx| (MatchKey::Doi, idx))
            .or_else(|| lookup(&self.pmid, &keys.pmid).map(|idx| (MatchKey::Pmid, idx)))
            .or_else(|| lookup(&self.title, &keys.title).map(|idx| (MatchKey::Title, idx)))
    }

    fn insert(&mut self, keys: RecordKeys, idx: usize) {
        for (map, key) in [
            (&mut self.doi, keys.doi),
            (&mut self.pmid, keys.pmid),
            (&mut self.title, keys.title),
        ] {
            if !key.is_empty() {
                map.insert(key, idx);
            }
        }
    }
}

/// Remove duplicates, keeping the first-seen record of each group
pub fn deduplicate(records: Vec<BibRecord>, options: DedupOptions) -> (Vec<BibRecord>, DedupReport) {
    let mut report = DedupReport {
        input: records.len(),
        ..Default::default()
    };
    let mut seen = SeenKeys::default();
    let mut unique: Vec<BibRecord> = Vec::with_capacity(records.len());

    for record in records {
        let keys = RecordKeys::of(&record);

        match seen.find(&keys) {
            Some((matched, owner)) => {
                match matched {
                    MatchKey::Doi => report.duplicate_doi += 1,
                    MatchKey::Pmid => report.duplicate_pmid += 1,
                    MatchKey::Title => report.duplicate_title += 1,
                }
                debug!(title = %record.title, key = ?matched, "Duplicate record dropped");

                if options.fill_missing {
                    fill_missing(&mut unique[owner], record);
                }
            }
            None => {
                seen.insert(keys, unique.len());
                unique.push(record);
            }
        }
    }

    report.unique = unique.len();
    info!(
        input = report.input,
        unique = report.unique,
        by_doi = report.duplicate_doi,
        by_pmid = report.duplicate_pmid,
        by_title = report.duplicate_title,
        "Deduplication complete"
    );
    (unique, report)
}

/// Copy non-identifier fields the kept record lacks
fn fill_missing(kept: &mut BibRecord, dup: BibRecord) {
    if kept.abstract_text.is_empty() {
        kept.abstract_text = dup.abstract_text;
    }
    if kept.journal.is_empty() {
        kept.journal = dup.journal;
    }
    if kept.authors.is_empty() {
        kept.authors = dup.authors;
    }
    kept.year = kept.year.or(dup.year);
    kept.citations = match (kept.citations, dup.citations) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    kept.sample_size = kept.sample_size.or(dup.sample_size);
    kept.effect_direction = kept.effect_direction.or(dup.effect_direction);
}
