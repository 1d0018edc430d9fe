//! Regex-based extraction of study attributes from titles and abstracts.
//!
//! Two attributes feed the aggregation stage: a sample size and a qualitative
//! effect direction. Values already present on a record (e.g. registry
//! enrollment counts) are never overwritten.

use crate::error::{Result, SysrevError};
use crate::record::{BibRecord, EffectDirection};
use regex::Regex;
use tracing::debug;

/// Sample sizes above this are treated as noise (years, accession numbers)
const MAX_PLAUSIBLE_N: u32 = 10_000_000;

/// Compiled patterns for one extraction run
pub struct Extractor {
    explicit_n: Regex,
    counted_n: Regex,
    increase: Regex,
    decrease: Regex,
    no_change: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| SysrevError::Parse(format!("Invalid pattern: {}", e)))
}

impl Extractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            explicit_n: compile(r"(?i)\b(?:n\s*=\s*|total of\s+)(\d{1,3}(?:,\d{3})+|\d+)")?,
            counted_n: compile(
                r"(?i)\b(\d{1,3}(?:,\d{3})+|\d+)\s+(?:[a-z-]+\s+)?(?:patients|participants|subjects|individuals|adults|children|women|men|cases|controls|volunteers|persons|people)\b",
            )?,
            increase: compile(
                r"(?i)\b(?:increas(?:e|ed|es|ing)|higher|elevated|enriched|greater|up-?regulated|more abundant)\b",
            )?,
            decrease: compile(
                r"(?i)\b(?:decreas(?:e|ed|es|ing)|reduc(?:e|ed|es|ing|tion)|lower|depleted|diminished|down-?regulated|less abundant)\b",
            )?,
            no_change: compile(
                r"(?i)\b(?:no (?:significant )?(?:difference|change|association|effect)s?|not significantly (?:different|changed|associated)|unchanged|similar between)\b",
            )?,
        })
    }

    /// Largest plausible participant count mentioned in the text
    pub fn sample_size(&self, text: &str) -> Option<u32> {
        self.explicit_n
            .captures_iter(text)
            .chain(self.counted_n.captures_iter(text))
            .filter_map(|c| c.get(1))
            .filter_map(|m| m.as_str().replace(',', "").parse::<u32>().ok())
            .filter(|n| *n > 0 && *n <= MAX_PLAUSIBLE_N)
            .max()
    }

    /// Direction of the reported outcome, `None` when nothing matches
    pub fn effect_direction(&self, text: &str) -> Option<EffectDirection> {
        // "no significant difference ... lower" should not count the negated phrase twice
        let without_null = self.no_change.replace_all(text, " ");
        let up = self.increase.is_match(&without_null);
        let down = self.decrease.is_match(&without_null);
        let null = self.no_change.is_match(text);

        match (up, down, null) {
            (true, true, _) => Some(EffectDirection::Mixed),
            (true, false, false) => Some(EffectDirection::Increase),
            (false, true, false) => Some(EffectDirection::Decrease),
            (true, false, true) | (false, true, true) => Some(EffectDirection::Mixed),
            (false, false, true) => Some(EffectDirection::NoChange),
            (false, false, false) => None,
        }
    }

    /// Fill missing attributes on one record
    pub fn annotate(&self, record: &mut BibRecord) {
        let text = record.text();
        if record.sample_size.is_none() {
            record.sample_size = self.sample_size(&text);
        }
        if record.effect_direction.is_none() {
            record.effect_direction = self.effect_direction(&text);
        }
    }

    /// Fill missing attributes on all records; returns how many gained any
    pub fn annotate_all(&self, records: &mut [BibRecord]) -> usize {
        let mut changed = 0;
        for record in records.iter_mut() {
            let before = (record.sample_size, record.effect_direction);
            self.annotate(record);
            if (record.sample_size, record.effect_direction) != before {
                changed += 1;
            }
        }
        debug!(total = records.len(), changed = changed, "Extraction complete");
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SourceDb;

    fn extractor() -> Extractor {
        Extractor::new().expect("patterns compile")
    }

    #[test]
    fn test_sample_size_patterns() {
        let ex = extractor();
        assert_eq!(ex.sample_size("A cohort (n = 77) of women"), Some(77));
        assert_eq!(ex.sample_size("We enrolled N=1,204 adults"), Some(1204));
        assert_eq!(ex.sample_size("a total of 87 were randomised"), Some(87));
        assert_eq!(ex.sample_size("Among 312 hospitalized patients"), Some(312));
        assert_eq!(ex.sample_size("45 cases and 90 controls"), Some(90));
        assert_eq!(ex.sample_size("Published in 2019 by the consortium"), None);
    }

    #[test]
    fn test_effect_direction() {
        let ex = extractor();
        assert_eq!(
            ex.effect_direction("Bacteroides abundance increased after treatment"),
            Some(EffectDirection::Increase)
        );
        assert_eq!(
            ex.effect_direction("Alpha diversity was reduced in cases"),
            Some(EffectDirection::Decrease)
        );
        assert_eq!(
            ex.effect_direction("Firmicutes were enriched while Bacteroidetes were depleted"),
            Some(EffectDirection::Mixed)
        );
        assert_eq!(
            ex.effect_direction("There was no significant difference in diversity"),
            Some(EffectDirection::NoChange)
        );
        assert_eq!(ex.effect_direction("A protocol for a review"), None);
    }

    #[test]
    fn test_annotate_keeps_existing_values() {
        let ex = extractor();
        let mut record = BibRecord::new(SourceDb::ClinicalTrials, "Trial of a shorter regimen");
        record.abstract_text = "Treatment success increased among 300 participants.".to_string();
        record.sample_size = Some(450);

        ex.annotate(&mut record);
        assert_eq!(record.sample_size, Some(450));
        assert_eq!(record.effect_direction, Some(EffectDirection::Increase));
    }

    #[test]
    fn test_annotate_all_counts_changes() {
        let ex = extractor();
        let mut records = vec![
            BibRecord::new(SourceDb::PubMed, "Lower LDL in 120 adults"),
            BibRecord::new(SourceDb::PubMed, "Study protocol"),
        ];
        assert_eq!(ex.annotate_all(&mut records), 1);
        assert_eq!(records[0].sample_size, Some(120));
        assert_eq!(records[0].effect_direction, Some(EffectDirection::Decrease));
    }
}
