//! Effect-size aggregation over qualitatively labelled studies.
//!
//! Directions are mapped to fixed placeholder effects and weighted by a
//! synthetic standard error derived only from sample size (`se = sqrt(4/n)`).
//! The numbers are a narrative aid, not a validated meta-analysis.

use crate::record::{BibRecord, EffectDirection};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Two-sided 95% normal quantile
const Z_95: f64 = 1.959964;

/// Numeric stand-ins for each direction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectPlaceholders {
    pub increase: f64,
    pub decrease: f64,
    pub mixed: f64,
    pub no_change: f64,
}

impl Default for EffectPlaceholders {
    fn default() -> Self {
        Self {
            increase: 0.8,
            decrease: -0.8,
            mixed: 0.0,
            no_change: 0.0,
        }
    }
}

impl EffectPlaceholders {
    pub fn effect(&self, direction: EffectDirection) -> f64 {
        match direction {
            EffectDirection::Increase => self.increase,
            EffectDirection::Decrease => self.decrease,
            EffectDirection::Mixed => self.mixed,
            EffectDirection::NoChange => self.no_change,
        }
    }
}

/// One record's contribution to the pooled estimate
#[derive(Debug, Clone, Serialize)]
pub struct StudyEffect {
    pub key: String,
    pub title: String,
    pub n: u32,
    pub effect: f64,
    pub se: f64,
    pub weight: f64,
}

/// Number of records per direction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectionCounts {
    pub increase: usize,
    pub decrease: usize,
    pub mixed: usize,
    pub no_change: usize,
    pub unclassified: usize,
}

/// Pooled estimate with heterogeneity statistics
#[derive(Debug, Clone, Serialize)]
pub struct PooledEstimate {
    pub studies: usize,
    pub total_n: u64,
    /// Fixed-effect inverse-variance weighted mean
    pub effect: f64,
    pub se: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub z: f64,
    pub p_value: f64,
    /// Cochran's Q
    pub q: f64,
    pub df: usize,
    /// Simplified I² in percent, `max(0, (Q - df) / Q) * 100`
    pub i_squared: f64,
    /// DerSimonian-Laird between-study variance
    pub tau_squared: f64,
    pub random_effect: f64,
    pub random_ci_low: f64,
    pub random_ci_high: f64,
}

/// Everything the aggregation stage reports
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSummary {
    pub directions: DirectionCounts,
    pub placeholders: EffectPlaceholders,
    pub pooled: Option<PooledEstimate>,
    pub effects: Vec<StudyEffect>,
}

/// Synthetic standard error of a standardised mean difference for `n` participants
pub fn synthetic_se(n: u32) -> f64 {
    (4.0 / f64::from(n)).sqrt()
}

pub fn count_directions(records: &[BibRecord]) -> DirectionCounts {
    let mut counts = DirectionCounts::default();
    for record in records {
        match record.effect_direction {
            Some(EffectDirection::Increase) => counts.increase += 1,
            Some(EffectDirection::Decrease) => counts.decrease += 1,
            Some(EffectDirection::Mixed) => counts.mixed += 1,
            Some(EffectDirection::NoChange) => counts.no_change += 1,
            None => counts.unclassified += 1,
        }
    }
    counts
}

/// Map records with a direction and a usable sample size to weighted effects
pub fn study_effects(records: &[BibRecord], placeholders: &EffectPlaceholders) -> Vec<StudyEffect> {
    records
        .iter()
        .filter_map(|r| {
            let direction = r.effect_direction?;
            let n = r.sample_size.filter(|n| *n >= 2)?;
            let se = synthetic_se(n);
            Some(StudyEffect {
                key: r.key(),
                title: r.title.clone(),
                n,
                effect: placeholders.effect(direction),
                se,
                weight: 1.0 / (se * se),
            })
        })
        .collect()
}

/// Pool study effects; `None` when there is nothing to pool
pub fn pool(effects: &[StudyEffect]) -> Option<PooledEstimate> {
    if effects.is_empty() {
        return None;
    }

    let sum_w: f64 = effects.iter().map(|e| e.weight).sum();
    let sum_w2: f64 = effects.iter().map(|e| e.weight * e.weight).sum();
    let mean = effects.iter().map(|e| e.weight * e.effect).sum::<f64>() / sum_w;
    let se = (1.0 / sum_w).sqrt();
    let z = mean / se;

    let q: f64 = effects
        .iter()
        .map(|e| e.weight * (e.effect - mean).powi(2))
        .sum();
    let df = effects.len() - 1;
    let i_squared = if q > 0.0 {
        ((q - df as f64) / q).max(0.0) * 100.0
    } else {
        0.0
    };

    let c = sum_w - sum_w2 / sum_w;
    let tau_squared = if c > 0.0 {
        ((q - df as f64) / c).max(0.0)
    } else {
        0.0
    };
    let random_weights: Vec<f64> = effects
        .iter()
        .map(|e| 1.0 / (e.se * e.se + tau_squared))
        .collect();
    let sum_rw: f64 = random_weights.iter().sum();
    let random_effect = effects
        .iter()
        .zip(&random_weights)
        .map(|(e, w)| w * e.effect)
        .sum::<f64>()
        / sum_rw;
    let random_se = (1.0 / sum_rw).sqrt();

    debug!(studies = effects.len(), effect = mean, q = q, i2 = i_squared, "Pooled effects");

    Some(PooledEstimate {
        studies: effects.len(),
        total_n: effects.iter().map(|e| u64::from(e.n)).sum(),
        effect: mean,
        se,
        ci_low: mean - Z_95 * se,
        ci_high: mean + Z_95 * se,
        z,
        p_value: 2.0 * (1.0 - normal_cdf(z.abs())),
        q,
        df,
        i_squared,
        tau_squared,
        random_effect,
        random_ci_low: random_effect - Z_95 * random_se,
        random_ci_high: random_effect + Z_95 * random_se,
    })
}

/// Run the whole aggregation stage over records
pub fn summarize(records: &[BibRecord], placeholders: &EffectPlaceholders) -> AggregateSummary {
    let effects = study_effects(records, placeholders);
    AggregateSummary {
        directions: count_directions(records),
        placeholders: *placeholders,
        pooled: pool(&effects),
        effects,
    }
}

/// Standard normal CDF via the Abramowitz-Stegun 7.1.26 erf approximation
fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t * (0.254829592 + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}
