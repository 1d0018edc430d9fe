//! Markdown run report with PRISMA-style counts.

use crate::aggregate::{AggregateSummary, PooledEstimate};
use crate::dedup::DedupReport;
use crate::screen::ScreeningCounts;
use crate::search::SourceSummary;

/// Report header
/// Placeholders: {query}, {date}
const HEADER_TEMPLATE: &str = "# Systematic review summary

- **Query:** `{query}`
- **Generated:** {date}
";

const DISCLAIMER: &str = "> **Note:** effect sizes are synthetic placeholders derived from \
qualitative direction labels, and standard errors come from sample size alone. \
The pooled estimate is a narrative aid and must not be read as a validated meta-analysis.";

/// Everything one report is rendered from
pub struct ReportInput<'a> {
    pub query: &'a str,
    pub date: String,
    pub sources: &'a [SourceSummary],
    pub dedup: &'a DedupReport,
    pub screening: Option<&'a ScreeningCounts>,
    pub summary: &'a AggregateSummary,
}

pub fn render_markdown(input: &ReportInput<'_>) -> String {
    let mut out = HEADER_TEMPLATE
        .replace("{query}", input.query)
        .replace("{date}", &input.date);

    out.push_str("\n## Identification\n\n| Source | Records | Status |\n|---|---:|---|\n");
    for s in input.sources {
        let status = s.error.as_deref().map_or_else(|| "ok".to_string(), |e| format!("failed: {}", e));
        out.push_str(&format!("| {} | {} | {} |\n", s.source, s.count, escape_cell(&status)));
    }
    let identified: usize = input.sources.iter().map(|s| s.count).sum();
    out.push_str(&format!("\nRecords identified: **{}**\n", identified));

    let d = input.dedup;
    out.push_str("\n## Deduplication\n\n");
    out.push_str(&format!(
        "- Records before deduplication: {}\n- Duplicates removed: {} (DOI {}, PMID {}, title {})\n- Unique records: {}\n",
        d.input,
        d.removed(),
        d.duplicate_doi,
        d.duplicate_pmid,
        d.duplicate_title,
        d.unique
    ));

    out.push_str("\n## Screening\n\n");
    match input.screening {
        Some(c) => out.push_str(&format!(
            "- Records screened: {}\n- Included: {}\n- Excluded: {}\n- Uncertain (kept): {}\n",
            c.screened, c.included, c.excluded, c.uncertain
        )),
        None => out.push_str("Screening was not run; all unique records were kept.\n"),
    }

    let dir = &input.summary.directions;
    out.push_str("\n## Effect directions\n\n| Direction | Records |\n|---|---:|\n");
    for (label, count) in [
        ("increase", dir.increase),
        ("decrease", dir.decrease),
        ("mixed", dir.mixed),
        ("no change", dir.no_change),
        ("unclassified", dir.unclassified),
    ] {
        out.push_str(&format!("| {} | {} |\n", label, count));
    }

    out.push_str("\n## Pooled estimate\n\n");
    match &input.summary.pooled {
        Some(p) => out.push_str(&pooled_table(p)),
        None => out.push_str("No records had both a direction and a usable sample size (n >= 2).\n"),
    }
    out.push('\n');
    out.push_str(DISCLAIMER);
    out.push('\n');
    out
}

fn pooled_table(p: &PooledEstimate) -> String {
    format!(
        "| Statistic | Value |
|---|---:|
| Studies | {} |
| Total participants | {} |
| Fixed-effect estimate | {:.3} |
| 95% CI | [{:.3}, {:.3}] |
| z | {:.2} |
| p | {:.4} |
| Cochran's Q (df) | {:.2} ({}) |
| I² | {:.1}% |
| τ² (DerSimonian-Laird) | {:.4} |
| Random-effects estimate | {:.3} [{:.3}, {:.3}] |
",
        p.studies,
        p.total_n,
        p.effect,
        p.ci_low,
        p.ci_high,
        p.z,
        p.p_value,
        p.q,
        p.df,
        p.i_squared,
        p.tau_squared,
        p.random_effect,
        p.random_ci_low,
        p.random_ci_high
    )
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}
