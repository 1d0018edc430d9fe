//! sysrev - Systematic Review Literature Pipeline
//!
//! Searches several literature databases, deduplicates the merged results,
//! extracts sample sizes and effect directions, optionally screens records,
//! and pools placeholder effects into a Markdown report.
//!
//! ## Usage
//!
//! ```bash
//! sysrev run "gut microbiome fibromyalgia" --sources pubmed,openalex,crossref --ylo 2015
//! sysrev dedupe 1_search.csv -o 2_dedup.csv
//! sysrev aggregate 3_extracted.csv --json summary.json
//! ```

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use sysrev::aggregate::{self, AggregateSummary};
use sysrev::config::{PipelineConfig, ScreeningConfig};
use sysrev::dedup::{self, DedupOptions, DedupReport};
use sysrev::export;
use sysrev::extract::Extractor;
use sysrev::record::{BibRecord, SourceDb};
use sysrev::report::{self, ReportInput};
use sysrev::screen::{self, LlmConfig, ScreeningCounts, ScreeningDecision, TokenUsage};
use sysrev::search::{MultiSearch, SearchQuery, SourceSummary};
use sysrev::semanticscholar::SemanticScholarClient;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// Systematic Review Literature Pipeline
#[derive(Parser)]
#[command(name = "sysrev")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Config file (default: <config_dir>/sysrev/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the configured sources and save the raw records
    Search {
        /// Search query
        query: String,

        #[command(flatten)]
        search: SearchArgs,

        /// Output file (.csv or .json)
        #[arg(short, long, default_value = "search.csv")]
        output: PathBuf,
    },

    /// Remove duplicate records
    Dedupe {
        /// Input file (.csv or .json)
        input: PathBuf,

        /// Output file (.csv or .json)
        #[arg(short, long)]
        output: PathBuf,

        /// Keep duplicates' fields out of the kept record
        #[arg(long)]
        no_merge: bool,
    },

    /// Extract sample sizes and effect directions
    Extract {
        /// Input file (.csv or .json)
        input: PathBuf,

        /// Output file (.csv or .json)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Pool placeholder effects and print the estimate
    Aggregate {
        /// Input file (.csv or .json)
        input: PathBuf,

        /// Also write the full summary as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Screen records with an LLM or include/exclude keywords
    Screen {
        /// Input file (.csv or .json)
        input: PathBuf,

        /// Output file for records not excluded
        #[arg(short, long)]
        output: PathBuf,

        /// Write every decision to this CSV
        #[arg(long)]
        decisions: Option<PathBuf>,

        #[command(flatten)]
        screening: ScreenArgs,
    },

    /// Run the full pipeline into a timestamped folder
    Run {
        /// Search query
        query: String,

        #[command(flatten)]
        search: SearchArgs,

        #[command(flatten)]
        screening: ScreenArgs,

        /// Fill missing abstracts from Semantic Scholar
        #[arg(long)]
        enrich: bool,

        /// Output directory
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct SearchArgs {
    /// Sources, comma separated (pubmed,openalex,crossref,gscholar,clinicaltrials)
    #[arg(long, value_delimiter = ',')]
    sources: Vec<SourceDb>,

    /// Maximum records per source
    #[arg(long)]
    max_results: Option<usize>,

    /// Delay between API calls in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Retries on HTTP 429 (0 disables)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Publication year lower bound
    #[arg(long)]
    ylo: Option<i32>,

    /// Publication year upper bound
    #[arg(long)]
    yhi: Option<i32>,

    /// Contact email for polite API pools
    #[arg(long)]
    mailto: Option<String>,

    /// Proxy URL (e.g., http://127.0.0.1:7890)
    #[arg(long)]
    proxy: Option<String>,

    /// Google Scholar mirror URL
    #[arg(long)]
    mirror: Option<String>,
}

impl SearchArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if !self.sources.is_empty() {
            config.sources = self.sources.clone();
        }
        if let Some(n) = self.max_results {
            config.max_results = n;
        }
        if let Some(ms) = self.delay_ms {
            config.delay_ms = ms;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if self.ylo.is_some() {
            config.year_from = self.ylo;
        }
        if self.yhi.is_some() {
            config.year_to = self.yhi;
        }
        if let Some(mailto) = &self.mailto {
            config.mailto = mailto.clone();
        }
        if self.proxy.is_some() {
            config.proxy = self.proxy.clone();
        }
        if self.mirror.is_some() {
            config.scholar_mirror = self.mirror.clone();
        }
    }
}

#[derive(Args)]
struct ScreenArgs {
    /// Inclusion criteria for the LLM screener
    #[arg(long)]
    criteria: Option<String>,

    /// Keyword screener: include on any of these terms (comma separated)
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,

    /// Keyword screener: exclude on any of these terms (comma separated)
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// LLM API base URL (enables LLM screening, e.g., https://api.openai.com/v1)
    #[arg(long)]
    llm_base_url: Option<String>,

    /// LLM API key
    #[arg(long)]
    llm_key: Option<String>,

    /// LLM model name
    #[arg(long)]
    llm_model: Option<String>,
}

impl ScreenArgs {
    fn apply(&self, config: &mut ScreeningConfig) {
        if let Some(criteria) = &self.criteria {
            config.criteria = criteria.clone();
        }
        if !self.include.is_empty() {
            config.include_terms = self.include.clone();
        }
        if !self.exclude.is_empty() {
            config.exclude_terms = self.exclude.clone();
        }
        if self.llm_base_url.is_some() {
            config.llm_base_url = self.llm_base_url.clone();
        }
        if self.llm_key.is_some() {
            config.llm_api_key = self.llm_key.clone();
        }
        if self.llm_model.is_some() {
            config.llm_model = self.llm_model.clone();
        }
    }
}

/// Contents of `summary.json`
#[derive(Serialize)]
struct RunSummary<'a> {
    query: &'a str,
    generated: String,
    sources: &'a [SourceSummary],
    dedup: &'a DedupReport,
    screening: Option<&'a ScreeningCounts>,
    token_usage: Option<&'a TokenUsage>,
    aggregate: &'a AggregateSummary,
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let mut config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    apply_overrides(&cli.command, &mut config);
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Search { query, output, .. } => {
            let (records, _) = run_search(&query, &config).await?;
            export::write_records(&output, &records).context("Failed to write records")?;
            println!("Saved {} records to {}", records.len(), output.display());
            Ok(())
        }
        Commands::Dedupe { input, output, no_merge } => {
            let records = load_records(&input)?;
            let options = DedupOptions {
                fill_missing: config.merge_duplicates && !no_merge,
            };
            let (unique, report) = dedup::deduplicate(records, options);
            print_dedup(&report);
            export::write_records(&output, &unique).context("Failed to write records")?;
            Ok(())
        }
        Commands::Extract { input, output } => {
            let mut records = load_records(&input)?;
            let extractor = Extractor::new()?;
            let changed = extractor.annotate_all(&mut records);
            println!("Annotated {} of {} records", changed, records.len());
            export::write_records(&output, &records).context("Failed to write records")?;
            Ok(())
        }
        Commands::Aggregate { input, json } => {
            let records = load_records(&input)?;
            let summary = aggregate::summarize(&records, &config.placeholders);
            print_aggregate(&summary);
            if let Some(path) = json {
                export::write_json(&path, &summary).context("Failed to write summary")?;
            }
            Ok(())
        }
        Commands::Screen {
            input, output, decisions, ..
        } => {
            if !config.screening.is_enabled() {
                bail!("No screener configured: pass --llm-base-url or --include/--exclude terms");
            }

            let records = load_records(&input)?;
            let (results, _) = run_screening(&config.screening, &records).await?;
            if let Some(path) = decisions {
                save_csv(&path, &results)?;
            }
            let kept = screen::apply_decisions(records, &results);
            export::write_records(&output, &kept).context("Failed to write records")?;
            Ok(())
        }
        Commands::Run { query, output, .. } => {
            run_pipeline(&query, &config, &output).await
        }
    }
}

/// CLI flags override file and environment settings; validate afterwards
fn apply_overrides(command: &Commands, config: &mut PipelineConfig) {
    match command {
        Commands::Search { search, .. } => search.apply(config),
        Commands::Screen { screening, .. } => screening.apply(&mut config.screening),
        Commands::Run {
            search,
            screening,
            enrich,
            ..
        } => {
            search.apply(config);
            screening.apply(&mut config.screening);
            config.enrich |= *enrich;
        }
        Commands::Dedupe { .. } | Commands::Extract { .. } | Commands::Aggregate { .. } => {}
    }
}

// ============================================================================
// Full Pipeline
// ============================================================================

async fn run_pipeline(query: &str, config: &PipelineConfig, output_dir: &Path) -> Result<()> {
    // Create output folder
    let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let safe_query: String = query
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '-' || *c == '_')
        .collect::<String>()
        .trim()
        .replace(' ', "_");
    let output_folder = output_dir.join(format!("{}_{}", timestamp, safe_query));
    std::fs::create_dir_all(&output_folder).context("Failed to create output directory")?;

    println!("Output folder: {}", output_folder.display());

    // ===========================================
    // STAGE 1: Multi-source search
    // ===========================================
    println!("\n--- Stage 1: Multi-source Search ---");
    let (records, sources) = run_search(query, config).await?;
    export::write_records(&output_folder.join("1_search.csv"), &records)?;

    // ===========================================
    // STAGE 2: Deduplication
    // ===========================================
    println!("\n--- Stage 2: Deduplication ---");
    let options = DedupOptions {
        fill_missing: config.merge_duplicates,
    };
    let (mut records, dedup_report) = dedup::deduplicate(records, options);
    print_dedup(&dedup_report);
    export::write_records(&output_folder.join("2_dedup.csv"), &records)?;

    // ===========================================
    // STAGE 3: Enrichment + extraction
    // ===========================================
    if config.enrich {
        println!("\n--- Stage 3a: Semantic Scholar Enrichment ---");
        let client = SemanticScholarClient::new(&config.http(), config.semanticscholar_api_key.clone())?;
        let updated = client.enrich(&mut records).await;
        println!("Enriched {} records", updated);
    }

    println!("\n--- Stage 3: Extraction ---");
    let extractor = Extractor::new()?;
    let changed = extractor.annotate_all(&mut records);
    println!("Annotated {} of {} records", changed, records.len());
    export::write_records(&output_folder.join("3_extracted.csv"), &records)?;

    // ===========================================
    // STAGE 4: Screening (optional)
    // ===========================================
    let mut screening_counts = None;
    let mut token_usage = None;
    if config.screening.is_enabled() {
        println!("\n--- Stage 4: Screening ---");
        let (decisions, usage) = run_screening(&config.screening, &records).await?;
        save_csv(&output_folder.join("4_decisions.csv"), &decisions)?;
        screening_counts = Some(ScreeningCounts::from_decisions(&decisions));
        token_usage = usage;
        records = screen::apply_decisions(records, &decisions);
        export::write_records(&output_folder.join("4_screened.csv"), &records)?;
    } else {
        println!("\n--- Stage 4: Skipped (no screener configured) ---");
    }

    // ===========================================
    // STAGE 5: Aggregation + report
    // ===========================================
    println!("\n--- Stage 5: Aggregation ---");
    let summary = aggregate::summarize(&records, &config.placeholders);
    print_aggregate(&summary);

    let generated = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    export::write_json(&output_folder.join("records.json"), &records)?;
    export::write_json(
        &output_folder.join("summary.json"),
        &RunSummary {
            query,
            generated: generated.clone(),
            sources: &sources,
            dedup: &dedup_report,
            screening: screening_counts.as_ref(),
            token_usage: token_usage.as_ref(),
            aggregate: &summary,
        },
    )?;

    let markdown = report::render_markdown(&ReportInput {
        query,
        date: generated,
        sources: &sources,
        dedup: &dedup_report,
        screening: screening_counts.as_ref(),
        summary: &summary,
    });
    let report_path = output_folder.join("report.md");
    std::fs::write(&report_path, markdown).context("Failed to write report")?;
    println!("\nReport: {}", report_path.display());

    info!(folder = %output_folder.display(), records = records.len(), "Pipeline complete");
    Ok(())
}

async fn run_search(query: &str, config: &PipelineConfig) -> Result<(Vec<BibRecord>, Vec<SourceSummary>)> {
    let search = MultiSearch::from_config(config).context("Failed to set up sources")?;
    let outcome = search.run(&SearchQuery::from_config(query, config)).await;

    for s in &outcome.sources {
        match &s.error {
            Some(e) => println!("  {:<15} failed: {}", s.source.as_str(), e),
            None => println!("  {:<15} {} records", s.source.as_str(), s.count),
        }
    }
    println!("Identified {} records", outcome.records.len());

    Ok((outcome.records, outcome.sources))
}

/// Screen with the LLM when configured, otherwise with keywords
async fn run_screening(
    config: &ScreeningConfig,
    records: &[BibRecord],
) -> Result<(Vec<ScreeningDecision>, Option<TokenUsage>)> {
    let (decisions, usage) = match LlmConfig::from_screening(config)? {
        Some(llm) => {
            let (decisions, usage) = screen::screen_with_llm(&llm, records).await?;
            println!(
                "Token usage: {} prompt + {} completion = {} total",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
            (decisions, Some(usage))
        }
        None => (
            screen::keyword_screen(records, &config.include_terms, &config.exclude_terms),
            None,
        ),
    };

    let counts = ScreeningCounts::from_decisions(&decisions);
    println!(
        "Screened {}: {} included, {} excluded, {} uncertain",
        counts.screened, counts.included, counts.excluded, counts.uncertain
    );
    Ok((decisions, usage))
}

fn load_records(path: &Path) -> Result<Vec<BibRecord>> {
    let records = export::read_records(path).with_context(|| format!("Failed to read {}", path.display()))?;
    info!(path = %path.display(), count = records.len(), "Loaded records");
    Ok(records)
}

fn print_dedup(report: &DedupReport) {
    println!(
        "Removed {} duplicates (DOI {}, PMID {}, title {}); {} unique",
        report.removed(),
        report.duplicate_doi,
        report.duplicate_pmid,
        report.duplicate_title,
        report.unique
    );
}

fn print_aggregate(summary: &AggregateSummary) {
    let d = &summary.directions;
    println!(
        "Directions: {} increase, {} decrease, {} mixed, {} no change, {} unclassified",
        d.increase, d.decrease, d.mixed, d.no_change, d.unclassified
    );
    match &summary.pooled {
        Some(p) => {
            println!(
                "Pooled (fixed): {:.3} [{:.3}, {:.3}], p = {:.4}, {} studies, n = {}",
                p.effect, p.ci_low, p.ci_high, p.p_value, p.studies, p.total_n
            );
            println!(
                "Heterogeneity: Q = {:.2} (df {}), I² = {:.1}%, tau² = {:.4}; random-effects {:.3}",
                p.q, p.df, p.i_squared, p.tau_squared, p.random_effect
            );
        }
        None => println!("No records with both a direction and a sample size; nothing to pool"),
    }
}

/// Save data to CSV file
fn save_csv<T: Serialize>(path: &Path, data: &[T]) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(true)
        .from_path(path)
        .context("Failed to create CSV writer")?;

    for item in data {
        wtr.serialize(item).context("Failed to write CSV record")?;
    }

    wtr.flush().context("Failed to flush CSV")?;
    println!("Saved: {}", path.display());
    Ok(())
}
