//! # sysrev
//!
//! Systematic Review Literature Pipeline - multi-source search, deduplication
//! and effect aggregation
//!
//! ## Modules
//!
//! - [`search`] - Sequential multi-source search over [`search::LiteratureSource`]s
//! - [`pubmed`], [`openalex`], [`crossref`], [`gscholar`], [`clinicaltrials`] - Sources
//! - [`dedup`] - DOI / PMID / title-hash deduplication
//! - [`extract`] - Sample size and effect direction extraction
//! - [`semanticscholar`] - Abstract enrichment by DOI
//! - [`screen`] - LLM or keyword title/abstract screening
//! - [`aggregate`] - Placeholder-effect pooling and heterogeneity
//! - [`export`], [`report`] - CSV/JSON files and the Markdown report
//! - [`config`], [`error`] - Configuration and error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sysrev::config::PipelineConfig;
//! use sysrev::dedup::{deduplicate, DedupOptions};
//! use sysrev::search::{MultiSearch, SearchQuery};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::default();
//!     let search = MultiSearch::from_config(&config)?;
//!     let outcome = search.run(&SearchQuery::from_config("statins dementia", &config)).await;
//!     let (unique, report) = deduplicate(outcome.records, DedupOptions::default());
//!     println!("{} unique of {}", unique.len(), report.input);
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod clinicaltrials;
pub mod config;
pub mod crossref;
pub mod dedup;
pub mod error;
pub mod export;
pub mod extract;
pub mod gscholar;
pub mod http;
pub mod openalex;
pub mod prompts;
pub mod pubmed;
pub mod record;
pub mod report;
pub mod screen;
pub mod search;
pub mod semanticscholar;

pub use error::{Result, SysrevError};
pub use record::{BibRecord, EffectDirection, SourceDb};
