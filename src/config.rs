//! Pipeline configuration.
//!
//! Resolution order: JSON file (explicit `--config`, else
//! `<config_dir>/sysrev/config.json`, else built-in defaults), then
//! `SYSREV_*` environment variables, then CLI flags applied by the binary.

use crate::aggregate::EffectPlaceholders;
use crate::error::{Result, SysrevError};
use crate::record::SourceDb;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Contact address sent to polite-pool APIs (OpenAlex, Crossref)
pub const DEFAULT_MAILTO: &str = "sysrev@example.org";

/// Environment variable overrides
pub const ENV_MAILTO: &str = "SYSREV_MAILTO";
pub const ENV_PUBMED_API_KEY: &str = "SYSREV_PUBMED_API_KEY";
pub const ENV_LLM_API_KEY: &str = "SYSREV_LLM_API_KEY";
pub const ENV_S2_API_KEY: &str = "SYSREV_S2_API_KEY";

/// Full pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Sources queried, in order
    pub sources: Vec<SourceDb>,
    /// Maximum records requested per source
    pub max_results: usize,
    /// Fixed delay between API calls (milliseconds)
    pub delay_ms: u64,
    /// Per-request timeout (seconds)
    pub timeout_secs: u64,
    /// Retries on HTTP 429; 0 disables retrying
    pub max_retries: u32,
    /// Publication year lower bound (inclusive)
    pub year_from: Option<i32>,
    /// Publication year upper bound (inclusive)
    pub year_to: Option<i32>,
    /// Contact email for polite pools
    pub mailto: String,
    /// NCBI API key (raises PubMed limit to 10 req/s)
    pub pubmed_api_key: Option<String>,
    /// Google Scholar mirror base URL
    pub scholar_mirror: Option<String>,
    /// Raw `Cookie` header for Google Scholar
    pub scholar_cookie: Option<String>,
    /// Proxy URL applied to all clients
    pub proxy: Option<String>,
    /// Fill missing abstracts from Semantic Scholar
    pub enrich: bool,
    /// Semantic Scholar API key (higher rate limit)
    pub semanticscholar_api_key: Option<String>,
    /// Fill empty fields of kept records from their duplicates
    pub merge_duplicates: bool,
    /// Numeric stand-ins for qualitative directions
    pub placeholders: EffectPlaceholders,
    /// Screening settings
    pub screening: ScreeningConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sources: vec![SourceDb::PubMed, SourceDb::OpenAlex, SourceDb::Crossref],
            max_results: 100,
            delay_ms: 500,
            timeout_secs: 30,
            max_retries: 0,
            year_from: None,
            year_to: None,
            mailto: DEFAULT_MAILTO.to_string(),
            pubmed_api_key: None,
            scholar_mirror: None,
            scholar_cookie: None,
            proxy: None,
            enrich: false,
            semanticscholar_api_key: None,
            merge_duplicates: true,
            placeholders: EffectPlaceholders::default(),
            screening: ScreeningConfig::default(),
        }
    }
}

/// Screening configuration (LLM or keyword)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    /// OpenAI-compatible base URL; enables the LLM screener
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: Option<String>,
    /// Inclusion criteria given to the LLM
    pub criteria: String,
    /// Keyword screener: any hit includes
    pub include_terms: Vec<String>,
    /// Keyword screener: any hit excludes
    pub exclude_terms: Vec<String>,
}

impl ScreeningConfig {
    /// Whether any screener is configured
    pub fn is_enabled(&self) -> bool {
        self.llm_base_url.is_some() || !self.include_terms.is_empty() || !self.exclude_terms.is_empty()
    }
}

/// Connection settings derived from the pipeline configuration
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub delay: Duration,
    pub max_retries: u32,
    pub mailto: String,
    pub proxy: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        PipelineConfig::default().http()
    }
}

impl PipelineConfig {
    /// Load configuration from a file, the default location, or defaults,
    /// then apply environment overrides.
    ///
    /// Not validated: call [`PipelineConfig::validate`] once CLI flags are applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(p) => Self::from_file(&p)?,
                None => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SysrevError::Config(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| SysrevError::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Apply environment overrides through a lookup function
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mailto) = lookup(ENV_MAILTO).filter(|v| !v.is_empty()) {
            self.mailto = mailto;
        }
        if let Some(key) = lookup(ENV_PUBMED_API_KEY).filter(|v| !v.is_empty()) {
            self.pubmed_api_key = Some(key);
        }
        if let Some(key) = lookup(ENV_S2_API_KEY).filter(|v| !v.is_empty()) {
            self.semanticscholar_api_key = Some(key);
        }
        if let Some(key) = lookup(ENV_LLM_API_KEY).filter(|v| !v.is_empty()) {
            self.screening.llm_api_key = Some(key);
        }
    }

    /// Reject configurations no search could satisfy
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(SysrevError::Validation("At least one source is required".into()));
        }
        if self.max_results == 0 {
            return Err(SysrevError::Validation("max_results must be positive".into()));
        }
        if let (Some(from), Some(to)) = (self.year_from, self.year_to) {
            if from > to {
                return Err(SysrevError::Validation(format!(
                    "year_from ({}) is after year_to ({})",
                    from, to
                )));
            }
        }
        if self.screening.llm_base_url.is_some() && self.screening.llm_api_key.is_none() {
            return Err(SysrevError::Validation(format!(
                "LLM screening needs an API key (set {} or --llm-key)",
                ENV_LLM_API_KEY
            )));
        }
        Ok(())
    }

    pub fn http(&self) -> HttpSettings {
        HttpSettings {
            timeout: Duration::from_secs(self.timeout_secs),
            delay: Duration::from_millis(self.delay_ms),
            max_retries: self.max_retries,
            mailto: self.mailto.clone(),
            proxy: self.proxy.clone(),
        }
    }
}

/// `<config_dir>/sysrev/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("sysrev").join("config.json"))
}
