//! Title/abstract screening.
//!
//! Two screeners produce the same decisions:
//! - LLM: one OpenAI-compatible chat request per record, run concurrently.
//! - Keyword: offline include/exclude term matching.
//!
//! Records labelled `exclude` are dropped before aggregation; `uncertain`
//! records stay in.

use crate::config::ScreeningConfig;
use crate::error::{Result, SysrevError};
use crate::http::fetch_text;
use crate::prompts::screening::{build_user_prompt, SYSTEM_PROMPT};
use crate::record::BibRecord;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Maximum concurrent LLM API requests
const MAX_CONCURRENT_REQUESTS: usize = 10;

/// Request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Model used when none is configured
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenLabel {
    Include,
    Exclude,
    Uncertain,
}

impl fmt::Display for ScreenLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScreenLabel::Include => "include",
            ScreenLabel::Exclude => "exclude",
            ScreenLabel::Uncertain => "uncertain",
        })
    }
}

/// Screening result for a single record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningDecision {
    /// [`BibRecord::key`] of the screened record
    pub key: String,
    pub title: String,
    pub label: ScreenLabel,
    pub confidence: f64,
    pub reason: String,
}

impl ScreeningDecision {
    fn uncertain(record: &BibRecord, reason: String) -> Self {
        Self {
            key: record.key(),
            title: record.title.clone(),
            label: ScreenLabel::Uncertain,
            confidence: 0.0,
            reason,
        }
    }
}

/// Token usage tracking
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Accumulated token usage with atomic counters
#[derive(Default)]
struct AtomicTokenUsage {
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
}

impl AtomicTokenUsage {
    fn add(&self, usage: &TokenUsage) {
        self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens.fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.total_tokens.fetch_add(usage.total_tokens, Ordering::Relaxed);
    }

    fn get(&self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
        }
    }
}

/// Label counts of one screening pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScreeningCounts {
    pub screened: usize,
    pub included: usize,
    pub excluded: usize,
    pub uncertain: usize,
}

impl ScreeningCounts {
    pub fn from_decisions(decisions: &[ScreeningDecision]) -> Self {
        let mut counts = Self {
            screened: decisions.len(),
            ..Default::default()
        };
        for d in decisions {
            match d.label {
                ScreenLabel::Include => counts.included += 1,
                ScreenLabel::Exclude => counts.excluded += 1,
                ScreenLabel::Uncertain => counts.uncertain += 1,
            }
        }
        counts
    }
}

/// Resolved LLM endpoint settings
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub criteria: String,
}

impl LlmConfig {
    /// `None` when no LLM base URL is configured
    pub fn from_screening(config: &ScreeningConfig) -> Result<Option<Self>> {
        let Some(base_url) = config.llm_base_url.clone() else {
            return Ok(None);
        };
        let api_key = config
            .llm_api_key
            .clone()
            .ok_or_else(|| SysrevError::Config("LLM screening requires an API key".to_string()))?;
        Ok(Some(Self {
            base_url,
            api_key,
            model: config
                .llm_model
                .clone()
                .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            criteria: config.criteria.clone(),
        }))
    }
}

/// OpenAI-compatible API response structures
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

/// Record fields sent to the LLM
#[derive(Debug, Serialize)]
struct RecordForLlm<'a> {
    title: &'a str,
    abstract_text: &'a str,
    journal: &'a str,
    year: Option<i32>,
}

impl<'a> From<&'a BibRecord> for RecordForLlm<'a> {
    fn from(r: &'a BibRecord) -> Self {
        Self {
            title: &r.title,
            abstract_text: &r.abstract_text,
            journal: &r.journal,
            year: r.year,
        }
    }
}

/// Screen records with the LLM, one concurrent request per record.
///
/// Failed requests and unparseable answers become `uncertain`. Decisions come
/// back in the order of `records`.
pub async fn screen_with_llm(
    config: &LlmConfig,
    records: &[BibRecord],
) -> Result<(Vec<ScreeningDecision>, TokenUsage)> {
    if records.is_empty() {
        return Ok((Vec::new(), TokenUsage::default()));
    }

    info!(count = records.len(), model = %config.model, "Starting LLM screening");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|e| SysrevError::Config(format!("Failed to build HTTP client: {}", e)))?;

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS));
    let token_usage = Arc::new(AtomicTokenUsage::default());

    let decisions: Vec<ScreeningDecision> = stream::iter(records.iter().enumerate())
        .map(|(idx, record)| {
            let semaphore = Arc::clone(&semaphore);
            let token_usage = Arc::clone(&token_usage);
            let client = &client;

            async move {
                let _permit = semaphore.acquire().await.ok();

                match screen_single_record(client, config, record, idx).await {
                    Ok((decision, usage)) => {
                        token_usage.add(&usage);
                        decision
                    }
                    Err(e) => {
                        warn!(
                            idx = idx,
                            title = %record.title.chars().take(50).collect::<String>(),
                            error = %e,
                            "Failed to screen record"
                        );
                        ScreeningDecision::uncertain(record, format!("API error: {}", e))
                    }
                }
            }
        })
        .buffered(MAX_CONCURRENT_REQUESTS)
        .collect()
        .await;

    let final_usage = token_usage.get();
    let counts = ScreeningCounts::from_decisions(&decisions);
    info!(
        included = counts.included,
        excluded = counts.excluded,
        uncertain = counts.uncertain,
        prompt_tokens = final_usage.prompt_tokens,
        completion_tokens = final_usage.completion_tokens,
        "LLM screening complete"
    );

    Ok((decisions, final_usage))
}

async fn screen_single_record(
    client: &reqwest::Client,
    config: &LlmConfig,
    record: &BibRecord,
    idx: usize,
) -> Result<(ScreeningDecision, TokenUsage)> {
    let record_json = serde_json::to_string_pretty(&RecordForLlm::from(record))?;
    let user_prompt = build_user_prompt(&config.criteria, &record_json);

    let request_body = serde_json::json!({
        "model": config.model,
        "messages": [
            {"role": "system", "content": SYSTEM_PROMPT},
            {"role": "user", "content": user_prompt}
        ],
        "temperature": 0.1
    });
    let api_url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));

    debug!(idx = idx, "Sending LLM request");

    let body = fetch_text(
        || {
            client
                .post(&api_url)
                .bearer_auth(&config.api_key)
                .json(&request_body)
        },
        0,
        "LLM",
    )
    .await?;

    let api_response: ChatCompletionResponse = serde_json::from_str(&body)
        .map_err(|e| SysrevError::Parse(format!("Failed to parse LLM response: {}", e)))?;

    let usage = api_response
        .usage
        .map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })
        .unwrap_or_default();

    let content = api_response
        .choices
        .first()
        .map(|c| c.message.content.as_str())
        .unwrap_or_default();

    let decision = parse_llm_response(content, record);
    debug!(idx = idx, label = %decision.label, "Record screened");

    Ok((decision, usage))
}

/// Parse the model's JSON answer; anything unparseable is `uncertain`
fn parse_llm_response(content: &str, record: &BibRecord) -> ScreeningDecision {
    #[derive(Deserialize)]
    struct LlmOutput {
        label: ScreenLabel,
        #[serde(default)]
        confidence: f64,
        #[serde(default)]
        reason: String,
    }

    match serde_json::from_str::<LlmOutput>(&extract_json(content)) {
        Ok(output) => ScreeningDecision {
            key: record.key(),
            title: record.title.clone(),
            label: output.label,
            confidence: output.confidence.clamp(0.0, 1.0),
            reason: output.reason,
        },
        Err(e) => {
            let preview: String = content.chars().take(200).collect();
            info!(
                error = %e,
                content_preview = %preview,
                "LLM output parse failed - treating as uncertain"
            );
            ScreeningDecision::uncertain(record, format!("Parse error: {}", e))
        }
    }
}

/// Extract JSON from LLM response (handles markdown code blocks)
fn extract_json(content: &str) -> String {
    let trimmed = content.trim();

    if trimmed.starts_with("```") {
        let lines: Vec<&str> = trimmed.lines().collect();
        if lines.len() >= 2 {
            let end = if lines.last().map(|l| l.trim()) == Some("```") {
                lines.len() - 1
            } else {
                lines.len()
            };
            return lines[1..end].join("\n");
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return trimmed[start..=end].to_string();
        }
    }

    trimmed.to_string()
}

/// Offline screener: any exclude term excludes, else any include term includes
pub fn keyword_screen(
    records: &[BibRecord],
    include_terms: &[String],
    exclude_terms: &[String],
) -> Vec<ScreeningDecision> {
    let normalize = |terms: &[String]| -> Vec<String> {
        terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    };
    let include = normalize(include_terms);
    let exclude = normalize(exclude_terms);

    let decisions: Vec<ScreeningDecision> = records
        .iter()
        .map(|record| {
            let text = record.text().to_lowercase();
            let hit = |terms: &[String]| terms.iter().find(|t| text.contains(t.as_str())).cloned();

            let (label, confidence, reason) = if let Some(term) = hit(exclude.as_slice()) {
                (ScreenLabel::Exclude, 1.0, format!("Matched exclude term '{}'", term))
            } else if let Some(term) = hit(include.as_slice()) {
                (ScreenLabel::Include, 1.0, format!("Matched include term '{}'", term))
            } else {
                (ScreenLabel::Uncertain, 0.0, "No term matched".to_string())
            };

            ScreeningDecision {
                key: record.key(),
                title: record.title.clone(),
                label,
                confidence,
                reason,
            }
        })
        .collect();

    let counts = ScreeningCounts::from_decisions(&decisions);
    info!(
        included = counts.included,
        excluded = counts.excluded,
        uncertain = counts.uncertain,
        "Keyword screening complete"
    );
    decisions
}

/// Drop records labelled `exclude`.
///
/// `decisions[i]` belongs to `records[i]`, the order both screeners return.
/// Records past the last decision are kept.
pub fn apply_decisions(records: Vec<BibRecord>, decisions: &[ScreeningDecision]) -> Vec<BibRecord> {
    records
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| decisions.get(*idx).map(|d| d.label) != Some(ScreenLabel::Exclude))
        .map(|(_, record)| record)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SourceDb;

    fn record(title: &str, abstract_text: &str) -> BibRecord {
        let mut r = BibRecord::new(SourceDb::PubMed, title);
        r.abstract_text = abstract_text.to_string();
        r
    }

    #[test]
    fn test_extract_json_plain() {
        let input = r#"{"label": "include", "confidence": 0.9, "reason": "test"}"#;
        assert_eq!(extract_json(input), input);
    }

    #[test]
    fn test_extract_json_code_block() {
        let input = "```json\n{\"label\": \"exclude\", \"confidence\": 0.9, \"reason\": \"test\"}\n```";
        let result = extract_json(input);
        assert!(result.starts_with('{'));
        assert!(result.contains("\"label\": \"exclude\""));
    }

    #[test]
    fn test_extract_json_with_text() {
        let input = r#"Decision: {"label": "uncertain", "confidence": 0.4, "reason": "no abstract"} done"#;
        let result = extract_json(input);
        assert!(result.starts_with('{'));
        assert!(result.ends_with('}'));
    }

    #[test]
    fn test_parse_llm_response() {
        let r = record("Gut microbiome in fibromyalgia", "");
        let content = r#"{"label": "include", "confidence": 0.95, "reason": "Adult fibromyalgia cohort"}"#;
        let decision = parse_llm_response(content, &r);
        assert_eq!(decision.label, ScreenLabel::Include);
        assert_eq!(decision.confidence, 0.95);
        assert_eq!(decision.key, r.key());
    }

    #[test]
    fn test_parse_llm_response_unknown_label_is_uncertain() {
        let r = record("Gut microbiome in fibromyalgia", "");
        let decision = parse_llm_response(r#"{"label": "relevant", "confidence": 0.9}"#, &r);
        assert_eq!(decision.label, ScreenLabel::Uncertain);
        assert_eq!(decision.confidence, 0.0);
        assert!(decision.reason.starts_with("Parse error"));

        let decision = parse_llm_response("I cannot decide.", &r);
        assert_eq!(decision.label, ScreenLabel::Uncertain);
    }

    #[test]
    fn test_llm_config_from_screening() -> Result<()> {
        assert!(LlmConfig::from_screening(&ScreeningConfig::default())?.is_none());

        let config = ScreeningConfig {
            llm_base_url: Some("https://api.example.com/v1".to_string()),
            llm_api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let llm = LlmConfig::from_screening(&config)?.expect("configured");
        assert_eq!(llm.model, DEFAULT_LLM_MODEL);

        let missing_key = ScreeningConfig {
            llm_base_url: Some("https://api.example.com/v1".to_string()),
            ..Default::default()
        };
        assert!(LlmConfig::from_screening(&missing_key).is_err());
        Ok(())
    }

    #[test]
    fn test_keyword_screen_exclude_wins() {
        let records = vec![
            record("Fibromyalgia microbiome in mice", "A murine model."),
            record("Fibromyalgia microbiome in women", "A cohort of 77 women."),
            record("Irritable bowel syndrome", ""),
        ];
        let include = vec!["Fibromyalgia".to_string()];
        let exclude = vec!["mice".to_string(), " ".to_string()];

        let decisions = keyword_screen(&records, &include, &exclude);
        let labels: Vec<ScreenLabel> = decisions.iter().map(|d| d.label).collect();
        assert_eq!(
            labels,
            vec![ScreenLabel::Exclude, ScreenLabel::Include, ScreenLabel::Uncertain]
        );

        let counts = ScreeningCounts::from_decisions(&decisions);
        assert_eq!(counts.screened, 3);
        assert_eq!(counts.excluded, 1);
    }

    #[test]
    fn test_apply_decisions_drops_excluded_only() {
        let records = vec![
            record("Fibromyalgia microbiome in mice", ""),
            record("Fibromyalgia microbiome in women", ""),
            record("Unscreened record", ""),
        ];
        let decisions = keyword_screen(&records[..2], &["women".to_string()], &["mice".to_string()]);

        let kept = apply_decisions(records, &decisions);
        let titles: Vec<&str> = kept.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Fibromyalgia microbiome in women", "Unscreened record"]);
    }

    #[test]
    fn test_apply_decisions_with_shared_keys() {
        let mut animal = record("Gut microbiota and chronic pain", "A study in mice.");
        animal.url = "https://example.org/landing".to_string();
        let mut human = record("Gut microbiota and chronic pain", "A cohort of 80 women.");
        human.url = "https://example.org/landing".to_string();
        assert_eq!(animal.key(), human.key());

        let records = vec![animal, human];
        let decisions = keyword_screen(&records, &[], &["mice".to_string()]);
        let kept = apply_decisions(records, &decisions);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].abstract_text, "A cohort of 80 women.");
    }

    #[tokio::test]
    async fn test_llm_decisions_follow_record_order() -> Result<()> {
        use wiremock::matchers::{body_string_contains, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn completion(label: &str) -> serde_json::Value {
            let answer = format!(r#"{{"label": "{}", "confidence": 0.9, "reason": "test"}}"#, label);
            serde_json::json!({
                "choices": [{"message": {"content": answer}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            })
        }

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("Slow cohort"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion("include"))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("Fast cohort"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("exclude")))
            .mount(&server)
            .await;

        let config = LlmConfig {
            base_url: server.uri(),
            api_key: "sk-test".to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            criteria: "Adults with chronic pain".to_string(),
        };
        let records = vec![record("Slow cohort", ""), record("Fast cohort", "")];
        let (decisions, usage) = screen_with_llm(&config, &records).await?;

        let titles: Vec<&str> = decisions.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["Slow cohort", "Fast cohort"]);
        assert_eq!(usage.total_tokens, 30);

        let kept = apply_decisions(records, &decisions);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].title, "Slow cohort");
        Ok(())
    }
}
