//! Title/abstract screening prompts.
//!
//! Contains system and user prompt templates for LLM-based screening against
//! review inclusion criteria.

/// System prompt for title/abstract screening
pub const SYSTEM_PROMPT: &str = r#"You are screening records for a systematic review. Decide whether a record meets the review's inclusion criteria based ONLY on the provided fields (title/abstract/journal/year).

Rules you MUST follow:
- Do NOT fabricate abstract or study content.
- Output "uncertain" when the fields do not settle the decision; do not guess.
- Output MUST be valid JSON only (no extra text), for machine parsing.

Labels:
- include: The record plausibly meets every inclusion criterion and no exclusion criterion.
- exclude: The record clearly fails at least one criterion (wrong population, intervention, design or topic).
- uncertain: Missing abstract, conflicting signals, or criteria that cannot be judged from the fields.

Output format (strict JSON, no markdown):
{
  "label": "include" | "exclude" | "uncertain",
  "confidence": 0.0-1.0,
  "reason": "Brief explanation in English naming the deciding criterion"
}"#;

/// User prompt template for screening one record
/// Placeholders: {criteria}, {record_json}
pub const USER_PROMPT_TEMPLATE: &str = r#"Screen the following record.

Inclusion criteria:
{criteria}

Record (JSON):
{record_json}

Output strict JSON only (no markdown code blocks, no extra text):
{
  "label": "include" | "exclude" | "uncertain",
  "confidence": 0.0-1.0,
  "reason": "Brief explanation"
}"#;

/// Build user prompt with record data
pub fn build_user_prompt(criteria: &str, record_json: &str) -> String {
    USER_PROMPT_TEMPLATE
        .replace("{criteria}", criteria)
        .replace("{record_json}", record_json)
}
