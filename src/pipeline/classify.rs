//! HTS classification: drive the LLM collaborator for each line item.
//!
//! This stage never propagates an error upward: every item yields exactly
//! one [`ClassificationResult`], failed calls included, so the report row
//! count stays invariant across collaborator outages.
//!
//! ## Retry strategy
//!
//! HTTP 429/5xx and timeouts are transient and frequent under concurrent
//! load; they are retried under the shared [`RetryPolicy`]. A response that
//! arrives but violates the schema (unparseable JSON, bad code format,
//! confidence out of range) is a contract violation by the collaborator —
//! retrying would re-spend tokens on the same defect, so it is surfaced
//! immediately as a malformed-response failure with the diagnostic kept.

use crate::config::PipelineConfig;
use crate::llm::{ChatClient, ChatError};
use crate::pipeline::parse::LineItem;
use crate::prompts;
use crate::retry::Transient;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// A validated HTS code in dotted form (`####`, `####.##`, `####.##.##`,
/// or `####.##.##.##`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HtsCode(String);

static HTS_DOTTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}(?:\.\d{2}){0,3}$").unwrap());

impl HtsCode {
    /// Parse a dotted or bare-digit code, normalising to dotted form.
    ///
    /// Accepts `8471.30.01` as well as `84713001` (models sometimes drop
    /// the dots); anything else is rejected with a reason.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let s = raw.trim();
        if HTS_DOTTED.is_match(s) {
            return Ok(Self(s.to_string()));
        }
        if s.chars().all(|c| c.is_ascii_digit()) && matches!(s.len(), 4 | 6 | 8 | 10) {
            let mut dotted = s[..4].to_string();
            for chunk in s.as_bytes()[4..].chunks(2) {
                dotted.push('.');
                dotted.push_str(std::str::from_utf8(chunk).expect("ascii digits"));
            }
            return Ok(Self(dotted));
        }
        Err(format!("'{raw}' is not a valid HTS code"))
    }

    /// The dotted representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The code with dots stripped: the lookup key.
    pub fn digits(&self) -> String {
        self.0.chars().filter(|c| c.is_ascii_digit()).collect()
    }
}

impl fmt::Display for HtsCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why an item could not be classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassifyFailure {
    /// Transient failures exhausted the retry budget.
    Unavailable { attempts: u32, detail: String },
    /// Every attempt exceeded the per-call timeout.
    Timeout { attempts: u32, secs: u64 },
    /// The collaborator answered, but outside the response contract.
    /// Non-retryable by design.
    MalformedResponse { detail: String },
}

impl fmt::Display for ClassifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifyFailure::Unavailable { attempts, detail } => {
                write!(f, "classification unavailable after {attempts} attempts: {detail}")
            }
            ClassifyFailure::Timeout { attempts, secs } => {
                write!(f, "classification timed out ({attempts} attempts of {secs}s)")
            }
            ClassifyFailure::MalformedResponse { detail } => {
                write!(f, "malformed classifier response: {detail}")
            }
        }
    }
}

/// The classifier's verdict for one line item. Exactly one per item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Ordinal of the [`LineItem`] this belongs to.
    pub item_ordinal: usize,
    /// Predicted code; `None` when classification failed.
    pub code: Option<HtsCode>,
    pub confidence: Option<f32>,
    pub rationale: Option<String>,
    /// Confidence fell below the configured threshold. The code is kept.
    pub low_confidence: bool,
    pub failure: Option<ClassifyFailure>,
}

/// One LLM attempt, as seen by the retry policy.
#[derive(Debug)]
enum CallError {
    Chat(ChatError),
    TimedOut(u64),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Chat(e) => write!(f, "{e}"),
            CallError::TimedOut(secs) => write!(f, "timed out after {secs}s"),
        }
    }
}

impl Transient for CallError {
    fn is_transient(&self) -> bool {
        match self {
            CallError::Chat(e) => e.is_transient(),
            CallError::TimedOut(_) => true,
        }
    }
}

/// Classify every item concurrently, returning results in item order.
pub async fn classify_items(
    client: &Arc<dyn ChatClient>,
    items: &[LineItem],
    config: &PipelineConfig,
) -> Vec<ClassificationResult> {
    let total = items.len();
    let mut results: Vec<ClassificationResult> = stream::iter(items.iter())
        .map(|item| {
            let client = Arc::clone(client);
            async move {
                let result = classify_item(&client, item, config).await;
                if let Some(ref progress) = config.progress {
                    progress.on_item_done(item.ordinal, total, result.failure.is_some());
                }
                result
            }
        })
        .buffer_unordered(config.classify_concurrency)
        .collect()
        .await;

    // Completion order is nondeterministic; restore document order.
    results.sort_by_key(|r| r.item_ordinal);
    results
}

/// Classify a single item. Always returns a result, never an error.
pub async fn classify_item(
    client: &Arc<dyn ChatClient>,
    item: &LineItem,
    config: &PipelineConfig,
) -> ClassificationResult {
    let quantity = item.quantity.map(|q| q.to_string());
    let unit_price = item.unit_price.as_ref().map(|p| p.to_string());
    let user = prompts::classification_request(
        &item.description,
        quantity.as_deref(),
        unit_price.as_deref(),
    );

    let secs = config.llm_timeout_secs;
    let outcome = config
        .retry_policy()
        .run("classify", || async {
            match timeout(
                Duration::from_secs(secs),
                client.complete(prompts::CLASSIFIER_SYSTEM_PROMPT, &user),
            )
            .await
            {
                Ok(r) => r.map_err(CallError::Chat),
                Err(_) => Err(CallError::TimedOut(secs)),
            }
        })
        .await;

    let content = match outcome {
        Ok(content) => content,
        Err((CallError::TimedOut(secs), attempts)) => {
            warn!("item {}: classification timed out after {attempts} attempts", item.ordinal);
            return failed(item.ordinal, ClassifyFailure::Timeout { attempts, secs });
        }
        Err((CallError::Chat(e), attempts)) => {
            warn!("item {}: classification failed after {attempts} attempts: {e}", item.ordinal);
            return failed(
                item.ordinal,
                ClassifyFailure::Unavailable {
                    attempts,
                    detail: e.to_string(),
                },
            );
        }
    };

    match validate_response(&content) {
        Ok((code, confidence, rationale)) => {
            let low_confidence = confidence < config.confidence_threshold;
            if low_confidence {
                debug!(
                    "item {}: low confidence {:.2} for {}",
                    item.ordinal, confidence, code
                );
            }
            ClassificationResult {
                item_ordinal: item.ordinal,
                code: Some(code),
                confidence: Some(confidence),
                rationale,
                low_confidence,
                failure: None,
            }
        }
        Err(detail) => {
            warn!("item {}: malformed classifier response: {detail}", item.ordinal);
            failed(item.ordinal, ClassifyFailure::MalformedResponse { detail })
        }
    }
}

fn failed(ordinal: usize, failure: ClassifyFailure) -> ClassificationResult {
    ClassificationResult {
        item_ordinal: ordinal,
        code: None,
        confidence: None,
        rationale: None,
        low_confidence: false,
        failure: Some(failure),
    }
}

// ── Response validation ──────────────────────────────────────────────────

/// The schema the collaborator contracted to return.
#[derive(Debug, Deserialize)]
struct RawClassification {
    code: String,
    confidence: f32,
    #[serde(default)]
    rationale: Option<String>,
}

/// Validate a raw completion against the response contract.
///
/// Tolerates two well-known model quirks that do not change the payload:
/// markdown fences around the object, and prose before/after it. Anything
/// beyond that — missing fields, a malformed code, confidence outside
/// 0–1 — is rejected with the diagnostic preserved.
fn validate_response(content: &str) -> Result<(HtsCode, f32, Option<String>), String> {
    let stripped = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let json = extract_json_object(stripped)?;
    let raw: RawClassification = serde_json::from_str(json)
        .map_err(|e| format!("{e} (raw: {})", truncate(content, 200)))?;

    let code = HtsCode::parse(&raw.code)?;
    if !(0.0..=1.0).contains(&raw.confidence) {
        return Err(format!("confidence {} outside 0.0–1.0", raw.confidence));
    }

    Ok((code, raw.confidence, raw.rationale))
}

/// Extract the outermost JSON object from a string that may contain
/// surrounding prose (e.g. thinking tokens).
fn extract_json_object(s: &str) -> Result<&str, String> {
    let start = s.find('{').ok_or("no '{' in response")?;
    let end = s.rfind('}').ok_or("no '}' in response")?;
    if end <= start {
        return Err("malformed JSON in response".into());
    }
    Ok(&s[start..=end])
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hts_code_accepts_dotted_forms() {
        assert_eq!(HtsCode::parse("8471.30.01").unwrap().as_str(), "8471.30.01");
        assert_eq!(HtsCode::parse("8471.30").unwrap().as_str(), "8471.30");
        assert_eq!(HtsCode::parse("8471").unwrap().as_str(), "8471");
    }

    #[test]
    fn hts_code_redots_bare_digits() {
        assert_eq!(HtsCode::parse("84713001").unwrap().as_str(), "8471.30.01");
        assert_eq!(HtsCode::parse("847130").unwrap().as_str(), "8471.30");
    }

    #[test]
    fn hts_code_rejects_garbage() {
        assert!(HtsCode::parse("chapter 84").is_err());
        assert!(HtsCode::parse("84.71").is_err());
        assert!(HtsCode::parse("8471.3").is_err());
        assert!(HtsCode::parse("").is_err());
    }

    #[test]
    fn digits_strips_dots() {
        assert_eq!(HtsCode::parse("8471.30.01").unwrap().digits(), "84713001");
    }

    #[test]
    fn validate_accepts_clean_json() {
        let (code, conf, rationale) = validate_response(
            r#"{"code": "8471.30.01", "confidence": 0.92, "rationale": "portable computer"}"#,
        )
        .unwrap();
        assert_eq!(code.as_str(), "8471.30.01");
        assert!((conf - 0.92).abs() < f32::EPSILON);
        assert_eq!(rationale.as_deref(), Some("portable computer"));
    }

    #[test]
    fn validate_tolerates_fences_and_prose() {
        let fenced = "```json\n{\"code\": \"8471.30\", \"confidence\": 0.8}\n```";
        assert!(validate_response(fenced).is_ok());

        let prose = "Sure! Here is the answer: {\"code\": \"8471.30\", \"confidence\": 0.8} Hope that helps.";
        assert!(validate_response(prose).is_ok());
    }

    #[test]
    fn validate_rejects_bad_code() {
        let err = validate_response(r#"{"code": "not-a-code", "confidence": 0.9}"#).unwrap_err();
        assert!(err.contains("not-a-code"));
    }

    #[test]
    fn validate_rejects_out_of_range_confidence() {
        let err = validate_response(r#"{"code": "8471.30", "confidence": 1.5}"#).unwrap_err();
        assert!(err.contains("1.5"));
    }

    #[test]
    fn validate_rejects_non_json() {
        assert!(validate_response("I think it is probably chapter 84").is_err());
    }
}
