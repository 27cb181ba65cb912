//! The classifier prompt contract.
//!
//! Centralising the prompt here serves two purposes:
//!
//! 1. **Single source of truth** — the prompt and response schema form a
//!    fixed contract with the LLM collaborator. Changing either requires
//!    bumping [`PROMPT_VERSION`], which is recorded on every report so two
//!    runs can be compared knowing whether they used the same contract.
//!
//! 2. **Testability** — unit tests can inspect the prompt and exercise the
//!    response validator without a live model.
//!
//! The contract is deliberately not overridable at runtime: reproducibility
//! of classifications depends on the (model id, prompt version) pair, and a
//! free-form prompt override would silently break that.

/// Version tag for the (prompt, response schema) pair. Bump on any change.
pub const PROMPT_VERSION: &str = "hts-classify/v1";

/// System prompt sent with every classification request.
pub const CLASSIFIER_SYSTEM_PROMPT: &str = r#"You are a customs tariff classification specialist.
Given one invoice line item, predict the single most likely Harmonized Tariff
Schedule (HTS) code for it, based on standard customs practice.

Respond with ONLY a JSON object matching this schema exactly:
{
  "code": "HTS code in dotted form, e.g. 8471.30.01",
  "confidence": 0.0,
  "rationale": "one short sentence explaining the choice"
}

Rules:
- "code" must contain 4, 6, 8, or 10 digits in dot-separated groups
  (####, ####.##, ####.##.##, or ####.##.##.##).
- "confidence" is a number between 0.0 and 1.0 reflecting how certain you
  are that the code is correct for this item.
- Return ONLY the JSON object. No markdown fences, no commentary."#;

/// Build the per-item user message.
///
/// Quantity and unit price are included when the parser recovered them;
/// they often disambiguate (e.g. bulk industrial quantities vs retail).
pub fn classification_request(
    description: &str,
    quantity: Option<&str>,
    unit_price: Option<&str>,
) -> String {
    let mut msg = format!("Line item description: {description}");
    if let Some(qty) = quantity {
        msg.push_str(&format!("\nQuantity: {qty}"));
    }
    if let Some(price) = unit_price {
        msg.push_str(&format!("\nUnit price: {price}"));
    }
    msg
}
