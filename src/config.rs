//! Configuration types for the invoice-to-tariff pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built
//! via its [`PipelineConfigBuilder`]. Keeping every knob in one struct makes
//! it trivial to share configs across tasks and to see, in one place, which
//! thresholds a given run used.
//!
//! Collaborators (the LLM client, the OCR engine, a progress observer) are
//! injected here as trait objects rather than discovered from ambient
//! environment state inside components — the components stay testable in
//! isolation, and credentials only ever enter through this struct.

use crate::error::TariffPipelineError;
use crate::llm::ChatClient;
use crate::ocr::OcrEngine;
use crate::progress::Progress;
use crate::retry::RetryPolicy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Where the tariff reference table comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TariffSource {
    /// Local JSON or CSV file.
    Path(PathBuf),
    /// HTTP(S) source fetched once at run start.
    Url(String),
}

impl TariffSource {
    /// Interpret a CLI argument: URLs become [`TariffSource::Url`],
    /// everything else a local path.
    pub fn from_arg(arg: &str) -> Self {
        if arg.starts_with("http://") || arg.starts_with("https://") {
            TariffSource::Url(arg.to_string())
        } else {
            TariffSource::Path(PathBuf::from(arg))
        }
    }
}

impl fmt::Display for TariffSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TariffSource::Path(p) => write!(f, "{}", p.display()),
            TariffSource::Url(u) => write!(f, "{u}"),
        }
    }
}

/// Configuration for one pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use invoice2tariff::{PipelineConfig, TariffSource};
///
/// let config = PipelineConfig::builder()
///     .tariff_source(TariffSource::from_arg("rates.json"))
///     .confidence_threshold(0.6)
///     .classify_concurrency(8)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Minimum alphanumeric characters for a page's native text to be
    /// trusted. Below this the page is treated as scanned and sent to OCR.
    /// Default: 30.
    ///
    /// Digital invoices carry real text objects and clear this easily; a
    /// scanned page yields at most stray artefacts. When native text meets
    /// the threshold it wins outright and OCR is skipped for that page.
    pub min_native_chars: usize,

    /// Classification confidence below this flags the row `LowConfidence`.
    /// Default: 0.5. The prediction is kept either way — a human reviewer
    /// needs to see uncertain codes, not have them vanish.
    pub confidence_threshold: f32,

    /// Relative tolerance for the `line total ≈ quantity × unit price`
    /// check. Default: 0.01 (1%). Violations flag the row, never drop it.
    pub total_tolerance: Decimal,

    /// Concurrent LLM classification calls. Default: 8.
    ///
    /// Classification is the highest-latency stage and items are
    /// independent, so fan-out buys near-linear wall-clock savings until
    /// the endpoint rate-limits. Lower this if you see HTTP 429.
    pub classify_concurrency: usize,

    /// Concurrent per-page OCR invocations. Default: 4.
    pub ocr_concurrency: usize,

    /// Retry attempts for transient collaborator failures. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff).
    /// Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call LLM timeout in seconds. Default: 60.
    pub llm_timeout_secs: u64,

    /// Per-page OCR timeout in seconds. Default: 120.
    pub ocr_timeout_secs: u64,

    /// Timeout for fetching a remote tariff table, in seconds. Default: 30.
    pub table_fetch_timeout_secs: u64,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Tariff reference table location. Required by `process*`.
    pub tariff_source: Option<TariffSource>,

    /// Model identifier used when building the default LLM client.
    /// Default: "gpt-4o-mini".
    pub model: Option<String>,

    /// OpenAI-compatible API base URL used when building the default LLM
    /// client. Default: `https://api.openai.com/v1`.
    pub api_base: Option<String>,

    /// API key for the default LLM client. The library never reads
    /// environment variables itself; resolve the key in your shim.
    pub api_key: Option<String>,

    /// Pre-constructed LLM client. Takes precedence over
    /// `model`/`api_base`/`api_key`. This is the injection point for tests.
    pub classifier: Option<Arc<dyn ChatClient>>,

    /// OCR engine for scanned pages. `None` means image-only pages degrade
    /// to empty text with an explicit per-page error.
    pub ocr: Option<Arc<dyn OcrEngine>>,

    /// Progress observer for per-item events.
    pub progress: Option<Progress>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_native_chars: 30,
            confidence_threshold: 0.5,
            total_tolerance: Decimal::new(1, 2), // 0.01
            classify_concurrency: 8,
            ocr_concurrency: 4,
            max_retries: 3,
            retry_backoff_ms: 500,
            llm_timeout_secs: 60,
            ocr_timeout_secs: 120,
            table_fetch_timeout_secs: 30,
            password: None,
            tariff_source: None,
            model: None,
            api_base: None,
            api_key: None,
            classifier: None,
            ocr: None,
            progress: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("min_native_chars", &self.min_native_chars)
            .field("confidence_threshold", &self.confidence_threshold)
            .field("total_tolerance", &self.total_tolerance)
            .field("classify_concurrency", &self.classify_concurrency)
            .field("ocr_concurrency", &self.ocr_concurrency)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("llm_timeout_secs", &self.llm_timeout_secs)
            .field("ocr_timeout_secs", &self.ocr_timeout_secs)
            .field("tariff_source", &self.tariff_source)
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("classifier", &self.classifier.as_ref().map(|_| "<dyn ChatClient>"))
            .field("ocr", &self.ocr.as_ref().map(|_| "<dyn OcrEngine>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// The retry policy shared by OCR and LLM call sites.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_ms: self.retry_backoff_ms,
        }
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn min_native_chars(mut self, n: usize) -> Self {
        self.config.min_native_chars = n;
        self
    }

    pub fn confidence_threshold(mut self, t: f32) -> Self {
        self.config.confidence_threshold = t.clamp(0.0, 1.0);
        self
    }

    pub fn total_tolerance(mut self, t: Decimal) -> Self {
        self.config.total_tolerance = t;
        self
    }

    pub fn classify_concurrency(mut self, n: usize) -> Self {
        self.config.classify_concurrency = n.max(1);
        self
    }

    pub fn ocr_concurrency(mut self, n: usize) -> Self {
        self.config.ocr_concurrency = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn llm_timeout_secs(mut self, secs: u64) -> Self {
        self.config.llm_timeout_secs = secs.max(1);
        self
    }

    pub fn ocr_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ocr_timeout_secs = secs.max(1);
        self
    }

    pub fn table_fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.table_fetch_timeout_secs = secs.max(1);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn tariff_source(mut self, source: TariffSource) -> Self {
        self.config.tariff_source = Some(source);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.config.api_base = Some(base.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn classifier(mut self, client: Arc<dyn ChatClient>) -> Self {
        self.config.classifier = Some(client);
        self
    }

    pub fn ocr(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.config.ocr = Some(engine);
        self
    }

    pub fn progress(mut self, progress: Progress) -> Self {
        self.config.progress = Some(progress);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, TariffPipelineError> {
        let c = &self.config;
        if !(0.0..=1.0).contains(&c.confidence_threshold) {
            return Err(TariffPipelineError::InvalidConfig(format!(
                "confidence threshold must be in 0.0–1.0, got {}",
                c.confidence_threshold
            )));
        }
        if c.total_tolerance.is_sign_negative() {
            return Err(TariffPipelineError::InvalidConfig(
                "total tolerance must not be negative".into(),
            ));
        }
        if c.classify_concurrency == 0 || c.ocr_concurrency == 0 {
            return Err(TariffPipelineError::InvalidConfig(
                "concurrency must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = PipelineConfig::builder().build().unwrap();
        assert_eq!(c.min_native_chars, 30);
        assert_eq!(c.confidence_threshold, 0.5);
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.total_tolerance, Decimal::new(1, 2));
    }

    #[test]
    fn threshold_is_clamped() {
        let c = PipelineConfig::builder()
            .confidence_threshold(7.0)
            .build()
            .unwrap();
        assert_eq!(c.confidence_threshold, 1.0);
    }

    #[test]
    fn concurrency_floor_is_one() {
        let c = PipelineConfig::builder()
            .classify_concurrency(0)
            .build()
            .unwrap();
        assert_eq!(c.classify_concurrency, 1);
    }

    #[test]
    fn tariff_source_from_arg() {
        assert_eq!(
            TariffSource::from_arg("https://example.com/rates.json"),
            TariffSource::Url("https://example.com/rates.json".into())
        );
        assert_eq!(
            TariffSource::from_arg("rates.csv"),
            TariffSource::Path(PathBuf::from("rates.csv"))
        );
    }

    #[test]
    fn debug_redacts_api_key() {
        let c = PipelineConfig::builder().api_key("sk-secret").build().unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("redacted"));
    }
}
