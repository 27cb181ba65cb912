//! Text extraction: native text first, OCR fallback per page.
//!
//! ## Extraction policy
//!
//! Digital invoices carry a native text layer; scanned ones carry page
//! images. A page's native text wins when it holds at least
//! `min_native_chars` alphanumeric characters — below that the page is
//! treated as scanned and its embedded images go to the OCR engine. When
//! OCR is impossible (no engine configured, no images, engine failure) the
//! page keeps whatever thin native text it had, or degrades to empty text
//! with an explicit [`ExtractionError`]. A degraded page never aborts the
//! document; it simply contributes no line items.
//!
//! Pages are extracted concurrently (OCR is CPU/IO-bound and pages are
//! independent), bounded by `ocr_concurrency`, and re-sorted into document
//! order before returning.

use crate::config::PipelineConfig;
use crate::error::ExtractionError;
use crate::ocr::{OcrEngine, OcrError};
use crate::pipeline::loader::{Document, Page};
use crate::retry::Transient;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// How a page's text was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextSource {
    /// The PDF's own text layer.
    NativeText,
    /// Optical character recognition over the page's embedded images.
    Ocr,
    /// Extraction failed; the page degraded to empty text.
    Failed,
}

impl fmt::Display for TextSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextSource::NativeText => write!(f, "native-text"),
            TextSource::Ocr => write!(f, "ocr"),
            TextSource::Failed => write!(f, "failed"),
        }
    }
}

/// Raw text recovered from one page, tagged with its provenance.
#[derive(Debug, Clone)]
pub struct PageText {
    /// 0-based page index in document order.
    pub page_index: usize,
    pub text: String,
    pub source: TextSource,
    /// Present when `source` is [`TextSource::Failed`].
    pub error: Option<ExtractionError>,
}

/// One OCR attempt, as seen by the retry policy.
#[derive(Debug)]
enum OcrCallError {
    Engine(OcrError),
    TimedOut(u64),
}

impl fmt::Display for OcrCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrCallError::Engine(e) => write!(f, "{e}"),
            OcrCallError::TimedOut(secs) => write!(f, "timed out after {secs}s"),
        }
    }
}

impl Transient for OcrCallError {
    fn is_transient(&self) -> bool {
        match self {
            OcrCallError::Engine(e) => e.is_transient(),
            OcrCallError::TimedOut(_) => true,
        }
    }
}

/// Extract text for every page of `doc`, in document order.
pub async fn extract_pages(doc: &Document, config: &PipelineConfig) -> Vec<PageText> {
    let mut results: Vec<PageText> = stream::iter(doc.pages.iter())
        .map(|page| extract_page(page, config))
        .buffer_unordered(config.ocr_concurrency)
        .collect()
        .await;

    // Completion order is nondeterministic under concurrency; restore
    // document order so downstream consumers never observe it.
    results.sort_by_key(|p| p.page_index);
    results
}

/// Extract text for a single page according to the fallback policy.
async fn extract_page(page: &Page, config: &PipelineConfig) -> PageText {
    let native = page.text.trim();
    let alnum = native.chars().filter(|c| c.is_alphanumeric()).count();

    if alnum >= config.min_native_chars {
        debug!("page {}: using native text ({alnum} alphanumeric chars)", page.index + 1);
        return PageText {
            page_index: page.index,
            text: native.to_string(),
            source: TextSource::NativeText,
            error: None,
        };
    }

    let Some(engine) = config.ocr.as_ref() else {
        return degrade(
            page,
            native,
            ExtractionError::NoOcrEngine { page: page.index + 1 },
        );
    };

    if page.images.is_empty() {
        return degrade(
            page,
            native,
            ExtractionError::OcrFailed {
                page: page.index + 1,
                detail: "page has no raster images to recognise".into(),
            },
        );
    }

    warn!(
        "page {}: native text below threshold ({alnum} chars), running OCR",
        page.index + 1
    );

    let mut recognised = String::new();
    let mut first_error: Option<ExtractionError> = None;

    for image in &page.images {
        match ocr_with_retry(engine, image, config, page.index).await {
            Ok(text) => {
                if !recognised.is_empty() {
                    recognised.push('\n');
                }
                recognised.push_str(text.trim());
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    if !recognised.trim().is_empty() {
        return PageText {
            page_index: page.index,
            text: recognised.trim().to_string(),
            source: TextSource::Ocr,
            error: None,
        };
    }

    let error = first_error.unwrap_or_else(|| ExtractionError::OcrFailed {
        page: page.index + 1,
        detail: "OCR produced no text".into(),
    });
    degrade(page, native, error)
}

/// Run one OCR call under the shared retry policy and per-call timeout.
async fn ocr_with_retry(
    engine: &Arc<dyn OcrEngine>,
    image: &image::DynamicImage,
    config: &PipelineConfig,
    page_index: usize,
) -> Result<String, ExtractionError> {
    let secs = config.ocr_timeout_secs;
    let result = config
        .retry_policy()
        .run("ocr", || async {
            match timeout(Duration::from_secs(secs), engine.recognize(image)).await {
                Ok(r) => r.map_err(OcrCallError::Engine),
                Err(_) => Err(OcrCallError::TimedOut(secs)),
            }
        })
        .await;

    match result {
        Ok(text) => Ok(text),
        Err((OcrCallError::TimedOut(secs), _)) => Err(ExtractionError::OcrTimeout {
            page: page_index + 1,
            secs,
        }),
        Err((OcrCallError::Engine(e), attempts)) => Err(ExtractionError::OcrFailed {
            page: page_index + 1,
            detail: format!("{e} (after {attempts} attempts)"),
        }),
    }
}

/// Degrade a page: keep thin native text if there is any, otherwise record
/// the failure and move on with empty text.
fn degrade(page: &Page, native: &str, error: ExtractionError) -> PageText {
    if !native.is_empty() {
        warn!(
            "page {}: {} — keeping native text below threshold",
            page.index + 1,
            error
        );
        return PageText {
            page_index: page.index,
            text: native.to_string(),
            source: TextSource::NativeText,
            error: None,
        };
    }
    warn!("page {}: {} — degrading to empty text", page.index + 1, error);
    PageText {
        page_index: page.index,
        text: String::new(),
        source: TextSource::Failed,
        error: Some(error),
    }
}
