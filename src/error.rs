//! Error types for the invoice2tariff library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`TariffPipelineError`] — **Fatal**: the run cannot proceed at all
//!   (unreadable document, missing tariff table, classifier not configured).
//!   Returned as `Err(TariffPipelineError)` from the top-level `process*`
//!   functions.
//!
//! * [`ExtractionError`] — **Non-fatal**: a single page could not be read
//!   (OCR glitch, no OCR engine for an image-only page). Stored inside
//!   [`crate::pipeline::extract::PageText`] so the page degrades to empty
//!   text instead of losing the whole document.
//!
//! Per-item classification failures are carried on
//! [`crate::pipeline::classify::ClassificationResult`] rather than here;
//! an item that cannot be classified still produces exactly one report row.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the invoice2tariff library.
///
/// Page-level failures use [`ExtractionError`] and item-level failures use
/// [`crate::pipeline::classify::ClassifyFailure`]; neither aborts a run.
#[derive(Debug, Error)]
pub enum TariffPipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Invoice file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The byte stream is not a PDF.
    #[error("Input is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { magic: [u8; 4] },

    // ── Document errors ───────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF is corrupt: {detail}\nTry repairing with: qpdf --decrypt input.pdf output.pdf")]
    CorruptPdf { detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired,

    /// A password was provided but it is wrong.
    #[error("Wrong password for encrypted PDF")]
    WrongPassword,

    /// The PDF parsed but contains no pages.
    #[error("PDF contains no pages")]
    EmptyDocument,

    // ── Run-setup errors ──────────────────────────────────────────────────
    /// The tariff reference table could not be loaded.
    #[error("Failed to load tariff table from '{table_source}': {detail}")]
    TariffTableLoad { table_source: String, detail: String },

    /// No LLM classifier is configured and none could be built.
    #[error("Tariff classifier is not configured.\n{hint}")]
    ClassifierNotConfigured { hint: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal extraction error for a single page.
///
/// Stored on [`crate::pipeline::extract::PageText`] when a page degrades to
/// empty text. The run continues; downstream stages simply see no line
/// items from that page.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum ExtractionError {
    /// The OCR engine returned an error for this page.
    #[error("Page {page}: OCR failed: {detail}")]
    OcrFailed { page: usize, detail: String },

    /// The OCR call exceeded its timeout after all retries.
    #[error("Page {page}: OCR timed out after {secs}s")]
    OcrTimeout { page: usize, secs: u64 },

    /// The page has only image content and no OCR engine is configured.
    #[error("Page {page}: image-only page but no OCR engine configured")]
    NoOcrEngine { page: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_a_pdf_display() {
        let e = TariffPipelineError::NotAPdf {
            magic: [0x50, 0x4b, 0x03, 0x04],
        };
        assert!(e.to_string().contains("not a valid PDF"));
    }

    #[test]
    fn tariff_table_load_display() {
        let e = TariffPipelineError::TariffTableLoad {
            table_source: "rates.json".into(),
            detail: "missing field `rate`".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("rates.json"), "got: {msg}");
        assert!(msg.contains("missing field"), "got: {msg}");
    }

    #[test]
    fn ocr_timeout_display() {
        let e = ExtractionError::OcrTimeout { page: 3, secs: 30 };
        assert!(e.to_string().contains("30s"));
        assert!(e.to_string().contains("Page 3"));
    }

    #[test]
    fn no_ocr_engine_display() {
        let e = ExtractionError::NoOcrEngine { page: 1 };
        assert!(e.to_string().contains("no OCR engine"));
    }
}
