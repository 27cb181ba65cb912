//! Eager (whole-document) pipeline entry points.
//!
//! [`process`] runs the full chain: load → extract → parse → classify →
//! lookup → assemble, and returns only when the report is complete. The
//! run is cancellable by dropping the returned future — in-flight OCR and
//! LLM calls are abandoned at their next await point and no partial report
//! escapes, because the report is only constructed at the very end.
//!
//! Per-page and per-item failures degrade their row and the run continues;
//! only an unreadable document or broken run setup (missing tariff table,
//! unconfigured classifier) returns `Err`.

use crate::config::PipelineConfig;
use crate::error::TariffPipelineError;
use crate::llm::{ChatClient, OpenAiChatClient};
use crate::pipeline::extract::TextSource;
use crate::pipeline::loader::{self, DocumentSummary};
use crate::pipeline::lookup::TariffTable;
use crate::pipeline::{classify, extract, parse};
use crate::report::{assemble, RunReport};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use tracing::{debug, info};

/// Default model when the caller names none.
const DEFAULT_MODEL: &str = "gpt-4o-mini";
/// Default OpenAI-compatible endpoint.
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Process an invoice PDF from a file path.
///
/// This is the primary entry point for the library.
///
/// # Returns
/// `Ok(RunReport)` on success, even when pages or items degraded —
/// failures show up as row statuses, never as missing rows.
///
/// # Errors
/// Returns `Err(TariffPipelineError)` only for fatal conditions: the file
/// is missing or not a readable PDF, the tariff table cannot be loaded, or
/// no classifier is configured.
pub async fn process(
    path: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<RunReport, TariffPipelineError> {
    let path = path.as_ref();
    let bytes = read_input(path).await?;
    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    process_bytes(&bytes, &id, config).await
}

/// Process an invoice PDF already held in memory.
///
/// The recommended API when the PDF arrives from a network stream or
/// database rather than a file on disk.
pub async fn process_bytes(
    bytes: &[u8],
    document_id: &str,
    config: &PipelineConfig,
) -> Result<RunReport, TariffPipelineError> {
    let total_start = Instant::now();
    info!("starting run for document '{document_id}'");

    // ── Step 1: Decode the document ──────────────────────────────────────
    let document = loader::load_document(bytes, config.password.as_deref(), document_id)?;
    info!("document has {} pages", document.pages.len());

    // ── Step 2: Run setup — classifier and tariff table ──────────────────
    let classifier = resolve_classifier(config)?;
    let table = load_table(config).await?;

    // ── Step 3: Extract text per page (parallel, bounded) ────────────────
    let extract_start = Instant::now();
    let pages = extract::extract_pages(&document, config).await;
    let extract_duration_ms = extract_start.elapsed().as_millis() as u64;

    // ── Step 4: Parse line items ─────────────────────────────────────────
    let items = parse::parse_line_items(&pages, config.total_tolerance);
    info!("parsed {} line items", items.len());

    if let Some(ref progress) = config.progress {
        progress.on_run_start(items.len());
    }

    // ── Step 5: Classify items (parallel, bounded) ───────────────────────
    let classify_start = Instant::now();
    let classifications = classify::classify_items(&classifier, &items, config).await;
    let classify_duration_ms = classify_start.elapsed().as_millis() as u64;

    // ── Step 6: Resolve predictions against the tariff table ─────────────
    let matches = classifications
        .iter()
        .map(|c| match &c.code {
            Some(code) => table.lookup(code),
            None => crate::pipeline::lookup::TariffMatch::NotFound,
        })
        .collect::<Vec<_>>();

    // ── Step 7: Assemble the report ──────────────────────────────────────
    let mut report = assemble(
        document_id,
        &classifier.model_id(),
        items,
        classifications,
        matches,
    );

    report.stats.total_pages = pages.len();
    for page in &pages {
        match page.source {
            TextSource::NativeText => report.stats.native_pages += 1,
            TextSource::Ocr => report.stats.ocr_pages += 1,
            TextSource::Failed => report.stats.failed_pages += 1,
        }
    }
    report.stats.extract_duration_ms = extract_duration_ms;
    report.stats.classify_duration_ms = classify_duration_ms;
    report.stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

    if let Some(ref progress) = config.progress {
        progress.on_run_complete(report.stats.line_items, report.stats.rows_unclassified);
    }

    info!(
        "run complete: {} rows ({} ok) in {}ms",
        report.stats.line_items, report.stats.rows_ok, report.stats.total_duration_ms
    );
    Ok(report)
}

/// Summarise a PDF without classifying anything.
///
/// Needs no LLM, OCR engine, or tariff table — useful for checking what
/// the loader sees in a document before spending collaborator calls on it.
pub async fn inspect(
    path: impl AsRef<Path>,
    password: Option<&str>,
) -> Result<DocumentSummary, TariffPipelineError> {
    let path = path.as_ref();
    let bytes = read_input(path).await?;
    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let document = loader::load_document(&bytes, password, &id)?;
    Ok(document.summary())
}

// ── Internal helpers ─────────────────────────────────────────────────────

async fn read_input(path: &Path) -> Result<Vec<u8>, TariffPipelineError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(TariffPipelineError::PermissionDenied {
                path: path.to_path_buf(),
            })
        }
        Err(_) => Err(TariffPipelineError::FileNotFound {
            path: path.to_path_buf(),
        }),
    }
}

/// Resolve the LLM classifier, from most-specific to least-specific.
///
/// 1. **Pre-built client** (`config.classifier`) — the caller constructed
///    the collaborator entirely; used as-is. This is how tests inject
///    deterministic stubs and how hosts add middleware.
/// 2. **Config credentials** (`api_key` + optional `model`/`api_base`) —
///    an [`OpenAiChatClient`] is built from explicit config values. The
///    library never reads ambient environment variables itself; shims
///    resolve credentials and pass them in.
fn resolve_classifier(
    config: &PipelineConfig,
) -> Result<Arc<dyn ChatClient>, TariffPipelineError> {
    if let Some(ref classifier) = config.classifier {
        return Ok(Arc::clone(classifier));
    }

    let Some(ref api_key) = config.api_key else {
        return Err(TariffPipelineError::ClassifierNotConfigured {
            hint: "Provide an API key (CLI: --api-key-env NAME) or inject a ChatClient."
                .to_string(),
        });
    };

    let base = config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
    debug!("building OpenAI-compatible classifier: {model} via {base}");
    Ok(Arc::new(OpenAiChatClient::new(base, api_key.clone(), model)))
}

async fn load_table(config: &PipelineConfig) -> Result<TariffTable, TariffPipelineError> {
    let Some(ref source) = config.tariff_source else {
        return Err(TariffPipelineError::InvalidConfig(
            "no tariff table source configured".into(),
        ));
    };
    TariffTable::load(source, Duration::from_secs(config.table_fetch_timeout_secs)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_requires_key_or_injection() {
        let config = PipelineConfig::builder().build().unwrap();
        assert!(matches!(
            resolve_classifier(&config),
            Err(TariffPipelineError::ClassifierNotConfigured { .. })
        ));

        let config = PipelineConfig::builder().api_key("sk-test").build().unwrap();
        let client = resolve_classifier(&config).unwrap();
        assert_eq!(client.model_id(), DEFAULT_MODEL);
    }

    #[tokio::test]
    async fn table_source_is_required() {
        let config = PipelineConfig::builder().build().unwrap();
        assert!(matches!(
            load_table(&config).await,
            Err(TariffPipelineError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let config = PipelineConfig::builder().build().unwrap();
        assert!(matches!(
            process("/definitely/not/a/real/invoice.pdf", &config).await,
            Err(TariffPipelineError::FileNotFound { .. })
        ));
    }
}
