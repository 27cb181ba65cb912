//! Report assembly: join line items, classifications, and tariff matches
//! into ordered rows.
//!
//! The one invariant everything downstream relies on: **row count equals
//! line-item count**. Parse, classification, and lookup failures appear as
//! status flags on their row, never as missing rows — a human reviewing
//! the report must see every billed entry exactly once.
//!
//! Rows are emitted in document order regardless of how the parallel
//! stages' completions interleaved.

use crate::error::TariffPipelineError;
use crate::pipeline::classify::{ClassificationResult, ClassifyFailure};
use crate::pipeline::lookup::{DutyRate, MatchLevel, TariffMatch};
use crate::pipeline::parse::{LineItem, Money};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Status flag for one report row.
///
/// A row can be degraded in more than one way at once (a partial parse can
/// also come back low-confidence); the flag reports the most severe
/// condition, worst first in the order below. The underlying fields stay on
/// the row, so nothing is hidden behind the single flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowStatus {
    /// Classification failed; no code was produced.
    ClassificationUnavailable,
    /// A code was predicted but matched nothing in the table.
    TariffNotFound,
    /// The parser could not recover every field of the line item.
    PartialParse,
    /// The prediction's confidence fell below the configured threshold.
    LowConfidence,
    /// Fully parsed, classified, and resolved.
    #[serde(rename = "OK")]
    Ok,
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RowStatus::ClassificationUnavailable => "ClassificationUnavailable",
            RowStatus::TariffNotFound => "TariffNotFound",
            RowStatus::PartialParse => "PartialParse",
            RowStatus::LowConfidence => "LowConfidence",
            RowStatus::Ok => "OK",
        };
        write!(f, "{s}")
    }
}

/// One line of the final report: the join of a [`LineItem`], its
/// [`ClassificationResult`], and its [`TariffMatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    /// 0-based document-order position.
    pub ordinal: usize,
    /// 1-based page the item was parsed from.
    pub page: usize,
    pub description: String,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Money>,
    pub line_total: Option<Decimal>,
    /// Line total disagreed with `quantity × unit price`.
    pub total_mismatch: bool,
    /// The model's predicted HTS code (dotted form).
    pub predicted_code: Option<String>,
    pub confidence: Option<f32>,
    pub rationale: Option<String>,
    /// The table code that matched, possibly a prefix of the prediction.
    pub matched_code: Option<String>,
    pub match_level: Option<MatchLevel>,
    pub duty_rate: Option<DutyRate>,
    pub duty_unit: Option<String>,
    pub tariff_description: Option<String>,
    pub status: RowStatus,
    /// Failure diagnostics for `ClassificationUnavailable` rows.
    pub detail: Option<String>,
}

/// Aggregate counts and timings for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_pages: usize,
    pub native_pages: usize,
    pub ocr_pages: usize,
    pub failed_pages: usize,
    pub line_items: usize,
    pub rows_ok: usize,
    pub rows_partial: usize,
    pub rows_low_confidence: usize,
    pub rows_unclassified: usize,
    pub rows_unmatched: usize,
    pub extract_duration_ms: u64,
    pub classify_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// The assembled report for one document.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub document_id: String,
    /// Model identifier the classifications came from.
    pub model_id: String,
    /// The prompt-contract version in force for this run.
    pub prompt_version: String,
    pub rows: Vec<ReportRow>,
    pub stats: RunStats,
}

/// Join the three per-item sequences into ordered report rows.
///
/// All three inputs are indexed by item ordinal and must be equally long;
/// the pipeline guarantees this by construction (every item yields exactly
/// one classification and one lookup outcome).
pub fn assemble(
    document_id: &str,
    model_id: &str,
    items: Vec<LineItem>,
    classifications: Vec<ClassificationResult>,
    matches: Vec<TariffMatch>,
) -> RunReport {
    debug_assert_eq!(items.len(), classifications.len());
    debug_assert_eq!(items.len(), matches.len());

    let mut rows: Vec<ReportRow> = items
        .into_iter()
        .zip(classifications)
        .zip(matches)
        .map(|((item, classification), tariff)| build_row(item, classification, tariff))
        .collect();
    rows.sort_by_key(|r| r.ordinal);

    let mut stats = RunStats {
        line_items: rows.len(),
        ..RunStats::default()
    };
    for row in &rows {
        match row.status {
            RowStatus::Ok => stats.rows_ok += 1,
            RowStatus::PartialParse => stats.rows_partial += 1,
            RowStatus::LowConfidence => stats.rows_low_confidence += 1,
            RowStatus::ClassificationUnavailable => stats.rows_unclassified += 1,
            RowStatus::TariffNotFound => stats.rows_unmatched += 1,
        }
    }

    RunReport {
        document_id: document_id.to_string(),
        model_id: model_id.to_string(),
        prompt_version: crate::prompts::PROMPT_VERSION.to_string(),
        rows,
        stats,
    }
}

fn build_row(
    item: LineItem,
    classification: ClassificationResult,
    tariff: TariffMatch,
) -> ReportRow {
    debug_assert_eq!(item.ordinal, classification.item_ordinal);

    let (matched_code, match_level, duty_rate, duty_unit, tariff_description) = match tariff {
        TariffMatch::Found {
            entry,
            matched_code,
            level,
        } => (
            Some(matched_code),
            Some(level),
            Some(entry.rate),
            entry.unit,
            Some(entry.description),
        ),
        TariffMatch::NotFound => (None, None, None, None, None),
    };

    let status = row_status(&item, &classification, matched_code.is_some());
    let detail = classification.failure.as_ref().map(classify_detail);

    ReportRow {
        ordinal: item.ordinal,
        page: item.page_index + 1,
        description: item.description,
        quantity: item.quantity,
        unit_price: item.unit_price,
        line_total: item.line_total,
        total_mismatch: item.total_mismatch,
        predicted_code: classification.code.map(|c| c.as_str().to_string()),
        confidence: classification.confidence,
        rationale: classification.rationale,
        matched_code,
        match_level,
        duty_rate,
        duty_unit,
        tariff_description,
        status,
        detail,
    }
}

/// Most-severe-wins status selection.
fn row_status(
    item: &LineItem,
    classification: &ClassificationResult,
    matched: bool,
) -> RowStatus {
    if classification.failure.is_some() {
        RowStatus::ClassificationUnavailable
    } else if !matched {
        RowStatus::TariffNotFound
    } else if item.partial {
        RowStatus::PartialParse
    } else if classification.low_confidence {
        RowStatus::LowConfidence
    } else {
        RowStatus::Ok
    }
}

fn classify_detail(failure: &ClassifyFailure) -> String {
    failure.to_string()
}

impl RunReport {
    /// Serialise the rows as CSV.
    pub fn to_csv(&self) -> Result<String, TariffPipelineError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record([
                "line",
                "page",
                "description",
                "quantity",
                "unit_price",
                "line_total",
                "total_mismatch",
                "predicted_code",
                "confidence",
                "matched_code",
                "match_level",
                "duty_rate",
                "duty_unit",
                "status",
            ])
            .map_err(|e| TariffPipelineError::Internal(format!("csv: {e}")))?;

        for row in &self.rows {
            let opt = |v: Option<String>| v.unwrap_or_default();
            writer
                .write_record([
                    (row.ordinal + 1).to_string(),
                    row.page.to_string(),
                    row.description.clone(),
                    opt(row.quantity.map(|q| q.to_string())),
                    opt(row.unit_price.as_ref().map(|p| p.to_string())),
                    opt(row.line_total.map(|t| t.to_string())),
                    row.total_mismatch.to_string(),
                    opt(row.predicted_code.clone()),
                    opt(row.confidence.map(|c| format!("{c:.2}"))),
                    opt(row.matched_code.clone()),
                    opt(row.match_level.map(|l| l.to_string())),
                    opt(row.duty_rate.as_ref().map(|r| r.to_string())),
                    opt(row.duty_unit.clone()),
                    row.status.to_string(),
                ])
                .map_err(|e| TariffPipelineError::Internal(format!("csv: {e}")))?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| TariffPipelineError::Internal(format!("csv: {e}")))?;
        String::from_utf8(bytes).map_err(|e| TariffPipelineError::Internal(format!("csv: {e}")))
    }

    /// Write the CSV export to a file.
    ///
    /// Uses atomic write (temp file + rename) to prevent partial files.
    pub async fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), TariffPipelineError> {
        let path = path.as_ref();
        let csv = self.to_csv()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    TariffPipelineError::OutputWriteFailed {
                        path: path.to_path_buf(),
                        source: e,
                    }
                })?;
            }
        }

        let tmp_path = path.with_extension("csv.tmp");
        tokio::fs::write(&tmp_path, &csv)
            .await
            .map_err(|e| TariffPipelineError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| TariffPipelineError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })
    }
}
