//! # invoice2tariff
//!
//! Classify PDF invoice line items against the Harmonized Tariff Schedule
//! (HTS) using an LLM, and resolve duty rates from a reference table.
//!
//! ## Why this crate?
//!
//! Customs brokers receive invoices as PDFs — digital when lucky, scanned
//! when not — and must map every billed item to an HTS code to determine
//! duty. Doing that by hand is slow and error-prone. This crate extracts
//! the line items (native text first, OCR fallback), asks a language model
//! for the most likely code under a fixed, versioned prompt contract, and
//! reconciles each prediction against an authoritative tariff table, with
//! every uncertainty surfaced as an explicit row status instead of a
//! silent omission.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Load      decode pages via lopdf + pdf-extract
//!  ├─ 2. Extract   native text, or OCR below the density threshold (∥)
//!  ├─ 3. Parse     heuristic line-item segmentation, Decimal amounts
//!  ├─ 4. Classify  concurrent LLM calls with retry/backoff and
//!  │               strict JSON-schema validation (∥)
//!  ├─ 5. Lookup    exact-then-prefix match against the tariff table
//!  └─ 6. Report    ordered rows, one per line item, no silent drops
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use invoice2tariff::{process, PipelineConfig, TariffSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .tariff_source(TariffSource::from_arg("rates.json"))
//!         .api_key(std::env::var("OPENAI_API_KEY")?)
//!         .build()?;
//!     let report = process("invoice.pdf", &config).await?;
//!     for row in &report.rows {
//!         println!(
//!             "{}  {}  {}",
//!             row.description,
//!             row.predicted_code.as_deref().unwrap_or("-"),
//!             row.status
//!         );
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Failure model
//!
//! | Failure | Scope | Effect |
//! |---------|-------|--------|
//! | Unreadable document | run | `Err` from `process*` |
//! | Extraction failure | page | page degrades to empty text |
//! | Unparseable row | item | row kept, `PartialParse` |
//! | LLM failure / timeout | item | row kept, `ClassificationUnavailable` |
//! | Unmatched code | item | row kept, `TariffNotFound` |
//!
//! The report always contains exactly one row per parsed line item.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `inv2tariff` binary (clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod llm;
pub mod ocr;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod prompts;
pub mod report;
pub mod retry;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder, TariffSource};
pub use error::{ExtractionError, TariffPipelineError};
pub use llm::{ChatClient, ChatError, OpenAiChatClient};
pub use ocr::{OcrEngine, OcrError, TesseractOcr};
pub use pipeline::classify::{ClassificationResult, ClassifyFailure, HtsCode};
pub use pipeline::extract::{PageText, TextSource};
pub use pipeline::loader::{Document, DocumentSummary, Page};
pub use pipeline::lookup::{DutyRate, MatchLevel, TariffEntry, TariffMatch, TariffTable};
pub use pipeline::parse::{LineItem, Money};
pub use process::{inspect, process, process_bytes};
pub use progress::{NoopProgress, PipelineProgress, Progress};
pub use report::{ReportRow, RowStatus, RunReport, RunStats};
pub use retry::RetryPolicy;
