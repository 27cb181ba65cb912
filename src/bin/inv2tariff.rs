//! CLI binary for invoice2tariff.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use invoice2tariff::{
    inspect, process, PipelineConfig, PipelineProgress, Progress, RowStatus, RunReport,
    TariffSource, TesseractOcr,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress observer using indicatif ────────────────────────────────────

/// Terminal progress: a live bar over classification calls, which complete
/// out of order under concurrency.
struct CliProgress {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} items  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        bar.set_style(style);
        bar.set_prefix("Classifying");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }
}

impl PipelineProgress for CliProgress {
    fn on_run_start(&self, total_items: usize) {
        self.bar.set_length(total_items as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Classifying {total_items} line items…"))
        ));
    }

    fn on_item_done(&self, ordinal: usize, total_items: usize, failed: bool) {
        if failed {
            self.errors.fetch_add(1, Ordering::SeqCst);
            self.bar.println(format!(
                "  {} item {:>3}/{:<3}  {}",
                red("✗"),
                ordinal + 1,
                total_items,
                red("classification unavailable"),
            ));
        }
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total_items: usize, failed_items: usize) {
        self.bar.finish_and_clear();
        if failed_items == 0 {
            eprintln!(
                "{} {} items classified",
                green("✔"),
                bold(&total_items.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} items classified  ({} failed)",
                yellow("⚠"),
                bold(&(total_items - failed_items).to_string()),
                total_items,
                red(&failed_items.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Classify an invoice against a local tariff table (report to stdout)
  inv2tariff invoice.pdf --tariff-table rates.json

  # CSV export
  inv2tariff invoice.pdf --tariff-table rates.csv --format csv -o report.csv

  # Remote tariff table, specific model
  inv2tariff invoice.pdf --tariff-table https://example.com/rates.json \
      --model gpt-4o --api-key-env OPENAI_API_KEY

  # Local OpenAI-compatible endpoint (Ollama, vLLM, …)
  inv2tariff invoice.pdf --tariff-table rates.json \
      --api-base http://localhost:11434/v1 --model llama3.1

  # Scanned invoice with a non-default tesseract
  inv2tariff scan.pdf --tariff-table rates.json --tesseract-path /opt/bin/tesseract

  # Inspect what the loader sees (no API key needed)
  inv2tariff --inspect-only invoice.pdf

TARIFF TABLE FORMAT:
  JSON:  [{"code": "8471.30", "description": "...", "rate": "5%", "unit": "No."}, …]
  CSV:   code,description,rate,unit
  Rates: "5%", "Free", or "$1.20/kg". Remote URLs are fetched once per run.

ROW STATUSES:
  OK                          fully parsed, classified, and resolved
  PartialParse                row kept with missing quantity/price fields
  LowConfidence               prediction kept, confidence below threshold
  ClassificationUnavailable   LLM failed after retries; code is empty
  TariffNotFound              predicted code matched no table entry

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY   Default API key source (override with --api-key-env)
  RUST_LOG         Tracing filter, e.g. RUST_LOG=invoice2tariff=debug
"#;

/// Classify PDF invoice line items against the Harmonized Tariff Schedule.
#[derive(Parser, Debug)]
#[command(
    name = "inv2tariff",
    version,
    about = "Classify PDF invoice line items against the Harmonized Tariff Schedule",
    long_about = "Extract line items from a PDF invoice (native text or OCR), predict an HTS \
code for each via an LLM, resolve duty rates from a reference tariff table, and emit a \
row-per-item report with explicit statuses for every degraded row.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF invoice to process.
    input: PathBuf,

    /// Tariff reference table: local JSON/CSV file or HTTP(S) URL.
    #[arg(long, env = "INV2TARIFF_TABLE")]
    tariff_table: Option<String>,

    /// Write the report to this file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Report format.
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// LLM model ID for the OpenAI-compatible endpoint.
    #[arg(long, env = "INV2TARIFF_MODEL")]
    model: Option<String>,

    /// OpenAI-compatible API base URL.
    #[arg(long, env = "INV2TARIFF_API_BASE")]
    api_base: Option<String>,

    /// Name of the environment variable holding the API key.
    #[arg(long, default_value = "OPENAI_API_KEY")]
    api_key_env: String,

    /// PDF user password for encrypted documents.
    #[arg(long)]
    password: Option<String>,

    /// Flag predictions below this confidence as LowConfidence.
    #[arg(long, default_value_t = 0.5)]
    confidence_threshold: f32,

    /// Concurrent LLM classification calls.
    #[arg(short, long, default_value_t = 8)]
    concurrency: usize,

    /// Concurrent per-page OCR invocations.
    #[arg(long, default_value_t = 4)]
    ocr_concurrency: usize,

    /// Retries per collaborator call on transient failure.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, default_value_t = 60)]
    llm_timeout: u64,

    /// Per-page OCR timeout in seconds.
    #[arg(long, default_value_t = 120)]
    ocr_timeout: u64,

    /// Path to the tesseract binary.
    #[arg(long, default_value = "tesseract")]
    tesseract_path: PathBuf,

    /// OCR recognition language (tesseract -l).
    #[arg(long, default_value = "eng")]
    ocr_lang: String,

    /// Disable OCR entirely; image-only pages degrade to empty text.
    #[arg(long)]
    no_ocr: bool,

    /// Print the loader's view of the document and exit. No API key needed.
    #[arg(long)]
    inspect_only: bool,

    /// Disable the progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors and the report.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    /// Human-readable table.
    Table,
    /// CSV, one row per line item.
    Csv,
    /// Full report as JSON.
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides the feedback that matters.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.inspect_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let summary = inspect(&cli.input, cli.password.as_deref())
            .await
            .context("Failed to inspect PDF")?;
        println!("Document:  {}", summary.id);
        println!("Pages:     {}", summary.page_count);
        for page in &summary.pages {
            println!(
                "  page {:>3}: {:>6} native chars, {} embedded image(s)",
                page.index + 1,
                page.native_chars,
                page.image_count
            );
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let config = build_config(&cli, show_progress)?;

    // ── Run the pipeline ─────────────────────────────────────────────────
    let report = process(&cli.input, &config)
        .await
        .context("Processing failed")?;

    // ── Emit the report ──────────────────────────────────────────────────
    let rendered = match cli.format {
        OutputFormat::Table => render_table(&report),
        OutputFormat::Csv => report.to_csv().context("CSV export failed")?,
        OutputFormat::Json => {
            serde_json::to_string_pretty(&report).context("JSON export failed")? + "\n"
        }
    };

    if let Some(ref path) = cli.output {
        tokio::fs::write(path, rendered.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !cli.quiet {
            eprintln!(
                "{} {} rows  →  {}",
                green("✔"),
                report.stats.line_items,
                bold(&path.display().to_string())
            );
        }
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(rendered.as_bytes())
            .context("Failed to write to stdout")?;
    }

    if !cli.quiet {
        print_summary(&report);
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, show_progress: bool) -> Result<PipelineConfig> {
    let table = cli
        .tariff_table
        .as_deref()
        .context("--tariff-table is required (a JSON/CSV file or URL)")?;

    let mut builder = PipelineConfig::builder()
        .tariff_source(TariffSource::from_arg(table))
        .confidence_threshold(cli.confidence_threshold)
        .classify_concurrency(cli.concurrency)
        .ocr_concurrency(cli.ocr_concurrency)
        .max_retries(cli.max_retries)
        .llm_timeout_secs(cli.llm_timeout)
        .ocr_timeout_secs(cli.ocr_timeout);

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref base) = cli.api_base {
        builder = builder.api_base(base.clone());
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd.clone());
    }
    if let Ok(key) = std::env::var(&cli.api_key_env) {
        if !key.is_empty() {
            builder = builder.api_key(key);
        }
    }

    if !cli.no_ocr {
        let ocr = TesseractOcr::new()
            .with_binary(&cli.tesseract_path)
            .with_language(&cli.ocr_lang);
        builder = builder.ocr(Arc::new(ocr));
    }

    if show_progress {
        builder = builder.progress(CliProgress::new() as Progress);
    }

    builder.build().context("Invalid configuration")
}

/// Render the human-readable table.
fn render_table(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<4} {:<36} {:>8} {:>10} {:>12} {:<12} {:>6} {:>9} {}\n",
        "#", "Description", "Qty", "Unit", "Total", "HTS code", "Conf", "Duty", "Status"
    ));
    out.push_str(&format!("{}\n", "-".repeat(108)));

    for row in &report.rows {
        let desc: String = if row.description.chars().count() > 36 {
            let truncated: String = row.description.chars().take(35).collect();
            format!("{truncated}…")
        } else {
            row.description.clone()
        };
        let opt = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
        let mismatch = if row.total_mismatch { " !" } else { "" };
        out.push_str(&format!(
            "{:<4} {:<36} {:>8} {:>10} {:>12} {:<12} {:>6} {:>9} {}{}\n",
            row.ordinal + 1,
            desc,
            opt(row.quantity.map(|q| q.to_string())),
            opt(row.unit_price.as_ref().map(|p| p.to_string())),
            opt(row.line_total.map(|t| t.to_string())),
            opt(row.predicted_code.clone()),
            opt(row.confidence.map(|c| format!("{c:.2}"))),
            opt(row.duty_rate.as_ref().map(|r| r.to_string())),
            row.status,
            mismatch,
        ));
    }
    out
}

/// One-line run summary on stderr, keeping stdout clean for the report.
fn print_summary(report: &RunReport) {
    let s = &report.stats;
    let flagged = s.rows_partial + s.rows_low_confidence + s.rows_unclassified + s.rows_unmatched;
    let mark = if s.rows_unclassified > 0 {
        red("✘")
    } else if flagged > 0 {
        yellow("⚠")
    } else {
        green("✔")
    };
    eprintln!(
        "{mark}  {} rows ({} ok, {} flagged)  {} pages ({} native / {} ocr / {} failed)  {}ms",
        s.line_items,
        s.rows_ok,
        flagged,
        s.total_pages,
        s.native_pages,
        s.ocr_pages,
        s.failed_pages,
        s.total_duration_ms,
    );
    eprintln!(
        "   {}",
        dim(&format!(
            "model {}  prompt {}  extract {}ms  classify {}ms",
            report.model_id, report.prompt_version, s.extract_duration_ms, s.classify_duration_ms
        ))
    );
    for status in [
        RowStatus::ClassificationUnavailable,
        RowStatus::TariffNotFound,
        RowStatus::PartialParse,
        RowStatus::LowConfidence,
    ] {
        let count = report.rows.iter().filter(|r| r.status == status).count();
        if count > 0 {
            eprintln!("   {}", dim(&format!("{count} × {status}")));
        }
    }
}
