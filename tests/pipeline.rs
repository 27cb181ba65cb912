//! End-to-end pipeline tests with deterministic collaborator stubs.
//!
//! No live OCR engine or LLM endpoint is involved: the `ChatClient` seam is
//! stubbed with scripted, delayed, sleeping, and malformed implementations
//! so every property here is reproducible offline. Synthetic PDFs are built
//! in memory with lopdf for the loader-level checks.

use async_trait::async_trait;
use invoice2tariff::{
    pipeline::classify::classify_items,
    pipeline::parse::parse_line_items,
    process_bytes, ChatClient, ChatError, PageText, PipelineConfig, RowStatus, TariffSource,
    TariffTable, TextSource,
};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Object, Stream};
use rust_decimal::Decimal;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Duration;

// ── Stub collaborators ───────────────────────────────────────────────────────

/// Maps description keywords to fixed (code, confidence) answers.
struct ScriptedClassifier {
    script: Vec<(&'static str, &'static str, f32)>,
}

impl ScriptedClassifier {
    fn answer_for(&self, user: &str) -> String {
        for (needle, code, confidence) in &self.script {
            if user.contains(needle) {
                return format!(
                    r#"{{"code": "{code}", "confidence": {confidence}, "rationale": "scripted"}}"#
                );
            }
        }
        r#"{"code": "9999.99.99", "confidence": 0.9, "rationale": "default"}"#.to_string()
    }
}

#[async_trait]
impl ChatClient for ScriptedClassifier {
    async fn complete(&self, _system: &str, user: &str) -> Result<String, ChatError> {
        Ok(self.answer_for(user))
    }

    fn model_id(&self) -> String {
        "scripted-stub".to_string()
    }
}

/// Like `ScriptedClassifier`, but responses arrive after per-item delays —
/// later items finish first, exercising the order-restoration guarantee.
struct DelayedClassifier {
    inner: ScriptedClassifier,
    delays_ms: Vec<(&'static str, u64)>,
}

#[async_trait]
impl ChatClient for DelayedClassifier {
    async fn complete(&self, _system: &str, user: &str) -> Result<String, ChatError> {
        for (needle, ms) in &self.delays_ms {
            if user.contains(needle) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                break;
            }
        }
        Ok(self.inner.answer_for(user))
    }

    fn model_id(&self) -> String {
        "delayed-stub".to_string()
    }
}

/// Never answers within any reasonable timeout.
struct SleepyClassifier;

#[async_trait]
impl ChatClient for SleepyClassifier {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, ChatError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unreachable!("the pipeline timeout must fire first")
    }

    fn model_id(&self) -> String {
        "sleepy-stub".to_string()
    }
}

/// Answers instantly with schema-violating garbage, counting calls.
struct MalformedClassifier {
    calls: AtomicU32,
}

#[async_trait]
impl ChatClient for MalformedClassifier {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, ChatError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("I believe the answer is probably chapter 84 somewhere".to_string())
    }

    fn model_id(&self) -> String {
        "malformed-stub".to_string()
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn widget_page() -> PageText {
    PageText {
        page_index: 0,
        text: "ACME SUPPLY CO\n\
               Invoice 2024-117\n\
               Description  Qty  Unit Price  Amount\n\
               Widget A  10  $5.00  $50.00\n\
               Subtotal  $50.00\n"
            .to_string(),
        source: TextSource::NativeText,
        error: None,
    }
}

fn three_item_page() -> PageText {
    PageText {
        page_index: 0,
        text: "Description  Qty  Unit Price  Amount\n\
               alpha unit  1  $1.00  $1.00\n\
               beta unit  2  $2.00  $4.00\n\
               gamma unit  3  $3.00  $9.00\n\
               Total  $14.00\n"
            .to_string(),
        source: TextSource::NativeText,
        error: None,
    }
}

fn scripted() -> Arc<dyn ChatClient> {
    Arc::new(ScriptedClassifier {
        script: vec![
            ("Widget A", "1234.56.78", 0.92),
            ("alpha unit", "1111.11", 0.9),
            ("beta unit", "2222.22", 0.9),
            ("gamma unit", "3333.33", 0.9),
        ],
    })
}

fn tariff_table() -> TariffTable {
    TariffTable::from_json_str(
        r#"[
            {"code": "1234.56", "description": "Widgets and parts thereof", "rate": "5%", "unit": "No."},
            {"code": "1111.11", "description": "Alpha goods", "rate": "Free"},
            {"code": "2222.22", "description": "Beta goods", "rate": "2%"},
            {"code": "3333.33", "description": "Gamma goods", "rate": "$0.10/kg"}
        ]"#,
    )
    .unwrap()
}

fn tolerance() -> Decimal {
    Decimal::new(1, 2)
}

/// Run parse → classify → lookup → assemble over prepared page text.
async fn run_stages(
    pages: &[PageText],
    client: &Arc<dyn ChatClient>,
    config: &PipelineConfig,
) -> invoice2tariff::RunReport {
    let items = parse_line_items(pages, config.total_tolerance);
    let classifications = classify_items(client, &items, config).await;
    let table = tariff_table();
    let matches = classifications
        .iter()
        .map(|c| match &c.code {
            Some(code) => table.lookup(code),
            None => invoice2tariff::TariffMatch::NotFound,
        })
        .collect();
    invoice2tariff::report::assemble("test-doc", &client.model_id(), items, classifications, matches)
}

// ── Loader properties (synthetic PDFs, no collaborators) ─────────────────────

/// Build a minimal PDF with one text line per page.
fn make_pdf(page_texts: &[&str]) -> Vec<u8> {
    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in page_texts {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![50.into(), 750.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("encode content"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("serialise PDF");
    bytes
}

#[tokio::test]
async fn loader_preserves_page_count_and_order() {
    let bytes = make_pdf(&["first page", "second page", "third page"]);
    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), &bytes).unwrap();

    let summary = invoice2tariff::inspect(tmp.path(), None).await.unwrap();
    assert_eq!(summary.page_count, 3);
    let indices: Vec<usize> = summary.pages.iter().map(|p| p.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[tokio::test]
async fn full_run_over_synthetic_pdf() {
    let bytes = make_pdf(&["Invoice with no recognisable items"]);

    let mut table_file = tempfile::NamedTempFile::new().unwrap();
    write!(
        table_file,
        r#"[{{"code": "1234.56", "description": "Widgets", "rate": "5%"}}]"#
    )
    .unwrap();

    let config = PipelineConfig::builder()
        .tariff_source(TariffSource::Path(table_file.path().to_path_buf()))
        .classifier(scripted())
        .build()
        .unwrap();

    let report = process_bytes(&bytes, "synthetic", &config).await.unwrap();
    assert_eq!(report.stats.total_pages, 1);
    assert_eq!(report.rows.len(), report.stats.line_items);
    assert_eq!(report.model_id, "scripted-stub");
}

// ── End-to-end stage properties (stub collaborators) ─────────────────────────

#[tokio::test]
async fn widget_invoice_yields_one_ok_row() {
    let config = PipelineConfig::builder().build().unwrap();
    let client = scripted();
    let report = run_stages(&[widget_page()], &client, &config).await;

    assert_eq!(report.rows.len(), 1);
    let row = &report.rows[0];
    assert_eq!(row.description, "Widget A");
    assert_eq!(row.quantity, Some(Decimal::from(10)));
    assert_eq!(
        row.unit_price.as_ref().unwrap().amount,
        Decimal::from_str("5.00").unwrap()
    );
    assert_eq!(row.line_total, Some(Decimal::from_str("50.00").unwrap()));
    assert_eq!(row.predicted_code.as_deref(), Some("1234.56.78"));
    assert_eq!(row.status, RowStatus::Ok);
}

#[tokio::test]
async fn prefix_fallback_records_match_level() {
    let config = PipelineConfig::builder().build().unwrap();
    let client = scripted();
    let report = run_stages(&[widget_page()], &client, &config).await;

    // The table lists 1234.56; the model predicted 1234.56.78.
    let row = &report.rows[0];
    assert_eq!(row.matched_code.as_deref(), Some("1234.56"));
    assert_eq!(
        row.match_level,
        Some(invoice2tariff::MatchLevel::Prefix(6))
    );
    assert_eq!(
        row.duty_rate,
        Some(invoice2tariff::DutyRate::AdValorem(Decimal::from(5)))
    );
}

#[tokio::test]
async fn timeouts_degrade_every_row_but_drop_none() {
    let baseline_config = PipelineConfig::builder().build().unwrap();
    let baseline = run_stages(&[three_item_page()], &scripted(), &baseline_config).await;
    assert_eq!(baseline.rows.len(), 3);

    let config = PipelineConfig::builder()
        .llm_timeout_secs(1)
        .max_retries(0)
        .build()
        .unwrap();
    let client: Arc<dyn ChatClient> = Arc::new(SleepyClassifier);
    let report = run_stages(&[three_item_page()], &client, &config).await;

    assert_eq!(report.rows.len(), baseline.rows.len());
    for row in &report.rows {
        assert_eq!(row.status, RowStatus::ClassificationUnavailable);
        assert!(row.predicted_code.is_none());
        assert!(row.detail.as_deref().unwrap_or("").contains("timed out"));
    }
}

#[tokio::test]
async fn parallel_completion_order_does_not_leak_into_rows() {
    // First item answers slowest, last answers fastest.
    let client: Arc<dyn ChatClient> = Arc::new(DelayedClassifier {
        inner: ScriptedClassifier {
            script: vec![
                ("alpha unit", "1111.11", 0.9),
                ("beta unit", "2222.22", 0.9),
                ("gamma unit", "3333.33", 0.9),
            ],
        },
        delays_ms: vec![("alpha unit", 300), ("beta unit", 150), ("gamma unit", 0)],
    });
    let config = PipelineConfig::builder()
        .classify_concurrency(3)
        .build()
        .unwrap();
    let report = run_stages(&[three_item_page()], &client, &config).await;

    let codes: Vec<&str> = report
        .rows
        .iter()
        .map(|r| r.predicted_code.as_deref().unwrap())
        .collect();
    assert_eq!(codes, vec!["1111.11", "2222.22", "3333.33"]);
    let ordinals: Vec<usize> = report.rows.iter().map(|r| r.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
}

#[tokio::test]
async fn low_confidence_flags_but_keeps_the_code() {
    let client: Arc<dyn ChatClient> = Arc::new(ScriptedClassifier {
        script: vec![("Widget A", "1234.56.78", 0.3)],
    });
    let config = PipelineConfig::builder()
        .confidence_threshold(0.5)
        .build()
        .unwrap();
    let report = run_stages(&[widget_page()], &client, &config).await;

    let row = &report.rows[0];
    assert_eq!(row.status, RowStatus::LowConfidence);
    assert_eq!(row.predicted_code.as_deref(), Some("1234.56.78"));
    assert_eq!(row.confidence, Some(0.3));
}

#[tokio::test]
async fn malformed_responses_are_not_retried() {
    let stub = Arc::new(MalformedClassifier {
        calls: AtomicU32::new(0),
    });
    let client: Arc<dyn ChatClient> = stub.clone();
    let config = PipelineConfig::builder().max_retries(3).build().unwrap();
    let report = run_stages(&[widget_page()], &client, &config).await;

    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0].status, RowStatus::ClassificationUnavailable);
    assert!(report.rows[0]
        .detail
        .as_deref()
        .unwrap_or("")
        .contains("malformed"));
    // One item, one call: a contract violation must not burn the retry budget.
    assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn identical_inputs_yield_identical_reports() {
    let config = PipelineConfig::builder()
        .classify_concurrency(3)
        .build()
        .unwrap();
    let client = scripted();

    let first = run_stages(&[three_item_page()], &client, &config).await;
    let second = run_stages(&[three_item_page()], &client, &config).await;

    let a = serde_json::to_string(&first.rows).unwrap();
    let b = serde_json::to_string(&second.rows).unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn unknown_code_is_reported_not_dropped() {
    let client: Arc<dyn ChatClient> = Arc::new(ScriptedClassifier {
        script: vec![("Widget A", "7777.77.77", 0.9)],
    });
    let config = PipelineConfig::builder().build().unwrap();
    let report = run_stages(&[widget_page()], &client, &config).await;

    let row = &report.rows[0];
    assert_eq!(row.status, RowStatus::TariffNotFound);
    assert_eq!(row.predicted_code.as_deref(), Some("7777.77.77"));
    assert!(row.matched_code.is_none());
    assert!(row.duty_rate.is_none());
}
