//! Heuristic line-item parsing of extracted invoice text.
//!
//! Invoices have no fixed layout, so this stage is a best-effort state walk
//! over each page's lines:
//!
//! * a line-items table starts at a header row carrying description and
//!   quantity/price column markers;
//! * it ends at a subtotal/total/footer marker or at the end of the page;
//! * a line inside the table with numeric cells becomes a row; a line
//!   without any, immediately following a row, is a wrapped description and
//!   is merged into that row.
//!
//! Rows that cannot be fully parsed keep whatever fields they have and are
//! marked partial — invoices are input from the outside world and partial
//! information must not vanish silently. Likewise a row whose total fails
//! the `quantity × unit price` check is flagged, not dropped.
//!
//! All amounts are normalised (currency symbols, thousands separators,
//! decimal commas) before parsing into [`Decimal`]; floats never touch
//! money.

use crate::pipeline::extract::PageText;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// A currency-tagged amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    /// The symbol or code seen next to the amount (`$`, `€`, `USD`, …).
    /// No conversion is attempted.
    pub currency: Option<String>,
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.currency.as_deref() {
            Some(sym) if sym.chars().count() == 1 => write!(f, "{}{}", sym, self.amount),
            Some(code) => write!(f, "{} {}", self.amount, code),
            None => write!(f, "{}", self.amount),
        }
    }
}

/// One billed entry recovered from the invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// 0-based position in document order; stable across the pipeline.
    pub ordinal: usize,
    /// 0-based page the row started on.
    pub page_index: usize,
    pub description: String,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Money>,
    pub line_total: Option<Decimal>,
    /// Set when quantity, unit price, or total could not be recovered.
    pub partial: bool,
    /// Set when `line_total` disagrees with `quantity × unit_price` beyond
    /// the configured tolerance.
    pub total_mismatch: bool,
}

// ── Table-boundary and token patterns ────────────────────────────────────

static HEADER_DESC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(description|item|product|goods|details?)\b").unwrap());

static HEADER_NUMERIC_COL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(qty|quantity|units?|pcs|price|rate|amount|total)\b").unwrap());

static FOOTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(sub\s*-?\s*total|total\b|grand\s+total|amount\s+due|balance(\s+due)?|vat\b|sales\s+tax\b|tax\b|shipping|freight|notes?\b|terms\b|thank\s+you|payment)",
    )
    .unwrap()
});

/// Hard cell separators: tabs, pipes, comma-space, or 2+ spaces (aligned
/// columns survive text extraction as runs of spaces). A bare comma is NOT
/// a separator — it would split decimal commas.
static CELL_SEP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\t|\||,\s+|\s{2,}").unwrap());

/// A cell that is entirely one amount, optionally currency-tagged.
static CELL_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<pre>[$€£])?\s*(?P<num>\d+(?:[., \u{00a0}]\d{3})*(?:[.,]\d{1,4})?)\s*(?P<post>USD|EUR|GBP|[$€£])?$",
    )
    .unwrap()
});

/// An amount found inside a cell (used only to decide header vs data rows).
static ANY_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d").unwrap());

// ── Public entry point ───────────────────────────────────────────────────

/// Parse every page's text into ordered line items.
///
/// `tolerance` is the relative slack for the total-consistency check.
pub fn parse_line_items(pages: &[PageText], tolerance: Decimal) -> Vec<LineItem> {
    let mut items = Vec::new();

    for page in pages {
        parse_page(page, tolerance, &mut items);
    }

    debug!("parsed {} line items across {} pages", items.len(), pages.len());
    items
}

/// Walk one page's lines with the header/footer state machine.
fn parse_page(page: &PageText, tolerance: Decimal, items: &mut Vec<LineItem>) {
    let mut in_table = false;
    // Index into `items` of the row a continuation line may extend.
    let mut open_row: Option<usize> = None;

    for raw_line in page.text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            open_row = None;
            continue;
        }

        if !in_table {
            if is_header_row(line) {
                in_table = true;
            }
            continue;
        }

        if FOOTER.is_match(line) {
            // Subtotal block reached; the items table is over for this page.
            break;
        }

        let cells = split_cells(line);
        let amounts = amount_cells(&cells);

        if amounts.is_empty() {
            // Wrapped description: only merges into the row directly above.
            if let Some(idx) = open_row {
                let item = &mut items[idx];
                if !item.description.is_empty() {
                    item.description.push(' ');
                }
                item.description.push_str(line);
            }
            continue;
        }

        let ordinal = items.len();
        items.push(build_item(ordinal, page.page_index, &cells, amounts, tolerance));
        open_row = Some(ordinal);
    }
}

/// A header row names a description column and at least one numeric column.
fn is_header_row(line: &str) -> bool {
    HEADER_DESC.is_match(line) && HEADER_NUMERIC_COL.is_match(line) && !ANY_DIGIT.is_match(line)
}

fn split_cells(line: &str) -> Vec<&str> {
    CELL_SEP
        .split(line)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect()
}

/// A numeric cell, positioned within its row.
struct AmountCell {
    cell_index: usize,
    value: Decimal,
    currency: Option<String>,
}

fn amount_cells(cells: &[&str]) -> Vec<AmountCell> {
    cells
        .iter()
        .enumerate()
        .filter_map(|(i, cell)| {
            let caps = CELL_AMOUNT.captures(cell.trim())?;
            let value = normalize_amount(caps.name("num")?.as_str())?;
            let currency = caps
                .name("pre")
                .or_else(|| caps.name("post"))
                .map(|m| m.as_str().to_string());
            Some(AmountCell {
                cell_index: i,
                value,
                currency,
            })
        })
        .collect()
}

/// Assemble a [`LineItem`] from a row's cells and its numeric tokens.
fn build_item(
    ordinal: usize,
    page_index: usize,
    cells: &[&str],
    mut amounts: Vec<AmountCell>,
    tolerance: Decimal,
) -> LineItem {
    // A leading bare integer followed by text is a row number, not a
    // quantity: "1  Widget A  10  $5.00  $50.00".
    let mut desc_start = 0;
    if amounts.len() >= 4
        && amounts[0].cell_index == 0
        && amounts[0].currency.is_none()
        && amounts[0].value.fract().is_zero()
        && amounts[1].cell_index > 1
    {
        amounts.remove(0);
        desc_start = 1;
    }

    let first_amount_cell = amounts.first().map(|a| a.cell_index).unwrap_or(cells.len());
    let numeric_cells: Vec<usize> = amounts.iter().map(|a| a.cell_index).collect();

    let mut description: String = cells[desc_start..first_amount_cell].join(" ");
    if description.is_empty() {
        // Description column sits after the numbers on some layouts.
        description = cells
            .iter()
            .enumerate()
            .filter(|(i, _)| !numeric_cells.contains(i))
            .map(|(_, c)| *c)
            .collect::<Vec<_>>()
            .join(" ");
    }

    let (quantity, unit_price, line_total) = assign_columns(&amounts);

    let partial = quantity.is_none() || unit_price.is_none() || line_total.is_none();
    let total_mismatch = check_total(&quantity, &unit_price, &line_total, tolerance);

    LineItem {
        ordinal,
        page_index,
        description,
        quantity,
        unit_price,
        line_total,
        partial,
        total_mismatch,
    }
}

/// Map positional numeric tokens onto (quantity, unit price, line total).
fn assign_columns(
    amounts: &[AmountCell],
) -> (Option<Decimal>, Option<Money>, Option<Decimal>) {
    let money = |a: &AmountCell| Money {
        amount: a.value,
        currency: a.currency.clone(),
    };
    // A plausible quantity is currency-free and not absurdly large.
    let qty_of = |a: &AmountCell| -> Option<Decimal> {
        (a.currency.is_none() && a.value > Decimal::ZERO && a.value < Decimal::from(1_000_000))
            .then_some(a.value)
    };

    match amounts.len() {
        0 => (None, None, None),
        1 => (None, None, Some(amounts[0].value)),
        2 => {
            // "qty  total" when the first token reads like a count,
            // otherwise "price  total" with the quantity missing.
            if amounts[0].currency.is_none() && amounts[0].value.fract().is_zero() {
                (qty_of(&amounts[0]), None, Some(amounts[1].value))
            } else {
                (None, Some(money(&amounts[0])), Some(amounts[1].value))
            }
        }
        n => (
            qty_of(&amounts[0]),
            Some(money(&amounts[n - 2])),
            Some(amounts[n - 1].value),
        ),
    }
}

/// True when all three fields are present and the arithmetic disagrees
/// beyond the relative tolerance.
fn check_total(
    quantity: &Option<Decimal>,
    unit_price: &Option<Money>,
    line_total: &Option<Decimal>,
    tolerance: Decimal,
) -> bool {
    let (Some(qty), Some(price), Some(total)) = (quantity, unit_price.as_ref(), line_total) else {
        return false;
    };
    let expected = qty * price.amount;
    let diff = (expected - total).abs();
    let base = total.abs().max(expected.abs());
    diff > base * tolerance
}

/// Normalise a raw numeric token into a [`Decimal`].
///
/// Handles thousands separators (`.`, `,`, space, NBSP) and decimal commas.
/// When both separators appear, the one occurring last is the decimal
/// point. A lone comma followed by exactly three digits is read as a
/// thousands separator (`1,234` → 1234); a lone dot is always a decimal
/// point (`5.000` → 5).
pub fn normalize_amount(raw: &str) -> Option<Decimal> {
    let s: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();

    let last_dot = s.rfind('.');
    let last_comma = s.rfind(',');

    let cleaned = match (last_dot, last_comma) {
        (Some(d), Some(c)) => {
            if d > c {
                s.replace(',', "")
            } else {
                s.replace('.', "").replace(',', ".")
            }
        }
        (None, Some(c)) => {
            let digits_after = s.len() - c - 1;
            if s.matches(',').count() == 1 && digits_after != 3 {
                s.replace(',', ".")
            } else {
                s.replace(',', "")
            }
        }
        _ => s,
    };

    Decimal::from_str(&cleaned).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extract::TextSource;

    fn page(text: &str) -> PageText {
        PageText {
            page_index: 0,
            text: text.to_string(),
            source: TextSource::NativeText,
            error: None,
        }
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    const TOL: fn() -> Decimal = || Decimal::new(1, 2);

    #[test]
    fn normalize_plain_and_us_style() {
        assert_eq!(normalize_amount("5.00"), Some(dec("5.00")));
        assert_eq!(normalize_amount("1,234.56"), Some(dec("1234.56")));
        assert_eq!(normalize_amount("10"), Some(dec("10")));
    }

    #[test]
    fn normalize_european_style() {
        assert_eq!(normalize_amount("1.234,56"), Some(dec("1234.56")));
        assert_eq!(normalize_amount("1 000,00"), Some(dec("1000.00")));
        assert_eq!(normalize_amount("12,5"), Some(dec("12.5")));
    }

    #[test]
    fn normalize_lone_separators() {
        // Lone comma + 3 digits reads as thousands, lone dot as decimal.
        assert_eq!(normalize_amount("1,234"), Some(dec("1234")));
        assert_eq!(normalize_amount("5.000"), Some(dec("5.000")));
    }

    #[test]
    fn header_gates_the_table() {
        let p = page("Acme Corp\nWidget X  5  $1.00  $5.00\nDescription  Qty  Price  Total\nWidget A  10  $5.00  $50.00\n");
        let items = parse_line_items(&[p], TOL());
        // The pre-header row must not be parsed.
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].description, "Widget A");
    }

    #[test]
    fn widget_row_parses_fully() {
        let p = page("Description  Qty  Unit Price  Amount\nWidget A  10  $5.00  $50.00\n");
        let items = parse_line_items(&[p], TOL());
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.quantity, Some(dec("10")));
        assert_eq!(item.unit_price.as_ref().unwrap().amount, dec("5.00"));
        assert_eq!(item.unit_price.as_ref().unwrap().currency.as_deref(), Some("$"));
        assert_eq!(item.line_total, Some(dec("50.00")));
        assert!(!item.partial);
        assert!(!item.total_mismatch);
    }

    #[test]
    fn comma_separated_row_parses() {
        let p = page("Item, Qty, Price, Total\nWidget A, 10, $5.00, $50.00\n");
        let items = parse_line_items(&[p], TOL());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, Some(dec("10")));
        assert_eq!(items[0].line_total, Some(dec("50.00")));
    }

    #[test]
    fn footer_ends_the_table() {
        let p = page(
            "Description  Qty  Price  Total\n\
             Widget A  10  $5.00  $50.00\n\
             Subtotal  $50.00\n\
             Widget B  2  $1.00  $2.00\n",
        );
        let items = parse_line_items(&[p], TOL());
        assert_eq!(items.len(), 1, "rows after the subtotal block are not items");
    }

    #[test]
    fn wrapped_description_merges() {
        let p = page(
            "Description  Qty  Price  Total\n\
             Stainless steel hex bolts  500  $0.12  $60.00\n\
             grade A4, DIN 933\n\
             Washers  100  $0.02  $2.00\n",
        );
        let items = parse_line_items(&[p], TOL());
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0].description,
            "Stainless steel hex bolts grade A4, DIN 933"
        );
        assert_eq!(items[1].description, "Washers");
    }

    #[test]
    fn partial_row_is_kept_and_flagged() {
        let p = page("Description  Qty  Price  Total\nMystery part  $99.00\n");
        let items = parse_line_items(&[p], TOL());
        assert_eq!(items.len(), 1);
        assert!(items[0].partial);
        assert_eq!(items[0].line_total, Some(dec("99.00")));
        assert_eq!(items[0].quantity, None);
    }

    #[test]
    fn total_mismatch_is_flagged_not_dropped() {
        let p = page("Description  Qty  Price  Total\nWidget A  10  $5.00  $45.00\n");
        let items = parse_line_items(&[p], TOL());
        assert_eq!(items.len(), 1);
        assert!(items[0].total_mismatch);
        assert_eq!(items[0].line_total, Some(dec("45.00")));
    }

    #[test]
    fn small_rounding_noise_is_tolerated() {
        let p = page("Description  Qty  Price  Total\nWidget A  3  $0.33  $1.00\n");
        let items = parse_line_items(&[p], TOL());
        // 3 × 0.33 = 0.99, within 1% of 1.00.
        assert!(!items[0].total_mismatch);
    }

    #[test]
    fn leading_row_number_is_not_a_quantity() {
        let p = page("No.  Description  Qty  Price  Total\n1  Widget A  10  $5.00  $50.00\n");
        let items = parse_line_items(&[p], TOL());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, Some(dec("10")));
        assert_eq!(items[0].description, "Widget A");
    }

    #[test]
    fn ordinals_run_across_pages() {
        let p1 = page("Description  Qty  Price  Total\nWidget A  1  $1.00  $1.00\n");
        let mut p2 = page("Description  Qty  Price  Total\nWidget B  2  $2.00  $4.00\n");
        p2.page_index = 1;
        let items = parse_line_items(&[p1, p2], TOL());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].ordinal, 0);
        assert_eq!(items[1].ordinal, 1);
        assert_eq!(items[1].page_index, 1);
    }

    #[test]
    fn empty_and_failed_pages_yield_no_items() {
        let mut failed = page("");
        failed.source = TextSource::Failed;
        let items = parse_line_items(&[failed], TOL());
        assert!(items.is_empty());
    }

    #[test]
    fn money_display() {
        let m = Money {
            amount: dec("5.00"),
            currency: Some("$".into()),
        };
        assert_eq!(m.to_string(), "$5.00");
        let m2 = Money {
            amount: dec("5.00"),
            currency: Some("USD".into()),
        };
        assert_eq!(m2.to_string(), "5.00 USD");
    }
}
