//! Tariff lookup: resolve predicted codes against the reference table.
//!
//! The reference table is keyed by HTS code but is usually coarser than a
//! model's prediction — a table may list `8471.30` while the model answers
//! `8471.30.01`. Lookup therefore tries the exact code first and then
//! progressively shorter prefixes (dropping one 2-digit group at a time,
//! down to the 2-digit chapter). Which prefix actually matched is recorded,
//! because the duty rate's precision depends on it.
//!
//! The table is loaded once per run — from a local JSON or CSV file, or an
//! HTTP(S) source fetched with a timeout — and is read-only afterwards, so
//! it can be shared across tasks without synchronisation.

use crate::config::TariffSource;
use crate::error::TariffPipelineError;
use crate::pipeline::classify::HtsCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// A duty rate: percentage of value, fixed fee per unit, or duty-free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DutyRate {
    /// Percentage of the customs value, e.g. `5%`.
    AdValorem(Decimal),
    /// Fixed fee per unit of measure, e.g. `$1.20/kg`.
    Specific { amount: Decimal, unit: String },
    /// Duty-free.
    Free,
}

impl DutyRate {
    /// Parse the rate strings tariff tables use: `"5%"`, `"Free"`,
    /// `"$1.20/kg"`, or a bare number (read as a percentage).
    pub fn parse(raw: &str) -> Result<Self, String> {
        let s = raw.trim();
        if s.is_empty() {
            return Err("empty rate".into());
        }
        if s.eq_ignore_ascii_case("free") {
            return Ok(DutyRate::Free);
        }
        if let Some(pct) = s.strip_suffix('%') {
            let value = Decimal::from_str(pct.trim())
                .map_err(|e| format!("bad percentage '{s}': {e}"))?;
            return Ok(if value.is_zero() {
                DutyRate::Free
            } else {
                DutyRate::AdValorem(value)
            });
        }
        if let Some((amount_part, unit)) = s.split_once('/') {
            let amount_str = amount_part.trim().trim_start_matches(['$', '€', '£']).trim();
            let amount = Decimal::from_str(amount_str)
                .map_err(|e| format!("bad specific rate '{s}': {e}"))?;
            return Ok(DutyRate::Specific {
                amount,
                unit: unit.trim().to_string(),
            });
        }
        let value =
            Decimal::from_str(s).map_err(|_| format!("unrecognised rate format '{s}'"))?;
        Ok(if value.is_zero() {
            DutyRate::Free
        } else {
            DutyRate::AdValorem(value)
        })
    }
}

impl fmt::Display for DutyRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DutyRate::AdValorem(pct) => write!(f, "{pct}%"),
            DutyRate::Specific { amount, unit } => write!(f, "${amount}/{unit}"),
            DutyRate::Free => write!(f, "Free"),
        }
    }
}

/// One row of the reference table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffEntry {
    /// The code as listed, dotted form.
    pub code: String,
    pub description: String,
    pub rate: DutyRate,
    /// Unit of measure, when the table provides one.
    pub unit: Option<String>,
}

/// How precisely a predicted code matched the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchLevel {
    /// The full predicted code was present.
    Full,
    /// Matched after truncating to this many digits.
    Prefix(u8),
}

impl fmt::Display for MatchLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchLevel::Full => write!(f, "full"),
            MatchLevel::Prefix(digits) => write!(f, "{digits}-digit prefix"),
        }
    }
}

/// Lookup outcome for one predicted code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TariffMatch {
    Found {
        entry: TariffEntry,
        /// The table code that matched (dotted form).
        matched_code: String,
        level: MatchLevel,
    },
    NotFound,
}

/// On-disk / on-wire row shape: rate arrives as a string.
#[derive(Debug, Deserialize)]
struct RawEntry {
    code: String,
    description: String,
    rate: String,
    #[serde(default)]
    unit: Option<String>,
}

/// The reference tariff table, keyed by digit-normalised code.
#[derive(Debug, Clone)]
pub struct TariffTable {
    entries: HashMap<String, TariffEntry>,
}

impl TariffTable {
    /// Build a table from entries; later duplicates replace earlier ones.
    pub fn from_entries(entries: Vec<TariffEntry>) -> Self {
        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            let key: String = entry.code.chars().filter(|c| c.is_ascii_digit()).collect();
            if map.insert(key.clone(), entry).is_some() {
                warn!("duplicate tariff code {key}, keeping the later entry");
            }
        }
        Self { entries: map }
    }

    /// Parse a JSON array of `{code, description, rate, unit}` objects.
    pub fn from_json_str(json: &str) -> Result<Self, String> {
        let raw: Vec<RawEntry> = serde_json::from_str(json).map_err(|e| e.to_string())?;
        Self::from_raw(raw)
    }

    /// Parse CSV with a `code,description,rate[,unit]` header.
    pub fn from_csv_str(data: &str) -> Result<Self, String> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(data.as_bytes());
        let mut raw = Vec::new();
        for record in reader.deserialize::<RawEntry>() {
            raw.push(record.map_err(|e| e.to_string())?);
        }
        Self::from_raw(raw)
    }

    fn from_raw(raw: Vec<RawEntry>) -> Result<Self, String> {
        let mut entries = Vec::with_capacity(raw.len());
        for r in raw {
            let rate = DutyRate::parse(&r.rate)
                .map_err(|e| format!("entry '{}': {e}", r.code))?;
            entries.push(TariffEntry {
                code: r.code,
                description: r.description,
                rate,
                unit: r.unit,
            });
        }
        if entries.is_empty() {
            return Err("tariff table contains no entries".into());
        }
        Ok(Self::from_entries(entries))
    }

    /// Load the table from its configured source.
    ///
    /// Remote sources are fetched once with `fetch_timeout`; the format is
    /// sniffed from the payload (JSON array vs CSV), so the same flag works
    /// for both.
    pub async fn load(
        source: &TariffSource,
        fetch_timeout: Duration,
    ) -> Result<Self, TariffPipelineError> {
        let load_err = |detail: String| TariffPipelineError::TariffTableLoad {
            table_source: source.to_string(),
            detail,
        };

        let body = match source {
            TariffSource::Path(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| load_err(e.to_string()))?,
            TariffSource::Url(url) => {
                let response = timeout(fetch_timeout, reqwest::get(url))
                    .await
                    .map_err(|_| load_err(format!("fetch timed out after {fetch_timeout:?}")))?
                    .map_err(|e| load_err(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(load_err(format!("HTTP {}", response.status())));
                }
                timeout(fetch_timeout, response.text())
                    .await
                    .map_err(|_| load_err(format!("fetch timed out after {fetch_timeout:?}")))?
                    .map_err(|e| load_err(e.to_string()))?
            }
        };

        let table = if body.trim_start().starts_with('[') {
            Self::from_json_str(&body).map_err(load_err)?
        } else {
            Self::from_csv_str(&body).map_err(load_err)?
        };

        info!("tariff table loaded: {} entries from {}", table.len(), source);
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a predicted code: exact match, then progressive prefixes.
    pub fn lookup(&self, code: &HtsCode) -> TariffMatch {
        let digits = code.digits();
        let full_len = digits.len();

        let mut len = full_len;
        while len >= 2 {
            if let Some(entry) = self.entries.get(&digits[..len]) {
                let level = if len == full_len {
                    MatchLevel::Full
                } else {
                    MatchLevel::Prefix(len as u8)
                };
                debug!("code {code} matched {} at {level}", entry.code);
                return TariffMatch::Found {
                    entry: entry.clone(),
                    matched_code: entry.code.clone(),
                    level,
                };
            }
            // Drop one 2-digit group per step: 8471.30.01 → 8471.30 → 8471 → 84.
            len -= 2;
        }

        debug!("code {code} not found at any prefix level");
        TariffMatch::NotFound
    }
}
