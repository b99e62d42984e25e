//! Core domain model for EPRT: canonical permit records, the unified
//! permit-date type, and the lookup response shapes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "eprt-core";

/// Regulatory permit families tracked for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermitType {
    Water,
    Air,
    Waste,
    Toxic,
    Soil,
}

impl PermitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermitType::Water => "water",
            PermitType::Air => "air",
            PermitType::Waste => "waste",
            PermitType::Toxic => "toxic",
            PermitType::Soil => "soil",
        }
    }

    /// Best-effort classification of a source permit-type cell. The registry
    /// returns Chinese category names, the internal store short codes.
    pub fn classify(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let lower = trimmed.to_ascii_lowercase();
        if lower == "water" || lower == "w" || trimmed.contains('水') {
            Some(PermitType::Water)
        } else if lower == "air" || lower == "a" || trimmed.contains('空') {
            Some(PermitType::Air)
        } else if lower == "waste" || trimmed.contains('廢') {
            Some(PermitType::Waste)
        } else if lower == "toxic" || trimmed.contains('毒') {
            Some(PermitType::Toxic)
        } else if lower == "soil" || trimmed.contains('土') {
            Some(PermitType::Soil)
        } else {
            None
        }
    }
}

#[derive(Debug, Error)]
pub enum DateParseError {
    #[error("empty date string")]
    Empty,
    #[error("unrecognized date format: {0:?}")]
    Format(String),
    #[error("date out of range: {0:?}")]
    OutOfRange(String),
}

/// Calendar-aware permit date.
///
/// Source systems mix Gregorian `YYYY-MM-DD`, ROC-calendar `YYY年MM月DD日`,
/// and ROC numeric `YYY/MM/DD` strings. All of them parse into one
/// `NaiveDate`, so every comparison in the pipeline is on real dates rather
/// than string order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermitDate(NaiveDate);

impl PermitDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn parse(input: &str) -> Result<Self, DateParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(DateParseError::Empty);
        }
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return Ok(Self(date));
        }
        if let Some(parts) = split_roc_labeled(trimmed) {
            return from_roc_parts(trimmed, parts);
        }
        if let Some(parts) = split_numeric(trimmed) {
            let (year, month, day) = parts;
            // Years below the ROC epoch are Republic-of-China calendar years.
            if year < 1911 {
                return from_roc_parts(trimmed, (year, month, day));
            }
            return NaiveDate::from_ymd_opt(year, month, day)
                .map(Self)
                .ok_or_else(|| DateParseError::OutOfRange(trimmed.to_string()));
        }
        Err(DateParseError::Format(trimmed.to_string()))
    }

    /// Parse a source cell that may legitimately be blank or garbage.
    /// Blank and unparseable cells both collapse to `None`; the normalizer
    /// contract is that bad data degrades, never errors.
    pub fn parse_lenient(input: &str) -> Option<Self> {
        Self::parse(input).ok()
    }
}

fn split_roc_labeled(input: &str) -> Option<(i32, u32, u32)> {
    let rest = input.strip_suffix('日')?;
    let (ym, day) = rest.split_once('月')?;
    let (year, month) = ym.split_once('年')?;
    Some((
        year.trim().parse().ok()?,
        month.trim().parse().ok()?,
        day.trim().parse().ok()?,
    ))
}

fn split_numeric(input: &str) -> Option<(i32, u32, u32)> {
    let mut parts = input.split(['/', '.']);
    let year = parts.next()?.trim().parse().ok()?;
    let month = parts.next()?.trim().parse().ok()?;
    let day = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((year, month, day))
}

fn from_roc_parts(raw: &str, (year, month, day): (i32, u32, u32)) -> Result<PermitDate, DateParseError> {
    NaiveDate::from_ymd_opt(year + 1911, month, day)
        .map(PermitDate)
        .ok_or_else(|| DateParseError::OutOfRange(raw.to_string()))
}

impl fmt::Display for PermitDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for PermitDate {
    type Err = DateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PermitDate {
    type Error = DateParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PermitDate> for String {
    fn from(value: PermitDate) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Error)]
pub enum TaxIdError {
    #[error("tax id must be exactly 8 digits, got {0:?}")]
    Malformed(String),
}

/// Validated 8-digit business tax identifier (統一編號).
///
/// Construction is the validation gate: a `TaxId` in hand means the lookup
/// precondition already passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TaxId(String);

impl TaxId {
    pub fn new(input: &str) -> Result<Self, TaxIdError> {
        let trimmed = input.trim();
        if trimmed.len() == 8 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(TaxIdError::Malformed(input.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The same id with leading zeros stripped. Spreadsheet ingestion
    /// upstream of the internal store sometimes drops them, so store queries
    /// match on both spellings.
    pub fn unpadded(&self) -> &str {
        let stripped = self.0.trim_start_matches('0');
        if stripped.is_empty() {
            "0"
        } else {
            stripped
        }
    }
}

impl fmt::Display for TaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical permit record, the normalized shape every source maps into.
/// Immutable once built; downstream components only aggregate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PermitRecord {
    pub facility_id: Option<String>,
    pub tax_id: Option<String>,
    pub permit_number: String,
    pub start_date: Option<PermitDate>,
    pub end_date: Option<PermitDate>,
    pub permit_type: Option<PermitType>,
    pub facility_name: String,
    pub address: String,
    pub controlled: bool,
}

impl PermitRecord {
    /// A record is usable for lookup-by-key iff at least one key is present.
    pub fn has_lookup_key(&self) -> bool {
        self.facility_id.as_deref().is_some_and(|v| !v.is_empty())
            || self.tax_id.as_deref().is_some_and(|v| !v.is_empty())
    }
}

/// One consolidated row per facility, folded from many per-process rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilityProcessGroup {
    pub facility_id: String,
    pub company_name: String,
    pub address: String,
    pub process_list: Vec<String>,
    pub categories: BTreeSet<String>,
    pub permit_numbers: BTreeSet<String>,
    pub earliest_expiry: Option<PermitDate>,
    pub latest_expiry: Option<PermitDate>,
}

impl FacilityProcessGroup {
    pub fn new(facility_id: String, company_name: String, address: String) -> Self {
        Self {
            facility_id,
            company_name,
            address,
            process_list: Vec::new(),
            categories: BTreeSet::new(),
            permit_numbers: BTreeSet::new(),
            earliest_expiry: None,
            latest_expiry: None,
        }
    }

    /// Categories rendered the way the consolidated worksheet shows them.
    pub fn joined_categories(&self) -> String {
        self.categories.iter().cloned().collect::<Vec<_>>().join(", ")
    }

    /// Permit numbers rendered one per line, matching the worksheet cell.
    pub fn joined_permit_numbers(&self) -> String {
        self.permit_numbers.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Summary fields the lookup pipeline can resolve. Serializes to the
/// camelCase keys the portal consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SummaryField {
    WaterPermitEndDate,
    AirPermitEndDate,
    WastePermitEndDate,
    ToxicPermitEndDate,
}

pub type LookupSummary = BTreeMap<SummaryField, String>;

/// Per-facility summary derived from the government registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitySummary {
    pub facility_id: String,
    pub facility_name: String,
    pub address: String,
    pub permit_number: String,
    pub permit_type: Option<PermitType>,
}

/// Aggregate view of one permit family from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitAggregate {
    pub source: String,
    pub permit_count: usize,
    pub latest_end: Option<PermitDate>,
}

/// The full lookup response. Built fresh per request, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupResult {
    pub tax_id: String,
    pub found: bool,
    pub facilities: Vec<FacilitySummary>,
    pub water: Option<PermitAggregate>,
    pub air: Option<PermitAggregate>,
    pub summary: LookupSummary,
}

impl LookupResult {
    pub fn empty(tax_id: &TaxId) -> Self {
        Self {
            tax_id: tax_id.as_str().to_string(),
            found: false,
            facilities: Vec::new(),
            water: None,
            air: None,
            summary: BTreeMap::new(),
        }
    }
}
