//! Record normalization and the government facility-registry source.
//!
//! Source records arrive as JSON maps keyed either by Chinese field labels
//! (the open-data registry) or by legacy codes / snake_case columns (the
//! internal store and its spreadsheet ancestors). One alias table per
//! canonical field drives the mapping; a missing field is an empty value,
//! never an error.

use std::time::Duration;

use eprt_core::{PermitDate, PermitRecord, PermitType, TaxId};
use eprt_store::{AirPermitRow, FetchError, HttpClientConfig, HttpFetcher, WaterPermitRow};
use serde_json::Value as JsonValue;
use tracing::debug;

pub const CRATE_NAME: &str = "eprt-sources";

/// Ordered key aliases for one canonical field. Earlier entries win; the
/// Chinese registry label always comes first, then the legacy export code,
/// then the internal snake_case column.
#[derive(Debug, Clone, Copy)]
pub struct FieldAliases {
    pub canonical: &'static str,
    pub keys: &'static [&'static str],
}

pub const FACILITY_ID: FieldAliases = FieldAliases {
    canonical: "facility_id",
    keys: &["管制編號", "CTL_NO", "ems_no"],
};
pub const TAX_ID: FieldAliases = FieldAliases {
    canonical: "tax_id",
    keys: &["營利事業統一編號", "BAN", "ban"],
};
pub const PERMIT_NUMBER: FieldAliases = FieldAliases {
    canonical: "permit_number",
    keys: &["許可證號", "PER_NO", "per_no"],
};
pub const START_DATE: FieldAliases = FieldAliases {
    canonical: "start_date",
    keys: &["許可證起始日", "PER_SDATE", "per_sdate"],
};
pub const END_DATE: FieldAliases = FieldAliases {
    canonical: "end_date",
    keys: &["許可證截止日", "PER_EDATE", "per_edate"],
};
pub const PERMIT_TYPE: FieldAliases = FieldAliases {
    canonical: "permit_type",
    keys: &["水污染防治許可種類", "PER_TYPE", "per_type"],
};
pub const FACILITY_NAME: FieldAliases = FieldAliases {
    canonical: "facility_name",
    keys: &["事業名稱", "FAC_NAME", "fac_name"],
};
pub const ADDRESS: FieldAliases = FieldAliases {
    canonical: "address",
    keys: &["實際廠（場）地址", "FAC_ADDR", "address"],
};
pub const CONTROLLED: FieldAliases = FieldAliases {
    canonical: "controlled",
    keys: &["是否列管", "IS_CTL", "controlled"],
};

/// Resolve one canonical field from a raw record: first alias present wins,
/// absent and null both collapse to the empty string. Scalar values are
/// stringified so numeric cells survive the trip.
pub fn raw_field(record: &JsonValue, aliases: FieldAliases) -> String {
    for key in aliases.keys {
        match record.get(key) {
            None | Some(JsonValue::Null) => continue,
            Some(JsonValue::String(s)) => return s.trim().to_string(),
            Some(JsonValue::Number(n)) => return n.to_string(),
            Some(JsonValue::Bool(b)) => return b.to_string(),
            Some(other) => return other.to_string(),
        }
    }
    String::new()
}

/// Boolean "controlled" flags arrive in several truthy spellings.
pub fn truthy_flag(record: &JsonValue, aliases: FieldAliases) -> bool {
    for key in aliases.keys {
        match record.get(key) {
            None | Some(JsonValue::Null) => continue,
            Some(JsonValue::Bool(b)) => return *b,
            Some(JsonValue::Number(n)) => return n.as_i64() == Some(1),
            Some(JsonValue::String(s)) => {
                let trimmed = s.trim();
                return trimmed == "1" || trimmed.eq_ignore_ascii_case("y");
            }
            Some(_) => return false,
        }
    }
    false
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Map a raw registry or spreadsheet record into the canonical shape.
/// Unparseable dates degrade to `None` rather than failing the record.
pub fn normalize_record(record: &JsonValue) -> PermitRecord {
    let end_raw = raw_field(record, END_DATE);
    let start_raw = raw_field(record, START_DATE);
    let type_raw = raw_field(record, PERMIT_TYPE);

    PermitRecord {
        facility_id: non_empty(raw_field(record, FACILITY_ID)),
        tax_id: non_empty(raw_field(record, TAX_ID)),
        permit_number: raw_field(record, PERMIT_NUMBER),
        start_date: PermitDate::parse_lenient(&start_raw),
        end_date: PermitDate::parse_lenient(&end_raw),
        permit_type: PermitType::classify(&type_raw),
        facility_name: raw_field(record, FACILITY_NAME),
        address: raw_field(record, ADDRESS),
        controlled: truthy_flag(record, CONTROLLED),
    }
}

/// Map a `water_permits` row into the canonical shape.
pub fn normalize_water_row(row: &WaterPermitRow) -> PermitRecord {
    let opt = |value: &Option<String>| value.as_deref().unwrap_or("").trim().to_string();

    PermitRecord {
        facility_id: non_empty(opt(&row.ems_no)),
        tax_id: non_empty(opt(&row.ban)),
        permit_number: opt(&row.per_no),
        start_date: PermitDate::parse_lenient(&opt(&row.per_sdate)),
        end_date: PermitDate::parse_lenient(&opt(&row.per_edate)),
        permit_type: PermitType::classify(&opt(&row.per_type)).or(Some(PermitType::Water)),
        facility_name: opt(&row.fac_name),
        address: opt(&row.address),
        controlled: false,
    }
}

/// Map an `air_permits` row into the canonical shape. The internal air
/// table carries no tax id; the facility id is the only key.
pub fn normalize_air_row(row: &AirPermitRow) -> PermitRecord {
    let opt = |value: &Option<String>| value.as_deref().unwrap_or("").trim().to_string();

    PermitRecord {
        facility_id: non_empty(opt(&row.ems_no)),
        tax_id: None,
        permit_number: opt(&row.permit_no),
        start_date: None,
        end_date: PermitDate::parse_lenient(&opt(&row.expiry_date)),
        permit_type: Some(PermitType::Air),
        facility_name: String::new(),
        address: String::new(),
        controlled: false,
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_url: String,
    pub dataset: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("EPRT_REGISTRY_BASE_URL")
                .unwrap_or_else(|_| "https://data.moenv.gov.tw/api/v2".to_string()),
            dataset: std::env::var("EPRT_REGISTRY_DATASET")
                .unwrap_or_else(|_| "wrp_p_46".to_string()),
            api_key: std::env::var("EPRT_REGISTRY_API_KEY").ok(),
            timeout_secs: std::env::var("EPRT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("EPRT_USER_AGENT")
                .unwrap_or_else(|_| "eprt-bot/0.1".to_string()),
        }
    }
}

/// Client for the government facility registry: one filtered GET per tax id,
/// rows normalized into `PermitRecord`s.
#[derive(Debug)]
pub struct GovRegistryClient {
    fetcher: HttpFetcher,
    config: RegistryConfig,
}

impl GovRegistryClient {
    pub fn new(config: RegistryConfig) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self { fetcher, config })
    }

    pub async fn facilities_by_tax_id(
        &self,
        tax_id: &TaxId,
    ) -> Result<Vec<PermitRecord>, FetchError> {
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.dataset
        );
        let filters = format!("BAN,EQ,{}", tax_id.as_str());
        let mut query: Vec<(&str, &str)> = vec![("format", "json"), ("filters", &filters)];
        if let Some(api_key) = &self.config.api_key {
            query.push(("api_key", api_key));
        }

        let body = self.fetcher.fetch_json(&url, &query).await?;
        let records = extract_records(&body);
        debug!(tax_id = tax_id.as_str(), count = records.len(), "registry records fetched");
        Ok(records)
    }
}

/// The registry wraps rows in a `records` array; some mirrors return the
/// bare array. Anything else counts as zero rows.
pub fn extract_records(body: &JsonValue) -> Vec<PermitRecord> {
    let rows = match body {
        JsonValue::Array(rows) => rows.as_slice(),
        JsonValue::Object(map) => match map.get("records").and_then(JsonValue::as_array) {
            Some(rows) => rows.as_slice(),
            None => &[],
        },
        _ => &[],
    };
    rows.iter().map(normalize_record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chinese_label_wins_over_legacy_code() {
        let record = json!({
            "管制編號": "F1500549",
            "CTL_NO": "IGNORED",
            "ems_no": "ALSO_IGNORED",
        });
        assert_eq!(raw_field(&record, FACILITY_ID), "F1500549");
    }

    #[test]
    fn legacy_code_wins_over_snake_case() {
        let record = json!({ "PER_NO": "高市水排許字第00123號", "per_no": "other" });
        assert_eq!(raw_field(&record, PERMIT_NUMBER), "高市水排許字第00123號");
    }

    #[test]
    fn missing_field_is_empty_string_not_error() {
        let record = json!({});
        assert_eq!(raw_field(&record, ADDRESS), "");
        let normalized = normalize_record(&record);
        assert_eq!(normalized.permit_number, "");
        assert!(normalized.end_date.is_none());
        assert!(!normalized.has_lookup_key());
    }

    #[test]
    fn numeric_cells_are_stringified() {
        let record = json!({ "BAN": 22721208 });
        assert_eq!(raw_field(&record, TAX_ID), "22721208");
    }

    #[test]
    fn truthy_flag_accepts_all_known_encodings() {
        for value in [json!("1"), json!("Y"), json!("y"), json!(true), json!(1)] {
            let record = json!({ "IS_CTL": value });
            assert!(truthy_flag(&record, CONTROLLED), "expected truthy: {record}");
        }
        for value in [json!("0"), json!("N"), json!(false), json!(0), json!("")] {
            let record = json!({ "IS_CTL": value });
            assert!(!truthy_flag(&record, CONTROLLED), "expected falsy: {record}");
        }
        assert!(!truthy_flag(&json!({}), CONTROLLED));
    }

    #[test]
    fn registry_record_normalizes_with_roc_dates() {
        let record = json!({
            "管制編號": "F1500549",
            "營利事業統一編號": "22721208",
            "許可證號": "高市水排許字第00123號",
            "許可證起始日": "110年07月01日",
            "許可證截止日": "115年06月30日",
            "水污染防治許可種類": "廢（污）水排放許可證",
            "事業名稱": "範例工業股份有限公司",
            "實際廠（場）地址": "高雄市臨海工業區",
            "是否列管": "Y",
        });
        let normalized = normalize_record(&record);
        assert_eq!(normalized.facility_id.as_deref(), Some("F1500549"));
        assert_eq!(normalized.tax_id.as_deref(), Some("22721208"));
        assert_eq!(normalized.start_date.unwrap().to_string(), "2021-07-01");
        assert_eq!(normalized.end_date.unwrap().to_string(), "2026-06-30");
        assert_eq!(normalized.permit_type, Some(PermitType::Water));
        assert!(normalized.controlled);
        assert!(normalized.has_lookup_key());
    }

    #[test]
    fn water_row_normalizes_to_water_type_by_default() {
        let row = WaterPermitRow {
            ban: Some("22721208".to_string()),
            ems_no: Some("F1500549".to_string()),
            per_no: Some("00123".to_string()),
            per_edate: Some("2026-03-01".to_string()),
            per_type: None,
            ..Default::default()
        };
        let normalized = normalize_water_row(&row);
        assert_eq!(normalized.permit_type, Some(PermitType::Water));
        assert_eq!(normalized.end_date.unwrap().to_string(), "2026-03-01");
        assert_eq!(normalized.facility_name, "");
    }

    #[test]
    fn extract_records_handles_wrapped_and_bare_arrays() {
        let wrapped = json!({ "records": [ { "BAN": "22721208" } ] });
        let bare = json!([ { "BAN": "22721208" } ]);
        let neither = json!({ "error": "rate limited" });
        assert_eq!(extract_records(&wrapped).len(), 1);
        assert_eq!(extract_records(&bare).len(), 1);
        assert!(extract_records(&neither).is_empty());
    }
}
