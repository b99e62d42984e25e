//! Spreadsheet migration pipeline: per-process row consolidation, control-
//! number deduplication, and the serial workbook runner that reads district
//! worksheets and writes JSON outputs plus a markdown run brief.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::Utc;
use eprt_core::{FacilityProcessGroup, PermitDate};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "eprt-sheets";

/// Fixed district-worksheet layout. Column 10 (district) is present only on
/// the "total" worksheet.
pub const COL_COUNTY: usize = 0;
pub const COL_FACILITY_ID: usize = 1;
pub const COL_COMPANY_NAME: usize = 2;
pub const COL_ADDRESS: usize = 3;
pub const COL_PROCESS_ID: usize = 4;
pub const COL_PROCESS_NAME: usize = 5;
pub const COL_CATEGORY: usize = 6;
pub const COL_PERMIT_NO: usize = 7;
pub const COL_EFFECTIVE_DATE: usize = 8;
pub const COL_EXPIRY_DATE: usize = 9;
pub const COL_DISTRICT: usize = 10;

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("opening workbook {path}: {source}")]
    Open {
        path: PathBuf,
        source: calamine::Error,
    },
    #[error("reading worksheet {sheet:?}: {source}")]
    Worksheet {
        sheet: String,
        source: calamine::Error,
    },
}

/// One per-process permit row as exported by the scraping scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRow {
    pub county: String,
    pub facility_id: String,
    pub company_name: String,
    pub address: String,
    pub process_id: String,
    pub process_name: String,
    pub category: String,
    pub permit_number: String,
    pub effective_date: String,
    pub expiry_date: String,
    pub district: String,
}

impl ProcessRow {
    pub fn from_cells(cells: &[String]) -> Self {
        let cell = |idx: usize| cells.get(idx).cloned().unwrap_or_default();
        Self {
            county: cell(COL_COUNTY),
            facility_id: cell(COL_FACILITY_ID),
            company_name: cell(COL_COMPANY_NAME),
            address: cell(COL_ADDRESS),
            process_id: cell(COL_PROCESS_ID),
            process_name: cell(COL_PROCESS_NAME),
            category: cell(COL_CATEGORY),
            permit_number: cell(COL_PERMIT_NO),
            effective_date: cell(COL_EFFECTIVE_DATE),
            expiry_date: cell(COL_EXPIRY_DATE),
            district: cell(COL_DISTRICT),
        }
    }
}

/// Fold per-process rows into one group per facility id.
///
/// Group order is first-seen input order. Identity fields are
/// first-writer-wins: a later row with the same facility id but a different
/// company or address contributes its process data only. Rows with an empty
/// facility id carry no grouping key and are skipped.
pub fn consolidate(rows: &[ProcessRow]) -> Vec<FacilityProcessGroup> {
    let mut groups: Vec<FacilityProcessGroup> = Vec::new();
    let mut index_by_id: HashMap<String, usize> = HashMap::new();

    for row in rows {
        let facility_id = row.facility_id.trim();
        if facility_id.is_empty() {
            continue;
        }
        let idx = *index_by_id.entry(facility_id.to_string()).or_insert_with(|| {
            groups.push(FacilityProcessGroup::new(
                facility_id.to_string(),
                row.company_name.trim().to_string(),
                row.address.trim().to_string(),
            ));
            groups.len() - 1
        });
        let group = &mut groups[idx];

        let process_id = row.process_id.trim();
        let process_name = row.process_name.trim();
        if !process_id.is_empty() || !process_name.is_empty() {
            group.process_list.push(format!("{process_id} - {process_name}"));
        }

        let category = row.category.trim();
        if !category.is_empty() {
            group.categories.insert(category.to_string());
        }
        let permit_number = row.permit_number.trim();
        if !permit_number.is_empty() {
            group.permit_numbers.insert(permit_number.to_string());
        }

        if let Some(expiry) = PermitDate::parse_lenient(&row.expiry_date) {
            group.earliest_expiry = match group.earliest_expiry {
                Some(current) if current <= expiry => Some(current),
                _ => Some(expiry),
            };
            group.latest_expiry = match group.latest_expiry {
                Some(current) if current >= expiry => Some(current),
                _ => Some(expiry),
            };
        }
    }

    groups
}

/// Result of a first-seen-per-key dedup pass.
#[derive(Debug, Clone, Serialize)]
pub struct DedupOutcome {
    pub rows: Vec<Vec<String>>,
    pub total_seen: usize,
    pub kept_unique: usize,
    pub dropped: usize,
    pub empty_key: usize,
}

/// Keep the first row per distinct non-empty key value, in original order.
/// Rows with an empty key are passed through unchanged — key presence is
/// required to dedupe.
pub fn dedupe_rows(rows: Vec<Vec<String>>, key_column: usize) -> DedupOutcome {
    let total_seen = rows.len();
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(rows.len());
    let mut kept_unique = 0usize;
    let mut dropped = 0usize;
    let mut empty_key = 0usize;

    for row in rows {
        let key = row.get(key_column).map(|c| c.trim().to_string()).unwrap_or_default();
        if key.is_empty() {
            empty_key += 1;
            out.push(row);
            continue;
        }
        if seen.insert(key) {
            kept_unique += 1;
            out.push(row);
        } else {
            dropped += 1;
        }
    }

    DedupOutcome {
        rows: out,
        total_seen,
        kept_unique,
        dropped,
        empty_key,
    }
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 {
                format!("{f:.0}")
            } else {
                format!("{f}")
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => if *b { "1".to_string() } else { "0".to_string() },
        Data::Error(e) => format!("#ERROR: {e:?}"),
        Data::DateTime(dt) => dt.to_string(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

/// District exports usually repeat the column labels as a first row.
pub fn is_header_row(cells: &[String]) -> bool {
    cells.iter().any(|cell| {
        matches!(
            cell.as_str(),
            "ems_no" | "company_name" | "address" | "expiry_date" | "管制編號" | "公司名稱"
        )
    })
}

/// All worksheets of one workbook as string cells, header rows stripped.
pub fn load_workbook(path: &Path) -> Result<Vec<(String, Vec<Vec<String>>)>, SheetError> {
    let mut workbook = open_workbook_auto(path).map_err(|source| SheetError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();

    let mut out = Vec::with_capacity(sheet_names.len());
    for name in sheet_names {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|source| SheetError::Worksheet {
                sheet: name.clone(),
                source,
            })?;
        let mut rows: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(cell_to_string).collect::<Vec<_>>())
            .filter(|cells: &Vec<String>| cells.iter().any(|c| !c.is_empty()))
            .collect();
        if rows.first().is_some_and(|cells| is_header_row(cells)) {
            rows.remove(0);
        }
        out.push((name, rows));
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub input: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetSummary {
    pub sheet: String,
    pub rows_in: usize,
    pub rows_out: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationRunSummary {
    pub run_id: Uuid,
    pub kind: String,
    pub input: String,
    pub output_dir: String,
    pub sheets: Vec<SheetSummary>,
}

/// Consolidate every worksheet of the input workbook and write one JSON
/// document per sheet plus a markdown brief. Fully serial; assumes
/// exclusive access to the file for the duration of the run.
pub fn run_consolidation(config: &MigrationConfig) -> Result<MigrationRunSummary> {
    let run_id = Uuid::new_v4();
    let run_dir = config.output_dir.join(run_id.to_string());
    fs::create_dir_all(&run_dir).with_context(|| format!("creating {}", run_dir.display()))?;

    let mut sheets = Vec::new();
    for (name, cell_rows) in load_workbook(&config.input)? {
        let rows: Vec<ProcessRow> = cell_rows.iter().map(|cells| ProcessRow::from_cells(cells)).collect();
        let groups = consolidate(&rows);
        info!(sheet = %name, rows = rows.len(), groups = groups.len(), "consolidated worksheet");

        let out_path = run_dir.join(format!("{}.json", sanitize_sheet_name(&name)));
        let bytes = serde_json::to_vec_pretty(&groups)
            .with_context(|| format!("serializing groups for {name:?}"))?;
        fs::write(&out_path, bytes).with_context(|| format!("writing {}", out_path.display()))?;

        sheets.push(SheetSummary {
            sheet: name,
            rows_in: rows.len(),
            rows_out: groups.len(),
        });
    }

    let summary = MigrationRunSummary {
        run_id,
        kind: "consolidate".to_string(),
        input: config.input.display().to_string(),
        output_dir: run_dir.display().to_string(),
        sheets,
    };
    write_brief(&run_dir, &summary)?;
    Ok(summary)
}

/// Dedupe every worksheet by the given key column (the control number in
/// the district layout) and write the surviving rows per sheet.
pub fn run_dedupe(config: &MigrationConfig, key_column: usize) -> Result<MigrationRunSummary> {
    let run_id = Uuid::new_v4();
    let run_dir = config.output_dir.join(run_id.to_string());
    fs::create_dir_all(&run_dir).with_context(|| format!("creating {}", run_dir.display()))?;

    let mut sheets = Vec::new();
    for (name, cell_rows) in load_workbook(&config.input)? {
        let rows_in = cell_rows.len();
        let outcome = dedupe_rows(cell_rows, key_column);
        info!(
            sheet = %name,
            total = outcome.total_seen,
            kept = outcome.kept_unique,
            dropped = outcome.dropped,
            "deduped worksheet"
        );

        let out_path = run_dir.join(format!("{}.json", sanitize_sheet_name(&name)));
        let bytes = serde_json::to_vec_pretty(&outcome)
            .with_context(|| format!("serializing dedup outcome for {name:?}"))?;
        fs::write(&out_path, bytes).with_context(|| format!("writing {}", out_path.display()))?;

        sheets.push(SheetSummary {
            sheet: name,
            rows_in,
            rows_out: outcome.rows.len(),
        });
    }

    let summary = MigrationRunSummary {
        run_id,
        kind: "dedupe".to_string(),
        input: config.input.display().to_string(),
        output_dir: run_dir.display().to_string(),
        sheets,
    };
    write_brief(&run_dir, &summary)?;
    Ok(summary)
}

fn sanitize_sheet_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' || c == '.' { '_' } else { c })
        .collect()
}

fn write_brief(run_dir: &Path, summary: &MigrationRunSummary) -> Result<()> {
    let brief = format!(
        "# EPRT Migration Brief\n\n- Run ID: `{}`\n- Kind: {}\n- Input: `{}`\n- Finished: {}\n\n## Sheets\n{}\n",
        summary.run_id,
        summary.kind,
        summary.input,
        Utc::now().to_rfc3339(),
        summary
            .sheets
            .iter()
            .map(|s| format!("- {}: {} rows in, {} out", s.sheet, s.rows_in, s.rows_out))
            .collect::<Vec<_>>()
            .join("\n")
    );
    let path = run_dir.join("migration_brief.md");
    fs::write(&path, brief).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_row(facility_id: &str, process_id: &str, expiry: &str) -> ProcessRow {
        ProcessRow {
            county: "高雄市".to_string(),
            facility_id: facility_id.to_string(),
            company_name: "範例工業".to_string(),
            address: "臨海工業區".to_string(),
            process_id: process_id.to_string(),
            process_name: format!("製程{process_id}"),
            category: "排放".to_string(),
            permit_number: format!("P-{process_id}"),
            expiry_date: expiry.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn group_count_equals_distinct_facility_ids() {
        let rows = vec![
            process_row("F01", "M01", "2025-06-01"),
            process_row("F02", "M01", "2025-06-01"),
            process_row("F01", "M02", "2025-06-01"),
            process_row("", "M03", "2025-06-01"),
        ];
        let groups = consolidate(&rows);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].facility_id, "F01");
        assert_eq!(groups[1].facility_id, "F02");
    }

    #[test]
    fn identity_fields_are_first_writer_wins() {
        let mut second = process_row("F01", "M02", "2025-06-01");
        second.company_name = "改名後公司".to_string();
        second.address = "別處".to_string();
        let rows = vec![process_row("F01", "M01", "2025-06-01"), second];
        let groups = consolidate(&rows);
        assert_eq!(groups[0].company_name, "範例工業");
        assert_eq!(groups[0].address, "臨海工業區");
        assert_eq!(groups[0].process_list.len(), 2);
    }

    #[test]
    fn process_list_keeps_input_order_and_duplicates() {
        let rows = vec![
            process_row("F01", "M02", ""),
            process_row("F01", "M01", ""),
            process_row("F01", "M02", ""),
        ];
        let groups = consolidate(&rows);
        assert_eq!(
            groups[0].process_list,
            vec!["M02 - 製程M02", "M01 - 製程M01", "M02 - 製程M02"]
        );
    }

    #[test]
    fn expiry_window_is_min_and_max_of_parsed_dates() {
        let rows = vec![
            process_row("F01", "M01", "2025-06-01"),
            process_row("F01", "M02", "2025-01-01"),
            process_row("F01", "M03", "2025-12-01"),
            process_row("F01", "M04", ""),
        ];
        let groups = consolidate(&rows);
        assert_eq!(groups[0].earliest_expiry.unwrap().to_string(), "2025-01-01");
        assert_eq!(groups[0].latest_expiry.unwrap().to_string(), "2025-12-01");
        assert!(groups[0].earliest_expiry <= groups[0].latest_expiry);
    }

    #[test]
    fn roc_expiry_cells_fold_into_the_same_window() {
        let rows = vec![
            process_row("F01", "M01", "114年01月31日"),
            process_row("F01", "M02", "2025-12-01"),
        ];
        let groups = consolidate(&rows);
        assert_eq!(groups[0].earliest_expiry.unwrap().to_string(), "2025-01-31");
        assert_eq!(groups[0].latest_expiry.unwrap().to_string(), "2025-12-01");
    }

    #[test]
    fn categories_and_permit_numbers_join_for_output() {
        let mut a = process_row("F01", "M01", "");
        a.category = "排放".to_string();
        a.permit_number = "P-1".to_string();
        let mut b = process_row("F01", "M02", "");
        b.category = "貯留".to_string();
        b.permit_number = "P-2".to_string();
        let mut c = process_row("F01", "M03", "");
        c.category = "排放".to_string();
        c.permit_number = "P-1".to_string();

        let groups = consolidate(&[a, b, c]);
        assert_eq!(groups[0].joined_categories(), "排放, 貯留");
        assert_eq!(groups[0].joined_permit_numbers(), "P-1\nP-2");
    }

    fn keyed_row(key: &str, payload: &str) -> Vec<String> {
        vec!["county".to_string(), key.to_string(), payload.to_string()]
    }

    #[test]
    fn dedupe_keeps_first_seen_per_key_in_order() {
        let rows = vec![
            keyed_row("A", "a1"),
            keyed_row("A", "a2"),
            keyed_row("B", "b1"),
            keyed_row("C", "c1"),
            keyed_row("C", "c2"),
            keyed_row("C", "c3"),
        ];
        let outcome = dedupe_rows(rows, COL_FACILITY_ID);
        assert_eq!(outcome.kept_unique, 3);
        assert_eq!(outcome.dropped, 3);
        let keys: Vec<&str> = outcome.rows.iter().map(|r| r[1].as_str()).collect();
        assert_eq!(keys, vec!["A", "B", "C"]);
        // first-seen payload survives
        assert_eq!(outcome.rows[0][2], "a1");
        assert_eq!(outcome.rows[2][2], "c1");
    }

    #[test]
    fn empty_key_rows_pass_through_unchanged() {
        let rows = vec![
            keyed_row("", "x1"),
            keyed_row("A", "a1"),
            keyed_row("", "x2"),
            keyed_row("A", "a2"),
        ];
        let outcome = dedupe_rows(rows, COL_FACILITY_ID);
        assert_eq!(outcome.empty_key, 2);
        assert_eq!(outcome.kept_unique, 1);
        assert_eq!(outcome.dropped, 1);
        let payloads: Vec<&str> = outcome.rows.iter().map(|r| r[2].as_str()).collect();
        assert_eq!(payloads, vec!["x1", "a1", "x2"]);
    }

    #[test]
    fn dedupe_counts_reconcile() {
        let rows = vec![
            keyed_row("A", "1"),
            keyed_row("", "2"),
            keyed_row("B", "3"),
            keyed_row("A", "4"),
        ];
        let outcome = dedupe_rows(rows, COL_FACILITY_ID);
        assert_eq!(outcome.total_seen, 4);
        let keyed = outcome.total_seen - outcome.empty_key;
        assert_eq!(outcome.kept_unique + outcome.dropped, keyed);
        assert_eq!(outcome.rows.len(), outcome.kept_unique + outcome.empty_key);
    }

    #[test]
    fn header_rows_are_recognized() {
        assert!(is_header_row(&[
            "county".to_string(),
            "ems_no".to_string(),
            "company_name".to_string(),
        ]));
        assert!(!is_header_row(&[
            "高雄市".to_string(),
            "F1500549".to_string(),
            "範例工業".to_string(),
        ]));
    }

    #[test]
    fn brief_lists_every_sheet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let summary = MigrationRunSummary {
            run_id: Uuid::new_v4(),
            kind: "dedupe".to_string(),
            input: "permits.xlsx".to_string(),
            output_dir: dir.path().display().to_string(),
            sheets: vec![
                SheetSummary { sheet: "小港區".to_string(), rows_in: 6, rows_out: 3 },
                SheetSummary { sheet: "total".to_string(), rows_in: 10, rows_out: 7 },
            ],
        };
        write_brief(dir.path(), &summary).expect("write brief");
        let brief = fs::read_to_string(dir.path().join("migration_brief.md")).expect("read brief");
        assert!(brief.contains("小港區: 6 rows in, 3 out"));
        assert!(brief.contains("total: 10 rows in, 7 out"));
    }

    #[test]
    fn row_from_short_cells_pads_with_empty() {
        let row = ProcessRow::from_cells(&["高雄市".to_string(), "F01".to_string()]);
        assert_eq!(row.facility_id, "F01");
        assert_eq!(row.expiry_date, "");
        assert_eq!(row.district, "");
    }
}
