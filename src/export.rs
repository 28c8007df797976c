//! Spreadsheet export for report tables.

use chrono::Utc;
use rusqlite::Connection;
use rust_xlsxwriter::{Format, Workbook, Worksheet};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::db;

const EXPORT_DIR: &str = "exports";
/// Excel caps sheet names at 31 characters.
const MAX_SHEET_NAME: usize = 31;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Text(String),
    Number(f64),
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Number(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Number(value as f64)
    }
}

/// A titled grid of cells, one sheet per table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportTable {
    pub title: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl ReportTable {
    pub fn new(title: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            title: title.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<Cell>) {
        self.rows.push(row);
    }
}

fn sheet_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\'))
        .take(MAX_SHEET_NAME)
        .collect();
    if cleaned.trim().is_empty() {
        "Report".to_string()
    } else {
        cleaned
    }
}

fn write_sheet(table: &ReportTable) -> Result<Worksheet, String> {
    let mut worksheet = Worksheet::new();
    worksheet
        .set_name(sheet_name(&table.title))
        .map_err(|e| format!("sheet name: {e}"))?;

    let header = Format::new().set_bold();
    for (col, name) in table.columns.iter().enumerate() {
        worksheet
            .write_string_with_format(0, col as u16, name, &header)
            .map_err(|e| format!("write header: {e}"))?;
        worksheet
            .set_column_width(col as u16, (name.len().max(10) + 2) as f64)
            .map_err(|e| format!("column width: {e}"))?;
    }

    for (r, row) in table.rows.iter().enumerate() {
        let row_idx = (r + 1) as u32;
        for (c, cell) in row.iter().enumerate() {
            match cell {
                Cell::Text(text) => worksheet.write_string(row_idx, c as u16, text),
                Cell::Number(n) => worksheet.write_number(row_idx, c as u16, *n),
            }
            .map_err(|e| format!("write cell: {e}"))?;
        }
    }
    Ok(worksheet)
}

/// Build an xlsx workbook in memory, one sheet per table.
pub fn to_xlsx(tables: &[ReportTable]) -> Result<Vec<u8>, String> {
    if tables.is_empty() {
        return Err("Nothing to export".into());
    }
    let mut workbook = Workbook::new();
    for table in tables {
        workbook.push_worksheet(write_sheet(table)?);
    }
    workbook
        .save_to_buffer()
        .map_err(|e| format!("xlsx encode: {e}"))
}

fn slug(title: &str) -> String {
    let mut out = String::new();
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "report".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Write the workbook to `{data_dir}/exports/{slug}-{timestamp}.xlsx`.
pub fn write_xlsx(
    conn: &Connection,
    data_dir: &Path,
    name: &str,
    tables: &[ReportTable],
) -> Result<PathBuf, String> {
    let bytes = to_xlsx(tables)?;
    let dir = data_dir.join(EXPORT_DIR);
    fs::create_dir_all(&dir).map_err(|e| format!("create export dir: {e}"))?;
    let path = dir.join(format!(
        "{}-{}.xlsx",
        slug(name),
        Utc::now().format("%Y%m%d-%H%M%S")
    ));
    fs::write(&path, &bytes).map_err(|e| format!("write export: {e}"))?;
    db::log_generated_file(conn, "report", None, &path)?;
    info!(path = %path.display(), bytes = bytes.len(), "Report exported");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ReportTable {
        let mut table = ReportTable::new("Revenue: May/2026", &["Category", "Net"]);
        table.push(vec!["MPV".into(), 1_200_000.0.into()]);
        table.push(vec!["SUV".into(), 800_000.0.into()]);
        table
    }

    #[test]
    fn workbook_is_a_zip_container() {
        let bytes = to_xlsx(&[sample()]).unwrap();
        assert!(bytes.len() > 100);
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn empty_export_is_rejected() {
        assert!(to_xlsx(&[]).is_err());
    }

    #[test]
    fn sheet_names_drop_forbidden_characters() {
        assert_eq!(sheet_name("Revenue: May/2026"), "Revenue May2026");
        assert_eq!(sheet_name("???"), "Report");
        assert_eq!(sheet_name(&"x".repeat(40)).len(), MAX_SHEET_NAME);
    }

    #[test]
    fn slug_is_file_safe() {
        assert_eq!(slug("Fleet utilization (May)"), "fleet-utilization-may");
        assert_eq!(slug("***"), "report");
    }

    #[test]
    fn write_xlsx_lands_in_exports_dir() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();

        let path = write_xlsx(&conn, dir.path(), "Revenue summary", &[sample()]).unwrap();
        assert!(path.starts_with(dir.path().join("exports")));
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("revenue-summary-") && n.ends_with(".xlsx")));
        assert!(fs::metadata(&path).unwrap().len() > 0);
    }
}
