use crate::config::WarehouseSettings;
use crate::models::{
    ERROR_COLUMN, IDENTIFIER_COLUMNS, MARKETPLACE_SKU_COLUMN, RECORD_ID_COLUMN, RowStatus, RowUpdate, STATUS_COLUMN,
    StatusSummary, TRACKED_COLUMNS, UpdateMode, WAREHOUSE_COLUMN,
};
use calamine::{Reader, open_workbook_auto};
use rust_xlsxwriter::{Workbook, XlsxError};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DataError {
    #[error("missing required column `{0}`")]
    MissingColumn(String),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to read {}: {source}", path.display())]
    ReadWorkbook {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    WriteWorkbook {
        path: PathBuf,
        #[source]
        source: XlsxError,
    },
    #[error("{} has no worksheet", path.display())]
    EmptyWorkbook { path: PathBuf },
    #[error("failed to replace {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// On-disk table format, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    /// Read from xlsx/xlsm/xls/ods, always written as xlsx.
    Workbook,
}

impl TableFormat {
    pub fn of(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => TableFormat::Workbook,
            _ => TableFormat::Csv,
        }
    }
}

/// `<dir>/<stem>_result.<ext>` next to the source file. Workbook inputs
/// produce an `.xlsx` result.
pub fn result_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match (TableFormat::of(source), source.extension()) {
        (TableFormat::Workbook, _) => format!("{stem}_result.xlsx"),
        (TableFormat::Csv, Some(ext)) => format!("{stem}_result.{}", ext.to_string_lossy()),
        (TableFormat::Csv, None) => format!("{stem}_result"),
    };
    source.with_file_name(name)
}

/// Header names compare case-insensitively after trimming.
pub fn normalize_header(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Trims and drops a trailing `.0` that spreadsheet tools add to numeric ids.
pub fn normalize_identifier(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(digits) = trimmed.strip_suffix(".0")
        && !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit())
    {
        return digits.to_string();
    }
    trimmed.to_string()
}

/// Rows indexed by position. Each worker writes only its own row's tracked
/// columns, and only through the orchestrator's lock.
#[derive(Debug, Clone)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
    identifier: usize,
}

impl Dataset {
    /// Loads the source table, then overlays tracked columns from a previous
    /// result file when one exists.
    pub fn open(
        source: &Path,
        previous: &Path,
        mode: UpdateMode,
        warehouse: &WarehouseSettings,
    ) -> Result<Self, DataError> {
        let mut dataset = Self::load(source, mode, warehouse)?;
        if previous.is_file() {
            match dataset.merge_previous(previous, mode, warehouse) {
                Ok(merged) => {
                    info!(target = "bulk.dataset", path = %previous.display(), merged, "resumed from previous result");
                }
                Err(err) => {
                    warn!(target = "bulk.dataset", path = %previous.display(), error = %err, "resume merge failed");
                }
            }
        }
        Ok(dataset)
    }

    pub fn load(
        source: &Path,
        mode: UpdateMode,
        warehouse: &WarehouseSettings,
    ) -> Result<Self, DataError> {
        let (columns, rows) = read_table(source)?;
        let identifier = IDENTIFIER_COLUMNS
            .iter()
            .find_map(|name| columns.iter().position(|c| c.as_str() == *name))
            .ok_or_else(|| DataError::MissingColumn(IDENTIFIER_COLUMNS.join("` or `")))?;

        let mut dataset = Self {
            columns,
            rows,
            identifier,
        };
        for required in mode.required_columns() {
            if dataset.column(required).is_none() {
                return Err(DataError::MissingColumn(required.to_string()));
            }
        }
        for tracked in TRACKED_COLUMNS {
            dataset.ensure_column(tracked);
        }
        dataset.normalize(mode, warehouse);
        debug!(target = "bulk.dataset", path = %source.display(), rows = dataset.len(), "source loaded");
        Ok(dataset)
    }

    fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column(name) {
            return idx;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(String::new());
        }
        self.columns.len() - 1
    }

    fn normalize(&mut self, mode: UpdateMode, warehouse: &WarehouseSettings) {
        let identifier = self.identifier;
        let mut targets = vec![identifier];
        targets.extend(
            mode.required_columns()
                .iter()
                .chain([MARKETPLACE_SKU_COLUMN].iter())
                .filter_map(|name| self.column(name)),
        );
        let warehouse_idx = self.column(WAREHOUSE_COLUMN);
        let store_front = warehouse.store_front.as_str();

        for row in &mut self.rows {
            for &idx in &targets {
                row[idx] = normalize_identifier(&row[idx]);
            }
            if mode != UpdateMode::Warehouse {
                continue;
            }
            let id = &mut row[identifier];
            if !store_front.is_empty() && !id.is_empty() && !id.starts_with(store_front) {
                *id = format!("{store_front}{id}");
            }
            if let Some(idx) = warehouse_idx
                && let Some(replacement) = warehouse.replace_dict.get(&row[idx])
            {
                row[idx] = replacement.clone();
            }
        }
    }

    /// Overlays non-empty tracked values from `previous`, keyed by identifier.
    /// Returns how many source rows matched.
    pub fn merge_previous(
        &mut self,
        previous: &Path,
        mode: UpdateMode,
        warehouse: &WarehouseSettings,
    ) -> Result<usize, DataError> {
        let prior = Self::load(previous, mode, warehouse)?;
        let mut by_id: HashMap<&str, usize> = HashMap::new();
        for idx in 0..prior.len() {
            let id = prior.identifier(idx);
            if !id.is_empty() {
                by_id.entry(id).or_insert(idx);
            }
        }

        let mut merged = 0;
        for idx in 0..self.rows.len() {
            let Some(&prior_idx) = by_id.get(self.identifier(idx)) else {
                continue;
            };
            merged += 1;
            for tracked in TRACKED_COLUMNS {
                let value = prior.value(prior_idx, tracked);
                if !value.is_empty() {
                    self.set(idx, tracked, value.to_string());
                }
            }
        }
        Ok(merged)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[cfg(test)]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        let name = normalize_header(name);
        self.columns.iter().position(|c| *c == name)
    }

    pub fn identifier(&self, row: usize) -> &str {
        &self.rows[row][self.identifier]
    }

    /// Empty when the column does not exist.
    pub fn value(&self, row: usize, column: &str) -> &str {
        self.column(column)
            .map(|idx| self.rows[row][idx].as_str())
            .unwrap_or("")
    }

    fn set(&mut self, row: usize, column: &str, value: String) {
        let idx = self.ensure_column(column);
        self.rows[row][idx] = value;
    }

    pub fn status(&self, row: usize) -> RowStatus {
        RowStatus::parse(self.value(row, STATUS_COLUMN))
    }

    /// Rows currently eligible for status polling.
    pub fn updating_rows(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|&idx| self.status(idx) == RowStatus::Updating)
            .collect()
    }

    pub fn summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for idx in 0..self.len() {
            summary.record(self.status(idx));
        }
        summary
    }

    /// Writes a worker's outcome into the row's tracked columns. A new
    /// record id replaces the old one; the error column is cleared unless
    /// the update carries a message.
    pub fn apply(&mut self, row: usize, update: &RowUpdate) {
        self.set(row, STATUS_COLUMN, update.status.as_str().to_string());
        if let Some(record_id) = &update.record_id {
            self.set(row, RECORD_ID_COLUMN, record_id.clone());
        }
        match &update.error_message {
            Some(message) => self.set(row, ERROR_COLUMN, message.clone()),
            None if update.status != RowStatus::Failed => self.set(row, ERROR_COLUMN, String::new()),
            None => {}
        }
    }

    /// Full snapshot. Written to a sibling temp file first so an
    /// interrupted write never leaves a truncated result behind.
    pub fn save(&self, path: &Path) -> Result<(), DataError> {
        let tmp = path.with_file_name(format!(
            ".{}.tmp",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        match TableFormat::of(path) {
            TableFormat::Csv => self.write_csv(&tmp)?,
            TableFormat::Workbook => self.write_workbook(&tmp)?,
        }
        fs::rename(&tmp, path).map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(target = "bulk.dataset", path = %path.display(), rows = self.len(), "snapshot saved");
        Ok(())
    }

    fn write_csv(&self, path: &Path) -> Result<(), DataError> {
        let write_err = |source| DataError::Write {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = csv::Writer::from_path(path).map_err(write_err)?;
        writer.write_record(&self.columns).map_err(write_err)?;
        for row in &self.rows {
            writer.write_record(row).map_err(write_err)?;
        }
        writer.flush().map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Every cell is written as text so identifiers keep their exact form.
    fn write_workbook(&self, path: &Path) -> Result<(), DataError> {
        let write_err = |source| DataError::WriteWorkbook {
            path: path.to_path_buf(),
            source,
        };
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        for (row_idx, row) in std::iter::once(&self.columns).chain(&self.rows).enumerate() {
            let row_idx = u32::try_from(row_idx).map_err(|_| write_err(XlsxError::RowColumnLimitError))?;
            for (col_idx, cell) in row.iter().enumerate() {
                if cell.is_empty() {
                    continue;
                }
                let col_idx = u16::try_from(col_idx).map_err(|_| write_err(XlsxError::RowColumnLimitError))?;
                sheet.write_string(row_idx, col_idx, cell).map_err(write_err)?;
            }
        }
        workbook.save(path).map_err(write_err)
    }
}

fn read_table(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>), DataError> {
    let (header, records) = match TableFormat::of(path) {
        TableFormat::Csv => read_csv(path)?,
        TableFormat::Workbook => read_workbook(path)?,
    };
    let columns: Vec<String> = header.iter().map(|h| normalize_header(h)).collect();
    let mut rows = Vec::new();
    for mut row in records {
        row.resize(columns.len(), String::new());
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        rows.push(row);
    }
    Ok((columns, rows))
}

type RawTable = (Vec<String>, Vec<Vec<String>>);

fn read_csv(path: &Path) -> Result<RawTable, DataError> {
    let read_err = |source| DataError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(read_err)?;
    let header = reader
        .headers()
        .map_err(read_err)?
        .iter()
        .map(str::to_string)
        .collect();
    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(read_err)?;
        records.push(record.iter().map(str::to_string).collect());
    }
    Ok((header, records))
}

/// First worksheet only; the first row holds the headers.
fn read_workbook(path: &Path) -> Result<RawTable, DataError> {
    let read_err = |source| DataError::ReadWorkbook {
        path: path.to_path_buf(),
        source,
    };
    let mut workbook = open_workbook_auto(path).map_err(read_err)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| DataError::EmptyWorkbook {
            path: path.to_path_buf(),
        })?
        .map_err(read_err)?;
    let mut rows = range
        .rows()
        .map(|cells| cells.iter().map(|cell| cell.to_string()).collect::<Vec<_>>());
    let header = rows.next().unwrap_or_default();
    Ok((header, rows.collect()))
}
