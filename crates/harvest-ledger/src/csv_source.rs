//! CSV file as a [`WorkSource`].
//!
//! Opening the file scans it once to count rows and remember the byte
//! position of every [`SEEK_STRIDE`]th row. Range reads seek to the nearest
//! remembered position, so memory stays proportional to `rows / stride`
//! and no row is held after it has been handed out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use csv::{Position, ReaderBuilder, StringRecord};
use harvest_core::error::AppError;
use harvest_core::models::WorkItem;
use harvest_core::traits::WorkSource;

pub const SEEK_STRIDE: u64 = 1024;
pub const DEFAULT_CATEGORY_COLUMN: &str = "platform";
pub const DEFAULT_TARGET_COLUMN: &str = "url";

/// Which input columns hold the category and the target URL.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    pub category: String,
    pub target: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            category: DEFAULT_CATEGORY_COLUMN.into(),
            target: DEFAULT_TARGET_COLUMN.into(),
        }
    }
}

#[derive(Clone)]
pub struct CsvWorkSource {
    path: PathBuf,
    headers: Arc<Vec<String>>,
    category_at: Option<usize>,
    target_at: usize,
    total: u64,
    seek_index: Arc<Vec<Position>>,
}

impl CsvWorkSource {
    pub async fn open(path: impl AsRef<Path>, mapping: ColumnMapping) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        let scan_path = path.clone();
        let (headers, total, seek_index) = tokio::task::spawn_blocking(move || scan(&scan_path))
            .await
            .map_err(|e| AppError::LedgerError(format!("CSV scan task failed: {e}")))??;

        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };
        let target_at = find(&mapping.target).ok_or_else(|| {
            AppError::ConfigError(format!(
                "{} has no '{}' column (columns: {})",
                path.display(),
                mapping.target,
                headers.join(", ")
            ))
        })?;
        let category_at = find(&mapping.category);
        if category_at.is_none() {
            tracing::warn!(
                path = %path.display(),
                column = %mapping.category,
                "No category column, platform will be inferred from each URL"
            );
        }

        tracing::info!(path = %path.display(), rows = total, "Opened CSV work source");
        Ok(Self {
            path,
            headers: Arc::new(headers),
            category_at,
            target_at,
            total,
            seek_index: Arc::new(seek_index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn item(&self, index: u64, record: &StringRecord) -> WorkItem {
        let value = |at: usize| record.get(at).unwrap_or_default().trim().to_string();
        let category = self.category_at.map(value).unwrap_or_default();
        let target = value(self.target_at);

        self.headers
            .iter()
            .enumerate()
            .fold(WorkItem::new(index, category, target), |item, (at, name)| {
                item.with_field(name.clone(), record.get(at).unwrap_or_default())
            })
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<WorkItem>, AppError> {
        let anchor = start / SEEK_STRIDE;
        let position = self
            .seek_index
            .get(anchor as usize)
            .cloned()
            .ok_or_else(|| AppError::LedgerError(format!("no seek position for row {start}")))?;

        let file = std::fs::File::open(&self.path)?;
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);
        reader.seek(position).map_err(|e| csv_error(&self.path, e))?;

        let skip = (start - anchor * SEEK_STRIDE) as usize;
        let take = (end - start) as usize;
        let mut items = Vec::with_capacity(take);
        for (offset, record) in reader.records().skip(skip).take(take).enumerate() {
            let record = record.map_err(|e| csv_error(&self.path, e))?;
            items.push(self.item(start + offset as u64, &record));
        }

        if items.len() != take {
            return Err(AppError::LedgerError(format!(
                "{} changed while open: expected rows {start}..{end}, read {}",
                self.path.display(),
                items.len()
            )));
        }
        Ok(items)
    }
}

/// One pass over the file: headers, row count, sparse seek positions.
fn scan(path: &Path) -> Result<(Vec<String>, u64, Vec<Position>), AppError> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| csv_error(path, e))?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| csv_error(path, e))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() || headers.iter().all(String::is_empty) {
        return Err(AppError::ConfigError(format!(
            "{} has no header row",
            path.display()
        )));
    }

    let mut seek_index = Vec::new();
    let mut total = 0u64;
    let mut record = StringRecord::new();
    loop {
        if total % SEEK_STRIDE == 0 {
            seek_index.push(reader.position().clone());
        }
        if !reader.read_record(&mut record).map_err(|e| csv_error(path, e))? {
            break;
        }
        total += 1;
    }
    Ok((headers, total, seek_index))
}

pub(crate) fn csv_error(path: &Path, error: csv::Error) -> AppError {
    AppError::LedgerError(format!("{}: {error}", path.display()))
}

impl WorkSource for CsvWorkSource {
    fn columns(&self) -> Vec<String> {
        self.headers.as_ref().clone()
    }

    async fn total(&self) -> Result<u64, AppError> {
        Ok(self.total)
    }

    async fn get(&self, index: u64) -> Result<WorkItem, AppError> {
        self.get_range(index, index + 1)
            .await?
            .pop()
            .ok_or_else(|| AppError::LedgerError(format!("row {index} not found")))
    }

    async fn get_range(&self, start: u64, end: u64) -> Result<Vec<WorkItem>, AppError> {
        if start >= end {
            return Ok(Vec::new());
        }
        if end > self.total {
            return Err(AppError::LedgerError(format!(
                "rows {start}..{end} out of range, {} has {} rows",
                self.path.display(),
                self.total
            )));
        }
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.read_range(start, end))
            .await
            .map_err(|e| AppError::LedgerError(format!("CSV read task failed: {e}")))?
    }
}
