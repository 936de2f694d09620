use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Output column holding the RFC 3339 processing timestamp.
pub const PROCESSED_AT_COLUMN: &str = "processed_at";
/// Output column holding `ok` or `failed`.
pub const STATUS_COLUMN: &str = "status";
/// Output column holding `<kind>: <message>` for failure rows.
pub const ERROR_COLUMN: &str = "error";

/// Bookkeeping columns appended after every input and extracted column.
pub const RECORD_META_COLUMNS: [&str; 3] = [PROCESSED_AT_COLUMN, STATUS_COLUMN, ERROR_COLUMN];

/// Fields produced by an extractor, keyed by output column name.
pub type ExtractedFields = BTreeMap<String, String>;

/// One unit of work: a row of the input ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// 0-based position in the work source.
    pub index: u64,
    /// Platform / category label (e.g. "YouTube").
    pub category: String,
    /// The URL to extract from.
    pub target: String,
    /// Every input column by name, including the category and target columns.
    pub fields: BTreeMap<String, String>,
}

impl WorkItem {
    pub fn new(index: u64, category: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            index,
            category: category.into(),
            target: target.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Whether a record holds extracted data or a terminal failure marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RecordOutcome {
    Ok,
    Failed { kind: String, message: String },
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Ok => "ok",
            RecordOutcome::Failed { .. } => "failed",
        }
    }

    /// The `error` column value: empty for successes.
    pub fn error_text(&self) -> String {
        match self {
            RecordOutcome::Ok => String::new(),
            RecordOutcome::Failed { kind, message } => format!("{kind}: {message}"),
        }
    }
}

/// The persisted outcome for one [`WorkItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub index: u64,
    pub category: String,
    pub target: String,
    /// Input fields merged with extracted fields.
    pub fields: BTreeMap<String, String>,
    pub outcome: RecordOutcome,
    /// Number of extraction attempts spent on this item.
    pub attempts: u32,
    pub processed_at: DateTime<Utc>,
}

impl ResultRecord {
    /// Build a success record. Extracted values only fill input columns
    /// that are missing or blank.
    pub fn succeeded(item: WorkItem, extracted: ExtractedFields, attempts: u32) -> Self {
        let WorkItem {
            index,
            category,
            target,
            mut fields,
        } = item;

        for (name, value) in extracted {
            match fields.get(&name) {
                Some(existing) if !existing.trim().is_empty() => {}
                _ => {
                    fields.insert(name, value);
                }
            }
        }

        Self {
            index,
            category,
            target,
            fields,
            outcome: RecordOutcome::Ok,
            attempts,
            processed_at: Utc::now(),
        }
    }

    /// Build a terminal-failure record carrying the original input fields.
    pub fn failed(item: WorkItem, error: &AppError, attempts: u32) -> Self {
        Self {
            index: item.index,
            category: item.category,
            target: item.target,
            fields: item.fields,
            outcome: RecordOutcome::Failed {
                kind: error.kind().to_string(),
                message: error.to_string(),
            },
            attempts,
            processed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RecordOutcome::Ok
    }

    /// Value written under the given output column.
    pub fn column(&self, name: &str) -> String {
        match name {
            PROCESSED_AT_COLUMN => self
                .processed_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            STATUS_COLUMN => self.outcome.as_str().to_string(),
            ERROR_COLUMN => self.outcome.error_text(),
            _ => self.fields.get(name).cloned().unwrap_or_default(),
        }
    }

    /// Render the record as one row in `headers` order.
    pub fn to_row(&self, headers: &[String]) -> Vec<String> {
        headers.iter().map(|h| self.column(h)).collect()
    }
}

/// Output header list: input columns, then extractor fields not already
/// present, then the bookkeeping columns.
pub fn output_headers(input_columns: &[String], extractor_fields: &[&str]) -> Vec<String> {
    let mut headers: Vec<String> = Vec::with_capacity(input_columns.len() + extractor_fields.len() + 3);
    let extra = input_columns
        .iter()
        .map(String::as_str)
        .chain(extractor_fields.iter().copied())
        .chain(RECORD_META_COLUMNS);
    for name in extra {
        if !headers.iter().any(|h| h == name) {
            headers.push(name.to_string());
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        WorkItem::new(7, "YouTube", "https://youtube.com/watch?v=abc")
            .with_field("platform", "YouTube")
            .with_field("url", "https://youtube.com/watch?v=abc")
            .with_field("account", "Kept Channel")
            .with_field("media_title", "")
    }

    #[test]
    fn success_fills_only_blank_fields() {
        let mut extracted = ExtractedFields::new();
        extracted.insert("account".into(), "Scraped Channel".into());
        extracted.insert("media_title".into(), "Video".into());
        extracted.insert("media_length".into(), "3:07".into());

        let record = ResultRecord::succeeded(item(), extracted, 1);

        assert_eq!(record.column("account"), "Kept Channel");
        assert_eq!(record.column("media_title"), "Video");
        assert_eq!(record.column("media_length"), "3:07");
        assert_eq!(record.column(STATUS_COLUMN), "ok");
        assert_eq!(record.column(ERROR_COLUMN), "");
        assert!(record.is_success());
    }

    #[test]
    fn failure_keeps_input_and_marks_error() {
        let err = AppError::InvalidItem("empty url".into());
        let record = ResultRecord::failed(item(), &err, 1);

        assert!(!record.is_success());
        assert_eq!(record.index, 7);
        assert_eq!(record.column("account"), "Kept Channel");
        assert_eq!(record.column(STATUS_COLUMN), "failed");
        assert_eq!(record.column(ERROR_COLUMN), "invalid_item: Invalid item: empty url");
    }

    #[test]
    fn to_row_follows_header_order() {
        let record = ResultRecord::succeeded(item(), ExtractedFields::new(), 1);
        let headers = vec!["url".to_string(), "unknown".to_string(), STATUS_COLUMN.to_string()];
        assert_eq!(
            record.to_row(&headers),
            vec!["https://youtube.com/watch?v=abc", "", "ok"]
        );
    }

    #[test]
    fn output_headers_dedupe_and_append_meta() {
        let input = vec!["platform".to_string(), "url".to_string(), "account".to_string()];
        let headers = output_headers(&input, &["account", "media_title"]);
        assert_eq!(
            headers,
            vec![
                "platform",
                "url",
                "account",
                "media_title",
                PROCESSED_AT_COLUMN,
                STATUS_COLUMN,
                ERROR_COLUMN
            ]
        );
    }

    #[test]
    fn processed_at_is_rfc3339() {
        let record = ResultRecord::succeeded(item(), ExtractedFields::new(), 1);
        let ts = record.column(PROCESSED_AT_COLUMN);
        assert!(DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
