//! CSV file as a [`ResultSink`].
//!
//! Every append is flushed and synced before it counts, so after a crash the
//! file holds exactly the committed rows plus, at worst, one partial record.
//! That record is cut off the next time the file is opened. A failed append
//! rolls the file back to where it started, so a retry never writes a row
//! twice.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use csv::{ReaderBuilder, Writer, WriterBuilder};
use harvest_core::error::AppError;
use harvest_core::models::ResultRecord;
use harvest_core::traits::ResultSink;

use crate::csv_source::csv_error;

const SCAN_BLOCK: usize = 64 * 1024;

#[derive(Clone)]
pub struct CsvResultSink {
    path: PathBuf,
    state: Arc<Mutex<SinkState>>,
}

struct SinkState {
    headers: Vec<String>,
    rows: u64,
    writer: Option<Writer<File>>,
}

impl CsvResultSink {
    /// Open (or create) the output file, repairing a torn last line.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let state = tokio::task::spawn_blocking(move || open_state(&open_path))
            .await
            .map_err(|e| AppError::LedgerError(format!("CSV open task failed: {e}")))??;

        tracing::info!(path = %path.display(), rows = state.rows, "Opened CSV result sink");
        Ok(Self {
            path,
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header row currently on disk, empty for a new file.
    pub fn headers(&self) -> Vec<String> {
        lock(&self.state).headers.clone()
    }

    async fn blocking<T, F>(&self, task: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&Path, &mut SinkState) -> Result<T, AppError> + Send + 'static,
    {
        let path = self.path.clone();
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || task(&path, &mut lock(&state)))
            .await
            .map_err(|e| AppError::SinkError {
                message: format!("CSV write task failed: {e}"),
                retryable: true,
            })?
    }
}

fn lock(state: &Mutex<SinkState>) -> MutexGuard<'_, SinkState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn open_state(path: &Path) -> Result<SinkState, AppError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    truncate_partial_record(&mut file, path)?;

    if file.metadata()?.len() == 0 {
        return Ok(SinkState {
            headers: Vec::new(),
            rows: 0,
            writer: None,
        });
    }

    file.seek(SeekFrom::Start(0))?;
    let mut reader = ReaderBuilder::new().flexible(true).from_reader(file);
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| csv_error(path, e))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut rows = 0u64;
    for record in reader.records() {
        record.map_err(|e| csv_error(path, e))?;
        rows += 1;
    }

    Ok(SinkState {
        headers,
        rows,
        writer: None,
    })
}

/// Byte offset just past the last complete record: a newline outside any
/// quoted field. Doubled quotes toggle twice, so escaping needs no special case.
fn last_record_end(file: &mut File) -> Result<u64, AppError> {
    file.seek(SeekFrom::Start(0))?;
    let mut block = vec![0u8; SCAN_BLOCK];
    let mut offset = 0u64;
    let mut keep = 0u64;
    let mut quoted = false;
    loop {
        let read = file.read(&mut block)?;
        if read == 0 {
            return Ok(keep);
        }
        for (at, &byte) in block[..read].iter().enumerate() {
            match byte {
                b'"' => quoted = !quoted,
                b'\n' if !quoted => keep = offset + at as u64 + 1,
                _ => {}
            }
        }
        offset += read as u64;
    }
}

/// Cut off a trailing record that was torn by an interrupted write.
fn truncate_partial_record(file: &mut File, path: &Path) -> Result<(), AppError> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let keep = last_record_end(file)?;
    if keep < len {
        tracing::warn!(
            path = %path.display(),
            dropped_bytes = len - keep,
            "Truncating partial trailing row left by an interrupted write"
        );
        file.set_len(keep)?;
        file.sync_data()?;
    }
    Ok(())
}

fn append_writer(path: &Path) -> Result<Writer<File>, AppError> {
    let file = OpenOptions::new().append(true).open(path)?;
    Ok(WriterBuilder::new().has_headers(false).from_writer(file))
}

fn sink_io(error: impl std::fmt::Display) -> AppError {
    AppError::SinkError {
        message: error.to_string(),
        retryable: true,
    }
}

impl ResultSink for CsvResultSink {
    async fn ensure_schema(&self, headers: &[String]) -> Result<(), AppError> {
        let headers = headers.to_vec();
        self.blocking(move |path, state| {
            if state.headers.is_empty() {
                let mut writer = append_writer(path)?;
                writer.write_record(&headers).map_err(|e| csv_error(path, e))?;
                writer.flush()?;
                writer.get_ref().sync_data()?;
                state.headers = headers;
                state.writer = Some(writer);
                return Ok(());
            }

            if state.headers != headers {
                return Err(AppError::ConfigError(format!(
                    "{} has columns [{}] but this run writes [{}]",
                    path.display(),
                    state.headers.join(", "),
                    headers.join(", ")
                )));
            }
            if state.writer.is_none() {
                state.writer = Some(append_writer(path)?);
            }
            Ok(())
        })
        .await
    }

    async fn count(&self) -> Result<u64, AppError> {
        Ok(lock(&self.state).rows)
    }

    async fn append(&self, record: &ResultRecord) -> Result<(), AppError> {
        let record = record.clone();
        self.blocking(move |path, state| {
            let row = record.to_row(&state.headers);
            commit_row(path, state, &row, write_synced)
        })
        .await
    }
}

fn write_synced(writer: &mut Writer<File>, row: &[String]) -> Result<(), AppError> {
    writer.write_record(row).map_err(sink_io)?;
    writer.flush().map_err(sink_io)?;
    writer.get_ref().sync_data().map_err(sink_io)
}

/// Run `write` for one row. On failure the writer and anything it buffered
/// are discarded and the file is cut back to its length before the attempt.
fn commit_row<W>(path: &Path, state: &mut SinkState, row: &[String], write: W) -> Result<(), AppError>
where
    W: FnOnce(&mut Writer<File>, &[String]) -> Result<(), AppError>,
{
    if state.headers.is_empty() {
        return Err(AppError::ConfigError(format!(
            "{}: append before ensure_schema",
            path.display()
        )));
    }
    let mut writer = match state.writer.take() {
        Some(writer) => writer,
        None => append_writer(path).map_err(sink_io)?,
    };
    let before = writer.get_ref().metadata().map_err(sink_io)?.len();

    match write(&mut writer, row) {
        Ok(()) => {
            state.writer = Some(writer);
            state.rows += 1;
            Ok(())
        }
        Err(error) => {
            // Dropping the writer may flush leftovers; the rollback removes them.
            drop(writer);
            rollback(path, before)?;
            Err(error)
        }
    }
}

fn rollback(path: &Path, len: u64) -> Result<(), AppError> {
    let restore = || -> std::io::Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(len)?;
        file.sync_data()
    };
    restore().map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "Could not roll back a failed append");
        AppError::SinkError {
            message: format!("{}: rollback after failed append: {e}", path.display()),
            retryable: false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::models::{ExtractedFields, WorkItem};
    use std::io::Write;

    fn headers() -> Vec<String> {
        ["platform", "url", "media_title", "processed_at", "status", "error"]
            .map(String::from)
            .to_vec()
    }

    fn record(index: u64) -> ResultRecord {
        let item = WorkItem::new(index, "YouTube", format!("https://example.com/{index}"))
            .with_field("platform", "YouTube")
            .with_field("url", format!("https://example.com/{index}"));
        let fields: ExtractedFields = [("media_title".to_string(), format!("Title, {index}"))].into();
        ResultRecord::succeeded(item, fields, 1)
    }

    #[tokio::test]
    async fn test_new_file_gets_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let sink = CsvResultSink::open(&path).await.unwrap();
        assert_eq!(sink.count().await.unwrap(), 0);

        sink.ensure_schema(&headers()).await.unwrap();
        sink.append(&record(0)).await.unwrap();
        sink.append(&record(1)).await.unwrap();
        assert_eq!(sink.count().await.unwrap(), 2);

        let reopened = CsvResultSink::open(&path).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 2);
        assert_eq!(reopened.headers(), headers());

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"Title, 1\""));
        assert!(text.starts_with("platform,url,media_title,processed_at,status,error\n"));
    }

    #[tokio::test]
    async fn test_reopen_appends_after_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        {
            let sink = CsvResultSink::open(&path).await.unwrap();
            sink.ensure_schema(&headers()).await.unwrap();
            sink.append(&record(0)).await.unwrap();
        }
        let sink = CsvResultSink::open(&path).await.unwrap();
        sink.ensure_schema(&headers()).await.unwrap();
        sink.append(&record(1)).await.unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let urls: Vec<String> = reader
            .records()
            .map(|r| r.unwrap()[1].to_string())
            .collect();
        assert_eq!(urls, vec!["https://example.com/0", "https://example.com/1"]);
    }

    #[tokio::test]
    async fn test_partial_last_line_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        {
            let sink = CsvResultSink::open(&path).await.unwrap();
            sink.ensure_schema(&headers()).await.unwrap();
            sink.append(&record(0)).await.unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "YouTube,https://example.com/1,Tit").unwrap();
        drop(file);

        let sink = CsvResultSink::open(&path).await.unwrap();
        assert_eq!(sink.count().await.unwrap(), 1);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[tokio::test]
    async fn test_torn_quoted_field_with_newline_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        {
            let sink = CsvResultSink::open(&path).await.unwrap();
            sink.ensure_schema(&headers()).await.unwrap();
            sink.append(&record(0)).await.unwrap();
        }
        let committed = std::fs::read_to_string(&path).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "Generic,https://e.com/1,\"Line one\nLine tw").unwrap();
        drop(file);

        let sink = CsvResultSink::open(&path).await.unwrap();
        assert_eq!(sink.count().await.unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), committed);
    }

    #[tokio::test]
    async fn test_torn_record_ending_inside_quotes_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        {
            let sink = CsvResultSink::open(&path).await.unwrap();
            sink.ensure_schema(&headers()).await.unwrap();
            sink.append(&record(0)).await.unwrap();
        }
        let committed = std::fs::read_to_string(&path).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "Generic,https://e.com/1,\"Line one\n").unwrap();
        drop(file);

        let sink = CsvResultSink::open(&path).await.unwrap();
        assert_eq!(sink.count().await.unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), committed);
    }

    #[tokio::test]
    async fn test_multiline_and_quoted_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        {
            let sink = CsvResultSink::open(&path).await.unwrap();
            sink.ensure_schema(&headers()).await.unwrap();
            let mut multiline = record(0);
            multiline
                .fields
                .insert("media_title".into(), "Line one\nLine \"two\"".into());
            sink.append(&multiline).await.unwrap();
            sink.append(&record(1)).await.unwrap();
        }

        let sink = CsvResultSink::open(&path).await.unwrap();
        assert_eq!(sink.count().await.unwrap(), 2);
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let first = reader.records().next().unwrap().unwrap();
        assert_eq!(&first[2], "Line one\nLine \"two\"");
    }

    #[tokio::test]
    async fn test_failed_append_is_rolled_back_before_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let sink = CsvResultSink::open(&path).await.unwrap();
        sink.ensure_schema(&headers()).await.unwrap();
        sink.append(&record(0)).await.unwrap();
        let committed = std::fs::read_to_string(&path).unwrap();

        let row = record(1).to_row(&headers());
        let flushed_then_failed = {
            let mut state = lock(&sink.state);
            commit_row(&path, &mut state, &row, |writer, row| {
                writer.write_record(row).map_err(sink_io)?;
                writer.flush().map_err(sink_io)?;
                Err(sink_io("sync failed"))
            })
        };
        assert!(matches!(
            flushed_then_failed,
            Err(AppError::SinkError { retryable: true, .. })
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), committed);

        let buffered_then_failed = {
            let mut state = lock(&sink.state);
            commit_row(&path, &mut state, &row, |writer, row| {
                writer.write_record(row).map_err(sink_io)?;
                Err(sink_io("flush failed"))
            })
        };
        assert!(buffered_then_failed.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), committed);
        assert_eq!(sink.count().await.unwrap(), 1);

        sink.append(&record(1)).await.unwrap();
        assert_eq!(sink.count().await.unwrap(), 2);

        let reopened = CsvResultSink::open(&path).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 2);
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let urls: Vec<String> = reader
            .records()
            .map(|r| r.unwrap()[1].to_string())
            .collect();
        assert_eq!(urls, vec!["https://example.com/0", "https://example.com/1"]);
    }

    #[tokio::test]
    async fn test_header_mismatch_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();

        let sink = CsvResultSink::open(&path).await.unwrap();
        assert_eq!(sink.count().await.unwrap(), 1);
        let err = sink.ensure_schema(&headers()).await.unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_append_without_schema_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvResultSink::open(dir.path().join("out.csv")).await.unwrap();
        assert!(sink.append(&record(0)).await.is_err());
    }
}
