//! Test utilities: in-memory ledgers and mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::chunk::{Chunk, ChunkId, ChunkStatus};
use crate::error::AppError;
use crate::models::{ExtractedFields, ResultRecord, WorkItem};
use crate::reporter::{PipelineEvent, PipelineReporter};
use crate::traits::{ChunkLedger, Extractor, Fetcher, ResultSink, WorkSource};

/// A work item shaped like a row of the input CSV.
pub fn test_item(index: u64) -> WorkItem {
    let url = format!("https://example.com/{index}");
    WorkItem::new(index, "Generic", url.clone())
        .with_field("platform", "Generic")
        .with_field("url", url)
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// Work source over a fixed list of items.
#[derive(Clone)]
pub struct MemorySource {
    items: Arc<Vec<WorkItem>>,
    columns: Vec<String>,
}

impl MemorySource {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            items: Arc::new(items),
            columns: vec!["platform".to_string(), "url".to_string()],
        }
    }

    /// `n` generic items with indices `0..n`.
    pub fn with_items(n: u64) -> Self {
        Self::new((0..n).map(test_item).collect())
    }
}

impl WorkSource for MemorySource {
    fn columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    async fn total(&self) -> Result<u64, AppError> {
        Ok(self.items.len() as u64)
    }

    async fn get(&self, index: u64) -> Result<WorkItem, AppError> {
        self.items
            .get(index as usize)
            .cloned()
            .ok_or_else(|| AppError::LedgerError(format!("no item at index {index}")))
    }

    async fn get_range(&self, start: u64, end: u64) -> Result<Vec<WorkItem>, AppError> {
        if end as usize > self.items.len() || start > end {
            return Err(AppError::LedgerError(format!(
                "range {start}..{end} out of bounds"
            )));
        }
        Ok(self.items[start as usize..end as usize].to_vec())
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Result sink that keeps rows in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<ResultRecord>>>,
    headers: Arc<Mutex<Option<Vec<String>>>>,
    /// Errors returned by the next appends, one per call.
    append_errors: Arc<Mutex<VecDeque<AppError>>>,
    /// Appends for this index always fail with a retryable error.
    failing_index: Option<u64>,
    pub append_calls: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink already holding successful rows for indices `0..n`.
    pub fn with_rows(n: u64) -> Self {
        let rows = (0..n)
            .map(|i| ResultRecord::succeeded(test_item(i), ExtractedFields::new(), 1))
            .collect();
        Self {
            rows: Arc::new(Mutex::new(rows)),
            ..Self::default()
        }
    }

    pub fn with_append_errors(self, errors: Vec<AppError>) -> Self {
        *self.append_errors.lock().unwrap() = errors.into();
        self
    }

    pub fn failing_at(mut self, index: u64) -> Self {
        self.failing_index = Some(index);
        self
    }

    /// Same rows, with the failing index cleared.
    pub fn repaired(&self) -> Self {
        Self {
            failing_index: None,
            ..self.clone()
        }
    }

    pub fn rows(&self) -> Vec<ResultRecord> {
        self.rows.lock().unwrap().clone()
    }

    pub fn indices(&self) -> Vec<u64> {
        self.rows.lock().unwrap().iter().map(|r| r.index).collect()
    }

    pub fn headers(&self) -> Option<Vec<String>> {
        self.headers.lock().unwrap().clone()
    }
}

impl ResultSink for MemorySink {
    async fn ensure_schema(&self, headers: &[String]) -> Result<(), AppError> {
        let mut current = self.headers.lock().unwrap();
        if current.is_none() {
            *current = Some(headers.to_vec());
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64, AppError> {
        Ok(self.rows.lock().unwrap().len() as u64)
    }

    async fn append(&self, record: &ResultRecord) -> Result<(), AppError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.append_errors.lock().unwrap().pop_front() {
            return Err(e);
        }
        if self.failing_index == Some(record.index) {
            return Err(AppError::SinkError {
                message: "disk quota exceeded".into(),
                retryable: true,
            });
        }
        self.rows.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryChunkLedger
// ---------------------------------------------------------------------------

/// Chunk ledger backed by a map, recording every status change.
#[derive(Clone, Default)]
pub struct MemoryChunkLedger {
    statuses: Arc<Mutex<BTreeMap<ChunkId, ChunkStatus>>>,
    pub history: Arc<Mutex<Vec<(ChunkId, ChunkStatus)>>>,
    /// Sizes of the `mark_all_done` batches received.
    pub batches: Arc<Mutex<Vec<usize>>>,
}

impl MemoryChunkLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(self, id: ChunkId, status: ChunkStatus) -> Self {
        self.statuses.lock().unwrap().insert(id, status);
        self
    }

    pub fn status_of(&self, start: u64) -> Option<ChunkStatus> {
        self.statuses
            .lock()
            .unwrap()
            .get(&ChunkId::from_start(start))
            .copied()
    }

    pub fn snapshot(&self) -> BTreeMap<ChunkId, ChunkStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

impl ChunkLedger for MemoryChunkLedger {
    async fn status(&self, id: ChunkId) -> Result<Option<ChunkStatus>, AppError> {
        Ok(self.statuses.lock().unwrap().get(&id).copied())
    }

    async fn set_status(&self, chunk: &Chunk, status: ChunkStatus) -> Result<(), AppError> {
        self.statuses.lock().unwrap().insert(chunk.id(), status);
        self.history.lock().unwrap().push((chunk.id(), status));
        Ok(())
    }

    async fn mark_all_done(&self, chunks: &[Chunk]) -> Result<(), AppError> {
        self.batches.lock().unwrap().push(chunks.len());
        for chunk in chunks {
            self.set_status(chunk, ChunkStatus::Done).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Scripted extractor.
///
/// Each index has an optional queue of responses; once it is empty the
/// extractor answers `{"media_title": "Title <index>"}`.
#[derive(Clone, Default)]
pub struct MockExtractor {
    scripts: Arc<Mutex<HashMap<u64, VecDeque<Result<ExtractedFields, AppError>>>>>,
    delays: HashMap<u64, Duration>,
    delay: Duration,
    cancel_after: Option<(usize, CancellationToken)>,
    /// Index of every call, in call order.
    pub calls: Arc<Mutex<Vec<u64>>>,
    /// `(index, "start" | "end")` in the order they happened.
    pub events: Arc<Mutex<Vec<(u64, &'static str)>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, index: u64, responses: Vec<Result<ExtractedFields, AppError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(index, responses.into());
        self
    }

    /// The first attempt on `index` fails with `error`.
    pub fn with_failure(self, index: u64, error: AppError) -> Self {
        self.with_script(index, vec![Err(error)])
    }

    /// Delay applied to every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Delay applied to calls for one index only.
    pub fn with_delay_for(mut self, index: u64, delay: Duration) -> Self {
        self.delays.insert(index, delay);
        self
    }

    /// Cancel `token` as soon as the `n`-th call starts.
    pub fn cancel_after(mut self, n: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((n, token));
        self
    }

    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, index: u64) -> usize {
        self.calls.lock().unwrap().iter().filter(|&&i| i == index).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Extractor for MockExtractor {
    fn fields(&self) -> &[&str] {
        &["media_title"]
    }

    async fn extract(&self, item: &WorkItem, _timeout: Duration) -> Result<ExtractedFields, AppError> {
        let call_no = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(item.index);
            calls.len()
        };
        self.events.lock().unwrap().push((item.index, "start"));
        if let Some((n, token)) = &self.cancel_after
            && call_no == *n
        {
            token.cancel();
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(&item.index).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().unwrap().push((item.index, "end"));

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&item.index)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(response) => response,
            None => {
                let mut fields = ExtractedFields::new();
                fields.insert("media_title".into(), format!("Title {}", item.index));
                Ok(fields)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that returns queued responses and records requested URLs.
#[derive(Clone)]
pub struct MockFetcher {
    /// Queue of responses. Each call pops the first element.
    /// If empty, returns a default HTML string.
    responses: Arc<Mutex<VecDeque<Result<String, AppError>>>>,
    pub requested: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new(html: &str) -> Self {
        Self::with_responses(vec![Ok(html.to_string())])
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            requested: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.requested.lock().unwrap().push(url.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("<html><body>default</body></html>".to_string()))
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock pipeline reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == label)
            .count()
    }
}

impl PipelineReporter for MockReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        let label = match &event {
            PipelineEvent::Started { .. } => "Started",
            PipelineEvent::AlreadyComplete { .. } => "AlreadyComplete",
            PipelineEvent::ChunkSkipped { .. } => "ChunkSkipped",
            PipelineEvent::ChunkStarted { .. } => "ChunkStarted",
            PipelineEvent::ItemStarted { .. } => "ItemStarted",
            PipelineEvent::ItemSucceeded { .. } => "ItemSucceeded",
            PipelineEvent::ItemFailed { .. } => "ItemFailed",
            PipelineEvent::Progress { .. } => "Progress",
            PipelineEvent::ChunkDone { .. } => "ChunkDone",
            PipelineEvent::Interrupted { .. } => "Interrupted",
            PipelineEvent::Finished { .. } => "Finished",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}
