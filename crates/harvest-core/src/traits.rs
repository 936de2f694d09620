use std::future::Future;
use std::time::Duration;

use crate::chunk::{Chunk, ChunkId, ChunkStatus};
use crate::error::AppError;
use crate::models::{ExtractedFields, ResultRecord, WorkItem};

/// Fetches raw HTML content from a URL.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Extracts structured fields for one work item.
///
/// Implementations must not keep state between calls that would make the
/// result depend on processing order.
pub trait Extractor: Send + Sync + Clone {
    /// Output columns this extractor may fill.
    fn fields(&self) -> &[&str];

    /// Extract fields for `item`. `timeout` is the per-item budget; callers
    /// also enforce it as a hard limit.
    fn extract(
        &self,
        item: &WorkItem,
        timeout: Duration,
    ) -> impl Future<Output = Result<ExtractedFields, AppError>> + Send;
}

/// Read-only, indexed view over the input ledger.
pub trait WorkSource: Send + Sync {
    /// Ordered input column names.
    fn columns(&self) -> Vec<String>;

    fn total(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn get(&self, index: u64) -> impl Future<Output = Result<WorkItem, AppError>> + Send;

    /// Items `[start, end)` in index order.
    fn get_range(
        &self,
        start: u64,
        end: u64,
    ) -> impl Future<Output = Result<Vec<WorkItem>, AppError>> + Send;
}

/// Append-only, countable view over the output ledger.
///
/// `count` must reflect every committed append exactly, including across
/// process restarts. `append` may be retried after an ambiguous failure.
pub trait ResultSink: Send + Sync {
    /// Idempotent; called once at startup with the full output header list.
    fn ensure_schema(&self, headers: &[String])
    -> impl Future<Output = Result<(), AppError>> + Send;

    fn count(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn append(&self, record: &ResultRecord) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Durable chunk id → status map for chunked-parallel runs.
pub trait ChunkLedger: Send + Sync {
    fn status(
        &self,
        id: ChunkId,
    ) -> impl Future<Output = Result<Option<ChunkStatus>, AppError>> + Send;

    fn set_status(
        &self,
        chunk: &Chunk,
        status: ChunkStatus,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn is_done(&self, id: ChunkId) -> impl Future<Output = Result<bool, AppError>> + Send {
        async move { Ok(self.status(id).await? == Some(ChunkStatus::Done)) }
    }

    fn mark_done(&self, chunk: &Chunk) -> impl Future<Output = Result<(), AppError>> + Send {
        self.set_status(chunk, ChunkStatus::Done)
    }

    /// Mark a batch of chunks done. Durable ledgers override this to write once.
    fn mark_all_done(&self, chunks: &[Chunk]) -> impl Future<Output = Result<(), AppError>> + Send {
        async move {
            for chunk in chunks {
                self.mark_done(chunk).await?;
            }
            Ok(())
        }
    }
}

/// A chunk ledger that records nothing, for single-stream runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoChunkLedger;

impl ChunkLedger for NoChunkLedger {
    async fn status(&self, _id: ChunkId) -> Result<Option<ChunkStatus>, AppError> {
        Ok(None)
    }

    async fn set_status(&self, _chunk: &Chunk, _status: ChunkStatus) -> Result<(), AppError> {
        Ok(())
    }
}
