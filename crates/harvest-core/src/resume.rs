//! Startup resume calculation.
//!
//! The next unprocessed index is never stored anywhere: it is the row count
//! of the result sink, recomputed every time a run starts.

use crate::error::AppError;
use crate::traits::{ResultSink, WorkSource};

/// Where a run starts and how much is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub work_total: u64,
    pub start_index: u64,
    pub remaining: u64,
}

impl ResumePoint {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    pub fn percent_complete(&self) -> f64 {
        if self.work_total == 0 {
            return 100.0;
        }
        self.start_index as f64 * 100.0 / self.work_total as f64
    }
}

/// Compare input size with output size.
///
/// Fails with [`AppError::ConsistencyError`] when the output holds more rows
/// than the input: there is no safe way to decide which rows to trust.
pub fn compute_resume_index(work_total: u64, result_count: u64) -> Result<ResumePoint, AppError> {
    if result_count > work_total {
        return Err(AppError::ConsistencyError(format!(
            "result sink holds {result_count} rows but the work source only has {work_total} items"
        )));
    }
    Ok(ResumePoint {
        work_total,
        start_index: result_count,
        remaining: work_total - result_count,
    })
}

/// Read both ledger sizes and compute the resume point.
pub async fn resume_point<S, K>(source: &S, sink: &K) -> Result<ResumePoint, AppError>
where
    S: WorkSource,
    K: ResultSink,
{
    let work_total = source.total().await?;
    let result_count = sink.count().await?;
    compute_resume_index(work_total, result_count)
}
