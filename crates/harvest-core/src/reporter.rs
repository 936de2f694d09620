use crate::chunk::ChunkId;
use crate::config::RunMode;
use crate::pool::RunSummary;
use crate::resume::ResumePoint;

/// Events emitted by the pipeline for monitoring/logging.
#[derive(Debug, Clone)]
pub enum PipelineEvent<'a> {
    Started {
        run_id: &'a str,
        mode: RunMode,
        resume: ResumePoint,
    },
    AlreadyComplete {
        work_total: u64,
    },
    /// A chunk below the resume point, or one the ledger already marks done.
    ChunkSkipped {
        chunk: ChunkId,
    },
    ChunkStarted {
        chunk: ChunkId,
        lane: usize,
    },
    ItemStarted {
        index: u64,
        target: &'a str,
        lane: usize,
    },
    ItemSucceeded {
        index: u64,
        attempts: u32,
    },
    ItemFailed {
        index: u64,
        error: &'a str,
        attempts: u32,
        retriable: bool,
    },
    /// A record was committed to the result sink.
    Progress {
        position: u64,
        total: u64,
    },
    ChunkDone {
        chunk: ChunkId,
    },
    Interrupted {
        position: u64,
    },
    Finished {
        summary: &'a RunSummary,
    },
}

/// Trait for receiving pipeline events (decoupled logging).
pub trait PipelineReporter: Send + Sync {
    fn report(&self, event: PipelineEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

const PROGRESS_EVERY: u64 = 10;

impl PipelineReporter for TracingReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        match event {
            PipelineEvent::Started {
                run_id,
                mode,
                resume,
            } => {
                tracing::info!(
                    %run_id,
                    %mode,
                    total = resume.work_total,
                    start = resume.start_index,
                    remaining = resume.remaining,
                    "Run started"
                );
            }
            PipelineEvent::AlreadyComplete { work_total } => {
                tracing::info!(%work_total, "All items already processed");
            }
            PipelineEvent::ChunkSkipped { chunk } => {
                tracing::debug!(%chunk, "Chunk skipped");
            }
            PipelineEvent::ChunkStarted { chunk, lane } => {
                tracing::info!(%chunk, %lane, "Chunk started");
            }
            PipelineEvent::ItemStarted {
                index,
                target,
                lane,
            } => {
                tracing::debug!(%index, url = %target, %lane, "Processing item");
            }
            PipelineEvent::ItemSucceeded { index, attempts } => {
                tracing::debug!(%index, %attempts, "Item extracted");
            }
            PipelineEvent::ItemFailed {
                index,
                error,
                attempts,
                retriable,
            } => {
                tracing::warn!(%index, %error, %attempts, %retriable, "Item failed");
            }
            PipelineEvent::Progress { position, total } => {
                if position % PROGRESS_EVERY == 0 || position == total {
                    tracing::info!(%position, %total, "Progress");
                } else {
                    tracing::debug!(%position, %total, "Progress");
                }
            }
            PipelineEvent::ChunkDone { chunk } => {
                tracing::info!(%chunk, "Chunk done");
            }
            PipelineEvent::Interrupted { position } => {
                tracing::warn!(%position, "Run interrupted, safe to resume");
            }
            PipelineEvent::Finished { summary } => {
                tracing::info!(
                    run_id = %summary.run_id,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    not_attempted = summary.not_attempted,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "Run finished"
                );
            }
        }
    }
}
