//! Worker pool: bounded-concurrency lanes feeding a single ordered writer.
//!
//! ```text
//! producer --(units, bounded)--> lane 0..N --(records)--> writer --> ResultSink
//!     ^                                                     |
//!     +------------- window permit per committed unit ------+
//! ```
//!
//! The writer commits strictly in dispatch order, so the result sink is
//! always a prefix of the work source and `count()` is the resume point.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunk::{Chunk, ChunkStatus, partition};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{RunConfig, RunMode};
use crate::error::AppError;
use crate::models::{ResultRecord, WorkItem, output_headers};
use crate::reporter::{PipelineEvent, PipelineReporter};
use crate::resume::{ResumePoint, resume_point};
use crate::retry::{ItemOutcome, RetryingExtractor, retry_with_backoff};
use crate::traits::{ChunkLedger, Extractor, NoChunkLedger, ResultSink, WorkSource};

/// Outcome of one [`Pipeline::run`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    /// Unique per invocation, unlike `run_id` which may be reused across restarts.
    pub invocation_id: Uuid,
    pub mode: RunMode,
    pub work_total: u64,
    pub start_index: u64,
    /// Items whose outcome was committed during this run.
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub not_attempted: u64,
    /// Extraction attempts beyond the first, over committed items.
    pub retries: u64,
    pub chunks_completed: u64,
    /// Result sink row count after the run.
    pub resume_position: u64,
    pub elapsed: Duration,
    pub interrupted: bool,
}

impl RunSummary {
    fn new(config: &RunConfig, resume: ResumePoint) -> Self {
        Self {
            run_id: config.run_id.clone(),
            invocation_id: Uuid::new_v4(),
            mode: config.mode,
            work_total: resume.work_total,
            start_index: resume.start_index,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            not_attempted: resume.remaining,
            retries: 0,
            chunks_completed: 0,
            resume_position: resume.start_index,
            elapsed: Duration::ZERO,
            interrupted: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.resume_position == self.work_total
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} ({})", self.run_id, self.mode)?;
        writeln!(
            f,
            "  Position:      {}/{} (started at {})",
            self.resume_position, self.work_total, self.start_index
        )?;
        writeln!(f, "  Attempted:     {}", self.attempted)?;
        writeln!(f, "  Succeeded:     {}", self.succeeded)?;
        writeln!(f, "  Failed:        {}", self.failed)?;
        writeln!(f, "  Not attempted: {}", self.not_attempted)?;
        writeln!(f, "  Retries:       {}", self.retries)?;
        if self.mode == RunMode::ChunkedParallel {
            writeln!(f, "  Chunks done:   {}", self.chunks_completed)?;
        }
        write!(f, "  Elapsed:       {:.1}s", self.elapsed.as_secs_f64())?;
        if self.interrupted {
            write!(f, " (interrupted)")?;
        }
        Ok(())
    }
}

/// A dispatch unit: one item, or the unprocessed part of one chunk.
struct Unit {
    seq: u64,
    chunk: Option<Chunk>,
    items: Vec<WorkItem>,
}

/// What a lane hands to the writer.
struct LaneMessage {
    seq: u64,
    chunk: Option<Chunk>,
    body: LaneBody,
}

enum LaneBody {
    Record(ResultRecord),
    /// The unit is over. `complete` is false if the lane stopped early.
    Closed { complete: bool },
}

#[derive(Default)]
struct Slot {
    chunk: Option<Chunk>,
    records: VecDeque<ResultRecord>,
    closed: Option<bool>,
}

/// Writer-side counters.
struct Tally {
    next_seq: u64,
    position: u64,
    total: u64,
    succeeded: u64,
    failed: u64,
    retries: u64,
    chunks_completed: u64,
    stopped: bool,
    error: Option<AppError>,
    failed_chunk: Option<Chunk>,
}

impl Tally {
    fn new(resume: ResumePoint) -> Self {
        Self {
            next_seq: 0,
            position: resume.start_index,
            total: resume.work_total,
            succeeded: 0,
            failed: 0,
            retries: 0,
            chunks_completed: 0,
            stopped: false,
            error: None,
            failed_chunk: None,
        }
    }
}

/// Resumable extraction run over a work source and a result sink.
pub struct Pipeline<S, K, E, L = NoChunkLedger> {
    source: S,
    sink: K,
    extractor: RetryingExtractor<E>,
    ledger: Option<L>,
    config: RunConfig,
}

impl<S, K, E> Pipeline<S, K, E, NoChunkLedger>
where
    S: WorkSource,
    K: ResultSink,
    E: Extractor,
{
    pub fn new(source: S, sink: K, extractor: E, config: RunConfig) -> Self {
        let mut extractor =
            RetryingExtractor::new(extractor, config.retry.clone(), config.per_item_timeout);
        if let Some(cb) = &config.circuit_breaker {
            extractor = extractor.with_circuit_breaker(CircuitBreaker::new("extractor", cb.clone()));
        }
        Self {
            source,
            sink,
            extractor,
            ledger: None,
            config,
        }
    }

    /// Attach the chunk ledger required by chunked-parallel mode.
    pub fn with_chunk_ledger<L: ChunkLedger>(self, ledger: L) -> Pipeline<S, K, E, L> {
        Pipeline {
            source: self.source,
            sink: self.sink,
            extractor: self.extractor,
            ledger: Some(ledger),
            config: self.config,
        }
    }
}

impl<S, K, E, L> Pipeline<S, K, E, L>
where
    S: WorkSource,
    K: ResultSink,
    E: Extractor,
    L: ChunkLedger,
{
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Process every item not yet in the result sink.
    ///
    /// Per-item failures are recorded as failure rows and never abort the
    /// run. Configuration, consistency and sink write failures do.
    pub async fn run<R: PipelineReporter>(
        &self,
        cancel: CancellationToken,
        reporter: &R,
    ) -> Result<RunSummary, AppError> {
        let started = Instant::now();
        self.config.validate()?;
        let chunk_ledger = match (self.config.mode, &self.ledger) {
            (RunMode::ChunkedParallel, None) => {
                return Err(AppError::ConfigError(
                    "chunked-parallel mode requires a chunk ledger".into(),
                ));
            }
            (RunMode::ChunkedParallel, Some(ledger)) => Some(ledger),
            (RunMode::SingleStream, _) => None,
        };

        let headers = output_headers(&self.source.columns(), self.extractor.fields());
        self.sink.ensure_schema(&headers).await?;

        let resume = resume_point(&self.source, &self.sink).await?;
        if let Some(ledger) = chunk_ledger {
            self.reconcile_chunks(ledger, resume).await?;
        }

        reporter.report(PipelineEvent::Started {
            run_id: &self.config.run_id,
            mode: self.config.mode,
            resume,
        });
        let mut summary = RunSummary::new(&self.config, resume);

        if resume.is_complete() {
            reporter.report(PipelineEvent::AlreadyComplete {
                work_total: resume.work_total,
            });
            summary.elapsed = started.elapsed();
            reporter.report(PipelineEvent::Finished { summary: &summary });
            return Ok(summary);
        }

        let (produced, tally) = self.dispatch(resume, &cancel, reporter).await;

        if let Some(error) = tally.error {
            if let Some(chunk) = tally.failed_chunk {
                self.set_chunk_status(&chunk, ChunkStatus::Failed).await;
            }
            reporter.report(PipelineEvent::Interrupted {
                position: tally.position,
            });
            return Err(error);
        }
        produced?;

        summary.succeeded = tally.succeeded;
        summary.failed = tally.failed;
        summary.attempted = tally.succeeded + tally.failed;
        summary.not_attempted = resume.remaining - summary.attempted;
        summary.retries = tally.retries;
        summary.chunks_completed = tally.chunks_completed;
        summary.resume_position = tally.position;
        summary.interrupted = tally.stopped || tally.position < resume.work_total;
        summary.elapsed = started.elapsed();

        if summary.interrupted {
            reporter.report(PipelineEvent::Interrupted {
                position: tally.position,
            });
        }
        reporter.report(PipelineEvent::Finished { summary: &summary });
        Ok(summary)
    }

    /// Bring the chunk ledger in line with the result sink before any work.
    async fn reconcile_chunks(&self, ledger: &L, resume: ResumePoint) -> Result<(), AppError> {
        let mut committed = Vec::new();
        for chunk in partition(0, resume.work_total, self.config.chunk_size)? {
            let done = ledger.is_done(chunk.id()).await?;
            if chunk.end <= resume.start_index {
                if !done {
                    committed.push(chunk);
                }
            } else if done {
                return Err(AppError::ConsistencyError(format!(
                    "{} is marked done in the chunk ledger but the result sink only holds {} rows",
                    chunk.id(),
                    resume.start_index
                )));
            }
        }
        if !committed.is_empty() {
            tracing::info!(chunks = committed.len(), "Marking chunks already in the result sink as done");
            ledger.mark_all_done(&committed).await?;
        }
        Ok(())
    }

    async fn dispatch<R: PipelineReporter>(
        &self,
        resume: ResumePoint,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> (Result<(), AppError>, Tally) {
        let depth = self.config.queue_depth();
        let window = Semaphore::new(depth);
        let (unit_tx, unit_rx) = mpsc::channel::<Unit>(depth);
        let unit_rx = Mutex::new(unit_rx);
        let (done_tx, done_rx) = mpsc::channel::<LaneMessage>(depth);
        let halt = cancel.child_token();

        let producer = async {
            let result = self.produce(resume, unit_tx, &window, &halt, reporter).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "Reading the work source failed");
                halt.cancel();
            }
            result
        };
        let lanes = join_all(
            (0..self.config.concurrency)
                .map(|lane| self.lane(lane, &unit_rx, done_tx.clone(), &halt, reporter)),
        );
        drop(done_tx);
        let writer = self.write(resume, done_rx, &window, &halt, reporter);

        let (produced, _, tally) = tokio::join!(producer, lanes, writer);
        (produced, tally)
    }

    async fn produce<R: PipelineReporter>(
        &self,
        resume: ResumePoint,
        units: mpsc::Sender<Unit>,
        window: &Semaphore,
        halt: &CancellationToken,
        reporter: &R,
    ) -> Result<(), AppError> {
        let chunked = self.config.mode == RunMode::ChunkedParallel;
        // Chunk ids must not depend on the resume point, so chunked runs
        // always partition from zero. Single-stream reads in batches.
        let from = if chunked { 0 } else { resume.start_index };
        let mut seq = 0;

        for chunk in partition(from, resume.work_total, self.config.chunk_size.max(1))? {
            let Some(range) = chunk.remaining_from(resume.start_index) else {
                reporter.report(PipelineEvent::ChunkSkipped { chunk: chunk.id() });
                continue;
            };
            let items = self.source.get_range(range.start, range.end).await?;

            if chunked {
                let unit = Unit {
                    seq,
                    chunk: Some(chunk),
                    items,
                };
                if !send_unit(unit, &units, window, halt).await {
                    return Ok(());
                }
                seq += 1;
            } else {
                for item in items {
                    let unit = Unit {
                        seq,
                        chunk: None,
                        items: vec![item],
                    };
                    if !send_unit(unit, &units, window, halt).await {
                        return Ok(());
                    }
                    seq += 1;
                }
            }
        }
        Ok(())
    }

    async fn lane<R: PipelineReporter>(
        &self,
        lane: usize,
        units: &Mutex<mpsc::Receiver<Unit>>,
        done: mpsc::Sender<LaneMessage>,
        halt: &CancellationToken,
        reporter: &R,
    ) {
        loop {
            let unit = {
                let mut rx = units.lock().await;
                tokio::select! {
                    biased;
                    () = halt.cancelled() => None,
                    unit = rx.recv() => unit,
                }
            };
            let Some(unit) = unit else { break };
            if !self.process_unit(lane, unit, &done, halt, reporter).await {
                break;
            }
        }
    }

    /// Returns false once the writer is gone.
    async fn process_unit<R: PipelineReporter>(
        &self,
        lane: usize,
        unit: Unit,
        done: &mpsc::Sender<LaneMessage>,
        halt: &CancellationToken,
        reporter: &R,
    ) -> bool {
        let Unit { seq, chunk, items } = unit;
        if let Some(chunk) = &chunk {
            self.set_chunk_status(chunk, ChunkStatus::InProgress).await;
            reporter.report(PipelineEvent::ChunkStarted {
                chunk: chunk.id(),
                lane,
            });
        }

        let mut complete = true;
        for item in items {
            if halt.is_cancelled() {
                complete = false;
                break;
            }
            let record = self.process_item(lane, item, reporter).await;
            let message = LaneMessage {
                seq,
                chunk,
                body: LaneBody::Record(record),
            };
            if done.send(message).await.is_err() {
                return false;
            }

            let delay = self.config.inter_item_delay;
            if !delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = halt.cancelled() => {}
                }
            }
        }

        let closed = LaneMessage {
            seq,
            chunk,
            body: LaneBody::Closed { complete },
        };
        done.send(closed).await.is_ok()
    }

    async fn process_item<R: PipelineReporter>(
        &self,
        lane: usize,
        item: WorkItem,
        reporter: &R,
    ) -> ResultRecord {
        reporter.report(PipelineEvent::ItemStarted {
            index: item.index,
            target: &item.target,
            lane,
        });

        match self.extractor.run(&item).await {
            ItemOutcome::Extracted { fields, attempts } => {
                reporter.report(PipelineEvent::ItemSucceeded {
                    index: item.index,
                    attempts,
                });
                ResultRecord::succeeded(item, fields, attempts)
            }
            ItemOutcome::Failed {
                error,
                attempts,
                retriable,
            } => {
                let message = error.to_string();
                reporter.report(PipelineEvent::ItemFailed {
                    index: item.index,
                    error: &message,
                    attempts,
                    retriable,
                });
                ResultRecord::failed(item, &error, attempts)
            }
        }
    }

    /// Commit lane output in dispatch order. Returns once every lane is gone.
    async fn write<R: PipelineReporter>(
        &self,
        resume: ResumePoint,
        mut done: mpsc::Receiver<LaneMessage>,
        window: &Semaphore,
        halt: &CancellationToken,
        reporter: &R,
    ) -> Tally {
        let mut tally = Tally::new(resume);
        let mut pending: BTreeMap<u64, Slot> = BTreeMap::new();

        while let Some(message) = done.recv().await {
            if tally.stopped {
                // Draining: nothing after the stop point may be committed.
                if let (LaneBody::Closed { .. }, Some(chunk)) = (&message.body, &message.chunk) {
                    self.set_chunk_status(chunk, ChunkStatus::Pending).await;
                }
                continue;
            }

            let slot = pending.entry(message.seq).or_default();
            slot.chunk = message.chunk;
            match message.body {
                LaneBody::Record(record) => slot.records.push_back(record),
                LaneBody::Closed { complete } => slot.closed = Some(complete),
            }

            if let Err(error) = self
                .commit_ready(&mut pending, &mut tally, window, reporter)
                .await
            {
                tracing::error!(error = %error, position = tally.position, "Writer halted");
                tally.error = Some(error);
                tally.stopped = true;
            }

            if tally.stopped {
                halt.cancel();
                window.close();
                for (_, slot) in std::mem::take(&mut pending) {
                    if let Some(chunk) = slot.chunk
                        && slot.closed.is_some()
                    {
                        self.set_chunk_status(&chunk, ChunkStatus::Pending).await;
                    }
                }
            }
        }
        tally
    }

    /// Commit everything at the head of the reorder buffer.
    async fn commit_ready<R: PipelineReporter>(
        &self,
        pending: &mut BTreeMap<u64, Slot>,
        tally: &mut Tally,
        window: &Semaphore,
        reporter: &R,
    ) -> Result<(), AppError> {
        while let Some(slot) = pending.get_mut(&tally.next_seq) {
            while let Some(record) = slot.records.pop_front() {
                if let Err(e) = self.commit_record(&record, tally, reporter).await {
                    tally.failed_chunk = slot.chunk;
                    return Err(e);
                }
            }
            let Some(complete) = slot.closed else {
                return Ok(());
            };
            let chunk = slot.chunk;
            pending.remove(&tally.next_seq);
            tally.next_seq += 1;

            if let Some(chunk) = chunk {
                if complete {
                    if let Some(ledger) = &self.ledger {
                        retry_with_backoff(&self.config.sink_retry, || ledger.mark_done(&chunk))
                            .await
                            .map_err(|exhausted| exhausted.error)?;
                    }
                    tally.chunks_completed += 1;
                    reporter.report(PipelineEvent::ChunkDone { chunk: chunk.id() });
                } else {
                    self.set_chunk_status(&chunk, ChunkStatus::Pending).await;
                }
            }

            if !complete {
                tally.stopped = true;
                return Ok(());
            }
            window.add_permits(1);
        }
        Ok(())
    }

    async fn commit_record<R: PipelineReporter>(
        &self,
        record: &ResultRecord,
        tally: &mut Tally,
        reporter: &R,
    ) -> Result<(), AppError> {
        if record.index != tally.position {
            return Err(AppError::ConsistencyError(format!(
                "writer expected item {} but received item {}",
                tally.position, record.index
            )));
        }

        retry_with_backoff(&self.config.sink_retry, || self.sink.append(record))
            .await
            .map_err(|exhausted| AppError::SinkWriteFailed {
                index: record.index,
                attempts: exhausted.attempts,
                message: exhausted.error.to_string(),
            })?;

        tally.position += 1;
        if record.is_success() {
            tally.succeeded += 1;
        } else {
            tally.failed += 1;
        }
        tally.retries += u64::from(record.attempts.saturating_sub(1));
        reporter.report(PipelineEvent::Progress {
            position: tally.position,
            total: tally.total,
        });
        Ok(())
    }

    /// Best-effort ledger update; only `done` is load-bearing for resume.
    async fn set_chunk_status(&self, chunk: &Chunk, status: ChunkStatus) {
        if let Some(ledger) = &self.ledger
            && let Err(e) = ledger.set_status(chunk, status).await
        {
            tracing::warn!(chunk = %chunk.id(), %status, error = %e, "Failed to update chunk ledger");
        }
    }
}

/// Wait for a window permit, then queue `unit`. False once the run is halting.
async fn send_unit(
    unit: Unit,
    units: &mpsc::Sender<Unit>,
    window: &Semaphore,
    halt: &CancellationToken,
) -> bool {
    let permit = tokio::select! {
        biased;
        () = halt.cancelled() => return false,
        permit = window.acquire() => match permit {
            Ok(permit) => permit,
            Err(_) => return false,
        },
    };
    // Returned by the writer when the unit is committed.
    permit.forget();

    tokio::select! {
        biased;
        () = halt.cancelled() => false,
        sent = units.send(unit) => sent.is_ok(),
    }
}
