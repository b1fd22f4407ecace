use std::collections::{BTreeSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

use crate::config::DEFAULT_CHECKPOINT_INTERVAL;
use crate::errors::{AppError, AppResult};
use crate::session::CancellationPredicate;
use crate::store::{RecordSource, SourceRecord};

const DEFAULT_PAGE_SIZE: usize = 200;
const MAX_KEPT_RECORD_ERRORS: usize = 100;

/// Per-record work plus the optional whole-database duplicate phase.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: SourceRecord) -> AppResult<()>;

    /// Returns the number of duplicate groups found.
    async fn analyze_duplicates(&self) -> AppResult<usize> {
        Ok(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolProgress {
    pub database_ref: String,
    /// Records below this offset are all finished.
    pub processed: u64,
    pub total: u64,
    pub errors: u64,
}

pub type ProgressObserver = Arc<dyn Fn(PoolProgress) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub worker_count: usize,
    pub checkpoint_interval: usize,
    /// When set, workers also check for stop before each batch of this
    /// many enrichment lookups.
    pub enrichment_batch_size: Option<usize>,
    pub page_size: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            worker_count: 4,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            enrichment_batch_size: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordError {
    pub offset: u64,
    pub reference: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PoolSummary {
    pub database_ref: String,
    pub processed: u64,
    pub processed_this_run: u64,
    pub total: u64,
    pub errors: u64,
    pub stopped: bool,
    pub duplicate_groups: Option<usize>,
    pub record_errors: Vec<RecordError>,
}

/// Claims records for workers in source order.
struct Cursor {
    next: u64,
    end: u64,
    buffer: VecDeque<SourceRecord>,
}

/// Lowest offset not yet finished, plus the finished offsets above it.
struct Watermark {
    low: u64,
    done: BTreeSet<u64>,
}

impl Watermark {
    fn finish(&mut self, offset: u64) -> u64 {
        self.done.insert(offset);
        while self.done.remove(&self.low) {
            self.low += 1;
        }
        self.low
    }
}

struct RunState {
    database_ref: String,
    total: u64,
    page_size: usize,
    cursor: Mutex<Cursor>,
    watermark: Mutex<Watermark>,
    reported: Mutex<u64>,
    drain: AtomicBool,
    stop_observed: AtomicBool,
    finished: AtomicU64,
    errors: AtomicU64,
    failure: Mutex<Option<AppError>>,
    record_errors: Mutex<Vec<RecordError>>,
}

impl RunState {
    fn claim(&self, source: &dyn RecordSource) -> AppResult<Option<SourceRecord>> {
        if self.drain.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut cursor = self.cursor.lock();
        if cursor.next >= cursor.end {
            return Ok(None);
        }
        if cursor.buffer.is_empty() {
            let want = usize::try_from(cursor.end - cursor.next)
                .unwrap_or(usize::MAX)
                .min(self.page_size);
            let page = source
                .fetch(&self.database_ref, cursor.next, want)
                .map_err(|err| match err {
                    AppError::SourceUnavailable(_) => err,
                    other => AppError::SourceUnavailable(format!("{}: {other}", self.database_ref)),
                })?;
            if page.is_empty() {
                return Err(AppError::SourceUnavailable(format!(
                    "{} ended at record {} of {}",
                    self.database_ref, cursor.next, cursor.end
                )));
            }
            cursor.buffer.extend(page);
        }
        let record = cursor.buffer.pop_front();
        if let Some(record) = record.as_ref() {
            cursor.next = record.offset + 1;
        }
        Ok(record)
    }

    fn finish(&self, offset: u64) -> u64 {
        self.finished.fetch_add(1, Ordering::AcqRel);
        self.watermark.lock().finish(offset)
    }

    fn record_error(&self, record: &SourceRecord, message: String) {
        self.errors.fetch_add(1, Ordering::AcqRel);
        let mut kept = self.record_errors.lock();
        if kept.len() < MAX_KEPT_RECORD_ERRORS {
            kept.push(RecordError {
                offset: record.offset,
                reference: record.reference.clone(),
                message,
            });
        }
    }

    fn abort(&self, err: AppError) {
        warn!(database = %self.database_ref, error = %err, "worker pool aborting");
        self.drain.store(true, Ordering::Release);
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    fn begin_drain(&self) {
        self.stop_observed.store(true, Ordering::Release);
        self.drain.store(true, Ordering::Release);
    }

    fn progress(&self) -> PoolProgress {
        PoolProgress {
            database_ref: self.database_ref.clone(),
            processed: self.watermark.lock().low,
            total: self.total,
            errors: self.errors.load(Ordering::Acquire),
        }
    }

    /// Reports in increasing order only, even when workers race.
    fn report(&self, observer: Option<&ProgressObserver>) {
        let Some(observer) = observer else {
            return;
        };
        let mut reported = self.reported.lock();
        let progress = self.progress();
        if progress.processed > *reported {
            *reported = progress.processed;
            observer(progress);
        }
    }
}

/// Fans one database's records out to parallel workers and drains them
/// cleanly when the session is stopped.
pub struct CheckpointedWorkerPool {
    database_ref: String,
    source: Arc<dyn RecordSource>,
    budget: Arc<Semaphore>,
    options: PoolOptions,
    observer: Option<ProgressObserver>,
}

impl CheckpointedWorkerPool {
    pub fn new(
        database_ref: impl Into<String>,
        source: Arc<dyn RecordSource>,
        budget: Arc<Semaphore>,
        options: PoolOptions,
    ) -> Self {
        Self {
            database_ref: database_ref.into(),
            source,
            budget,
            options,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Processes `[start_offset, total)`. Returns `Err` only for systemic
    /// failures; per-record errors are tallied in the summary.
    pub async fn run(
        &self,
        start_offset: u64,
        total: u64,
        cancel: CancellationPredicate,
        handler: Arc<dyn RecordHandler>,
    ) -> AppResult<PoolSummary> {
        let start_offset = start_offset.min(total);
        let state = Arc::new(RunState {
            database_ref: self.database_ref.clone(),
            total,
            page_size: self.options.page_size.max(1),
            cursor: Mutex::new(Cursor {
                next: start_offset,
                end: total,
                buffer: VecDeque::new(),
            }),
            watermark: Mutex::new(Watermark {
                low: start_offset,
                done: BTreeSet::new(),
            }),
            reported: Mutex::new(start_offset),
            drain: AtomicBool::new(false),
            stop_observed: AtomicBool::new(false),
            finished: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            failure: Mutex::new(None),
            record_errors: Mutex::new(Vec::new()),
        });

        let worker_count = self.options.worker_count.max(1);
        info!(
            database = %self.database_ref,
            start_offset,
            total,
            workers = worker_count,
            "worker pool starting"
        );

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let worker = Worker {
                id: worker_id,
                state: Arc::clone(&state),
                source: Arc::clone(&self.source),
                budget: Arc::clone(&self.budget),
                cancel: cancel.clone(),
                handler: Arc::clone(&handler),
                observer: self.observer.clone(),
                checkpoint_interval: self.options.checkpoint_interval.max(1),
                enrichment_batch_size: self.options.enrichment_batch_size.map(|size| size.max(1)),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        for joined in futures_util::future::join_all(workers).await {
            if let Err(err) = joined {
                state.abort(AppError::Record(format!("worker task ended abnormally: {err}")));
            }
        }

        state.report(self.observer.as_ref());

        if let Some(err) = state.failure.lock().take() {
            return Err(err);
        }

        let mut stopped = state.stop_observed.load(Ordering::Acquire);
        let mut duplicate_groups = None;
        if !stopped {
            if cancel.should_stop() {
                stopped = true;
            } else {
                let groups = handler.analyze_duplicates().await.map_err(|err| {
                    AppError::SourceUnavailable(format!("duplicate analysis failed: {err}"))
                })?;
                debug!(database = %self.database_ref, groups, "duplicate analysis finished");
                duplicate_groups = Some(groups);
            }
        }

        let progress = state.progress();
        let summary = PoolSummary {
            database_ref: self.database_ref.clone(),
            processed: progress.processed,
            processed_this_run: state.finished.load(Ordering::Acquire),
            total,
            errors: progress.errors,
            stopped,
            duplicate_groups,
            record_errors: std::mem::take(&mut *state.record_errors.lock()),
        };
        info!(
            database = %summary.database_ref,
            processed = summary.processed,
            total = summary.total,
            errors = summary.errors,
            stopped = summary.stopped,
            "worker pool finished"
        );
        Ok(summary)
    }
}

struct Worker {
    id: usize,
    state: Arc<RunState>,
    source: Arc<dyn RecordSource>,
    budget: Arc<Semaphore>,
    cancel: CancellationPredicate,
    handler: Arc<dyn RecordHandler>,
    observer: Option<ProgressObserver>,
    checkpoint_interval: usize,
    enrichment_batch_size: Option<usize>,
}

impl Worker {
    async fn run(self) {
        let state = &self.state;
        if self.cancel.should_stop() {
            state.begin_drain();
            return;
        }

        let mut since_checkpoint = 0_usize;
        let mut since_batch = 0_usize;
        loop {
            if state.drain.load(Ordering::Acquire) {
                break;
            }
            let Ok(permit) = Arc::clone(&self.budget).acquire_owned().await else {
                state.abort(AppError::Config("worker budget closed".into()));
                break;
            };
            let record = match state.claim(&*self.source) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) => {
                    state.abort(err);
                    break;
                }
            };

            let offset = record.offset;
            trace!(worker = self.id, offset, "record claimed");
            let outcome = AssertUnwindSafe(self.handler.handle(record.clone()))
                .catch_unwind()
                .await;
            drop(permit);

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_systemic() => {
                    state.abort(err);
                    break;
                }
                Ok(Err(err)) => {
                    debug!(offset, reference = %record.reference, error = %err, "record failed");
                    state.record_error(&record, err.to_string());
                }
                Err(_) => {
                    warn!(offset, reference = %record.reference, "record handler panicked");
                    state.record_error(&record, "record handler panicked".into());
                }
            }
            state.finish(offset);

            since_checkpoint += 1;
            since_batch += 1;
            if since_checkpoint >= self.checkpoint_interval {
                since_checkpoint = 0;
                state.report(self.observer.as_ref());
                if self.cancel.should_stop() {
                    debug!(worker = self.id, offset, "stop observed at checkpoint");
                    state.begin_drain();
                    break;
                }
            }
            if let Some(batch) = self.enrichment_batch_size {
                if since_batch >= batch {
                    since_batch = 0;
                    if self.cancel.should_stop() {
                        debug!(worker = self.id, offset, "stop observed before enrichment batch");
                        state.begin_drain();
                        break;
                    }
                }
            }
        }
    }
}
