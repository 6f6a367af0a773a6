//! Batch scheduler: bounded-window orchestration of many download jobs.
//!
//! The [`BatchScheduler`] accepts a (possibly very long) sequence of
//! [`JobRequest`]s and runs them under the shared [`RateLimiter`]. A producer
//! stage feeds a bounded channel of `batch_size` requests; the consumer stage
//! takes a concurrency slot *before* pulling the next request, so at most
//! `max_concurrent` jobs are live at once no matter how long the input is.
//! Segmented jobs take extra slots for parallel range requests, so the slot
//! count also bounds outstanding network requests.
//! Closing the input channel ends the batch.
//!
//! Every started job yields exactly one [`JobOutcome`] on the outcome
//! channel. Cancelling the scheduler's token stops in-flight jobs (they
//! report [`FailureClass::Cancelled`]) and leaves pending requests unstarted.
//!
//! # Example
//!
//! ```no_run
//! use bulkget_core::config::EngineConfig;
//! use bulkget_core::download::{BatchScheduler, JobRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = BatchScheduler::from_config(&EngineConfig::default())?;
//! let jobs = vec![
//!     JobRequest::new("https://example.com/a.pdf"),
//!     JobRequest::new("https://example.com/b.pdf"),
//! ];
//! let (outcomes, summary) = scheduler.run_to_completion(jobs).await?;
//! println!("{} of {} downloaded", summary.succeeded, outcomes.len());
//! # Ok(())
//! # }
//! ```

mod task;

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::client::HttpClient;
use super::constants::MAX_WORKERS_PER_JOB;
use super::filename::destination_for;
use super::job::{DownloadJob, JobId, JobRequest};
use super::planner::TransferPlanner;
use super::progress::ProgressTracker;
use super::rate_limiter::RateLimiter;
use super::retry::FailureClass;
use super::telemetry::{TelemetrySink, TracingTelemetry};
use super::transport::HttpTransport;
use super::worker::TransferContext;
use crate::config::{ConfigError, EngineConfig};
use crate::notify::BatchNotifier;

/// Errors from building or running a scheduler.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// The scheduler task itself panicked or was aborted.
    #[error("scheduler task failed: {0}")]
    Join(#[from] JoinError),
}

/// Live counters for one scheduler. Shared with every worker.
#[derive(Debug, Default)]
pub struct DownloadStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    retried: AtomicUsize,
    published: AtomicUsize,
    bytes: AtomicU64,
}

impl DownloadStats {
    /// Creates a stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs that ended with the file at its final path.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Jobs that ended in failure, cancellations included.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Jobs that were cancelled while in flight.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Jobs that reached a terminal outcome.
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed() + self.failed()
    }

    /// Retries scheduled across all jobs and segments.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Temp files renamed onto their final path.
    #[must_use]
    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    /// Bytes fetched by completed jobs.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_published(&self) {
        self.published.fetch_add(1, Ordering::SeqCst);
    }

    fn record(&self, outcome: &JobOutcome) {
        match &outcome.result {
            JobResult::Success { bytes, .. } => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                self.bytes.fetch_add(*bytes, Ordering::SeqCst);
            }
            JobResult::Failed { class, .. } => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                if *class == FailureClass::Cancelled {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }
}

/// Terminal result of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobResult {
    /// The file is at `path`.
    Success {
        /// Final path.
        path: PathBuf,
        /// Bytes fetched by this run; 0 when the file already existed.
        bytes: u64,
        /// The destination was already present and nothing was fetched.
        already_existed: bool,
    },
    /// The job gave up.
    Failed {
        /// Failure classification.
        class: FailureClass,
        /// Human-readable error.
        message: String,
    },
}

/// One job's terminal outcome, emitted exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    /// Job identity within this run.
    pub id: JobId,
    /// Source URL.
    pub url: String,
    /// How it ended.
    pub result: JobResult,
}

impl JobOutcome {
    /// Whether the file is at its final path.
    #[must_use]
    pub fn downloaded(&self) -> bool {
        matches!(self.result, JobResult::Success { .. })
    }

    /// Final path of a successful job.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.result {
            JobResult::Success { path, .. } => Some(path),
            JobResult::Failed { .. } => None,
        }
    }

    fn failed(id: JobId, url: String, class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            id,
            url,
            result: JobResult::Failed {
                class,
                message: message.into(),
            },
        }
    }
}

/// End-of-batch totals. Always produced, even when every job failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    /// Jobs that reached a terminal outcome.
    pub total: usize,
    /// Jobs whose file is at its final path.
    pub succeeded: usize,
    /// Jobs that failed, cancellations included.
    pub failed: usize,
    /// Jobs cancelled while in flight.
    pub cancelled: usize,
    /// Bytes fetched by this batch.
    pub bytes: u64,
    /// Wall time of the batch.
    pub elapsed: Duration,
}

impl BatchSummary {
    /// Average throughput in MiB/s over the whole batch.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_speed_mibps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 / (1024.0 * 1024.0) / secs
    }

    /// Emits the summary as one structured `info!` event.
    pub fn log(&self) {
        info!(
            total = self.total,
            succeeded = self.succeeded,
            failed = self.failed,
            cancelled = self.cancelled,
            bytes = self.bytes,
            elapsed_ms = u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX),
            avg_mibps = format!("{:.2}", self.average_speed_mibps()),
            "batch complete"
        );
    }

    fn add(&mut self, outcome: &JobOutcome) {
        self.total += 1;
        match &outcome.result {
            JobResult::Success { bytes, .. } => {
                self.succeeded += 1;
                self.bytes += bytes;
            }
            JobResult::Failed { class, .. } => {
                self.failed += 1;
                if *class == FailureClass::Cancelled {
                    self.cancelled += 1;
                }
            }
        }
    }
}

/// Handle to a running batch.
///
/// Outcomes arrive on a bounded channel; drain `outcomes` while awaiting
/// `handle`, or the scheduler stalls once the channel fills.
#[derive(Debug)]
pub struct BatchRun {
    /// One outcome per started job, in completion order.
    pub outcomes: mpsc::Receiver<JobOutcome>,
    /// Resolves to the summary once every started job has finished.
    pub handle: JoinHandle<BatchSummary>,
}

/// Top-level orchestrator for a batch of downloads.
pub struct BatchScheduler {
    config: EngineConfig,
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    progress: Arc<ProgressTracker>,
    stats: Arc<DownloadStats>,
    cancel: CancellationToken,
    telemetry: Arc<dyn TelemetrySink>,
    notifier: Option<Arc<dyn BatchNotifier>>,
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("config", &self.config)
            .field("limiter", &self.limiter)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl BatchScheduler {
    /// Creates a scheduler over `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if `config` fails validation.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            limiter: Arc::new(RateLimiter::new(
                config.max_concurrent,
                config.bandwidth_bytes_per_sec(),
            )),
            progress: Arc::new(ProgressTracker::new(config.progress_interval())),
            stats: Arc::new(DownloadStats::new()),
            cancel: CancellationToken::new(),
            telemetry: Arc::new(TracingTelemetry),
            notifier: None,
            transport,
            config: config.clone(),
        })
    }

    /// Creates a scheduler backed by a reqwest [`HttpClient`] using the
    /// configured timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the configuration is invalid or the client
    /// cannot be built.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let client = HttpClient::with_timeouts(config.connect_timeout(), config.timeout())
            .map_err(EngineError::HttpClient)?;
        Self::new(Arc::new(client), config)
    }

    /// Replaces the telemetry sink.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Notifier invoked once per batch with its summary.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn BatchNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Token that cancels every batch started by this scheduler.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shared progress tracker.
    #[must_use]
    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    /// Live counters.
    #[must_use]
    pub fn stats(&self) -> Arc<DownloadStats> {
        Arc::clone(&self.stats)
    }

    /// Shared concurrency and bandwidth limiter.
    #[must_use]
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Starts a batch over `jobs`.
    ///
    /// The iterator is consumed lazily by a producer task, at most
    /// `batch_size` requests ahead of the workers.
    pub fn run<I>(&self, jobs: I) -> BatchRun
    where
        I: IntoIterator<Item = JobRequest>,
        I::IntoIter: Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.config.batch_size);
        let jobs = jobs.into_iter();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            for request in jobs {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    sent = tx.send(request) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.run_channel(rx)
    }

    /// Starts a batch fed by `input`; dropping every sender ends the batch.
    pub fn run_channel(&self, input: mpsc::Receiver<JobRequest>) -> BatchRun {
        let (tx, rx) = mpsc::channel(self.config.batch_size);
        let driver = Driver {
            ctx: Arc::new(TransferContext {
                transport: Arc::clone(&self.transport),
                limiter: Arc::clone(&self.limiter),
                retry: self.config.retry_policy(),
                chunk_size: self.config.chunk_size_bytes,
                cancel: self.cancel.clone(),
                telemetry: Arc::clone(&self.telemetry),
                stats: Arc::clone(&self.stats),
            }),
            planner: TransferPlanner::new(
                Arc::clone(&self.transport),
                self.config.min_segmented_size,
            ),
            progress: Arc::clone(&self.progress),
            notifier: self.notifier.clone(),
            output_folder: self.config.output_folder.clone(),
            default_workers: self.config.workers_per_job,
        };
        BatchRun {
            outcomes: rx,
            handle: tokio::spawn(driver.drive(input, tx)),
        }
    }

    /// Runs `jobs` to the end and collects every outcome.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Join`] if the scheduler task panicked.
    pub async fn run_to_completion<I>(
        &self,
        jobs: I,
    ) -> Result<(Vec<JobOutcome>, BatchSummary), EngineError>
    where
        I: IntoIterator<Item = JobRequest>,
        I::IntoIter: Send + 'static,
    {
        let BatchRun {
            mut outcomes,
            handle,
        } = self.run(jobs);
        let mut collected = Vec::new();
        while let Some(outcome) = outcomes.recv().await {
            collected.push(outcome);
        }
        let summary = handle.await?;
        Ok((collected, summary))
    }
}

/// State moved into the batch task.
struct Driver {
    ctx: Arc<TransferContext>,
    planner: TransferPlanner,
    progress: Arc<ProgressTracker>,
    notifier: Option<Arc<dyn BatchNotifier>>,
    output_folder: PathBuf,
    default_workers: usize,
}

impl Driver {
    #[instrument(skip_all)]
    async fn drive(
        self,
        mut input: mpsc::Receiver<JobRequest>,
        outcomes: mpsc::Sender<JobOutcome>,
    ) -> BatchSummary {
        let started = Instant::now();
        let cancel = self.ctx.cancel.clone();
        let sampler_stop = CancellationToken::new();
        let sampler = self.progress.spawn_sampler(sampler_stop.clone());

        let mut tasks: JoinSet<JobOutcome> = JoinSet::new();
        let mut summary = BatchSummary::default();
        let mut next_id = 0u64;

        'batch: loop {
            // A slot first, then a request: pending requests stay in the
            // bounded channel until a job can actually start.
            let permit = loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break 'batch,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        self.emit(joined, &outcomes, &mut summary).await;
                    }
                    permit = self.ctx.limiter.acquire_slot() => match permit {
                        Ok(permit) => break permit,
                        Err(_) => break 'batch,
                    },
                }
            };

            let request = loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break 'batch,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        self.emit(joined, &outcomes, &mut summary).await;
                    }
                    request = input.recv() => break request,
                }
            };
            let Some(request) = request else {
                debug!("input closed");
                break;
            };

            next_id += 1;
            let job = self.job_for(JobId(next_id), request);
            let progress = self.progress.register(job.id);
            let ctx = Arc::clone(&self.ctx);
            let planner = self.planner.clone();
            let (id, url) = (job.id, job.url.clone());
            tasks.spawn(async move {
                let _permit = permit;
                AssertUnwindSafe(task::run_job(ctx, planner, job, progress))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!(job_id = %id, url = %url, "job task panicked");
                        JobOutcome::failed(id, url, FailureClass::Permanent, "job task panicked")
                    })
            });
        }

        // Dropping the receiver ends the producer; jobs already started
        // still run to a terminal outcome.
        drop(input);
        while let Some(joined) = tasks.join_next().await {
            self.emit(joined, &outcomes, &mut summary).await;
        }

        sampler_stop.cancel();
        if let Err(e) = sampler.await {
            debug!(error = %e, "progress sampler ended abnormally");
        }

        summary.elapsed = started.elapsed();
        summary.log();
        if let Some(notifier) = &self.notifier {
            notifier.notify(&summary).await;
        }
        summary
    }

    fn job_for(&self, id: JobId, request: JobRequest) -> DownloadJob {
        let destination = request
            .destination
            .unwrap_or_else(|| destination_for(&self.output_folder, &request.url));
        let workers = request
            .workers
            .unwrap_or(self.default_workers)
            .clamp(1, MAX_WORKERS_PER_JOB);
        DownloadJob::new(id, request.url, destination, workers)
    }

    async fn emit(
        &self,
        joined: Result<JobOutcome, JoinError>,
        outcomes: &mpsc::Sender<JobOutcome>,
        summary: &mut BatchSummary,
    ) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                // Tasks catch their own panics, so only an abort lands here.
                error!(error = %e, "job task did not finish");
                return;
            }
        };
        self.progress.finish(outcome.id, outcome.downloaded());
        self.ctx.stats.record(&outcome);
        summary.add(&outcome);
        if outcomes.send(outcome).await.is_err() {
            debug!("outcome receiver dropped");
        }
    }
}
