//! Transfer engine for resumable, throttled batch downloads.
//!
//! A [`BatchScheduler`] runs many [`JobRequest`]s under one shared
//! [`RateLimiter`]. Each job is probed by the [`TransferPlanner`], then
//! fetched either as a single stream or as parallel byte-range segments
//! written into one pre-sized temp file. Finished files appear at their
//! final path only through a rename, so a partial download is never visible
//! there.
//!
//! # Features
//!
//! - Concurrency slots and a bandwidth token bucket shared by every job
//! - Exponential backoff for transient failures, honoring `Retry-After`
//! - Resume from `<final>.temp` guarded by a strong `ETag` sidecar
//! - Aggregate progress with moving-average speed and ETA
//! - Cancellation that leaves temp files resumable
//!
//! # Example
//!
//! ```no_run
//! use bulkget_core::config::EngineConfig;
//! use bulkget_core::download::{BatchScheduler, JobRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env()?;
//! let scheduler = BatchScheduler::from_config(&config)?;
//! let mut run = scheduler.run(vec![JobRequest::new("https://example.com/data.csv")]);
//! while let Some(outcome) = run.outcomes.recv().await {
//!     println!("{}: downloaded={}", outcome.url, outcome.downloaded());
//! }
//! let summary = run.handle.await?;
//! summary.log();
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
pub mod filename;
pub mod job;
mod planner;
pub mod progress;
pub mod rate_limiter;
pub mod resume;
mod retry;
mod scheduler;
pub mod segment;
mod segmented;
mod single;
pub mod telemetry;
pub mod transport;
mod worker;

pub use client::HttpClient;
pub use error::DownloadError;
pub use job::{DownloadJob, JobId, JobRequest, JobState, ValidatorToken};
pub use planner::{ProbeInfo, TransferMode, TransferPlanner};
pub use progress::{JobProgress, ProgressSnapshot, ProgressTracker};
pub use rate_limiter::RateLimiter;
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureClass, RetryDecision, RetryPolicy, classify_error,
    parse_retry_after,
};
pub use scheduler::{
    BatchRun, BatchScheduler, BatchSummary, DownloadStats, EngineError, JobOutcome, JobResult,
};
pub use segment::Segment;
pub use telemetry::{AttemptRecord, AttemptStatus, TelemetrySink, TracingTelemetry};
pub use transport::{BodyStream, ByteRange, HttpTransport, ResponseHead, TransportResponse};

// No module-local Result aliases: signatures spell out
// `Result<T, DownloadError>`.
