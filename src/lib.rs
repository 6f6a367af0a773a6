//! bulkget core library
//!
//! Downloads large numbers of remote files reliably over unreliable
//! networks: bounded concurrency, a shared bandwidth budget, retries with
//! backoff, and resume from partial files.
//!
//! # Architecture
//!
//! - [`config`] - engine options, environment overrides, validation
//! - [`download`] - the transfer engine (scheduler, planner, workers)
//! - [`notify`] - batch-completion webhook

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod notify;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use download::{
    BatchScheduler, BatchSummary, DownloadError, DownloadStats, EngineError, FailureClass,
    HttpClient, JobOutcome, JobRequest, JobResult, ProgressSnapshot, RateLimiter, RetryPolicy,
};
pub use notify::{BatchNotifier, WebhookNotifier};
