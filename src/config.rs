//! Engine configuration: defaults, environment overrides, validation.
//!
//! Every option has a default and an environment variable. CLI flags are
//! applied on top by the binary.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::download::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_CHUNK_SIZE, DEFAULT_MIN_SEGMENTED_SIZE, DEFAULT_WORKERS_PER_JOB,
    MAX_WORKERS_PER_JOB, READ_TIMEOUT_SECS,
};
use crate::download::{DEFAULT_MAX_RETRIES, RetryPolicy};

/// Lowest accepted `max_concurrent`.
pub const MIN_CONCURRENCY: usize = 1;

/// Highest accepted `max_concurrent`.
pub const MAX_CONCURRENCY: usize = 100;

/// Default concurrent transfers.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default scheduler input window.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default output folder.
pub const DEFAULT_OUTPUT_FOLDER: &str = "downloaded_files";

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Errors from loading or validating configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// A value parsed but is outside its allowed range.
    #[error("{field} must be {expected}, got {actual}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Allowed range, human readable.
        expected: &'static str,
        /// Rejected value.
        actual: String,
    },
}

/// All engine options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent transfers (1-100).
    pub max_concurrent: usize,
    /// Retries after the first attempt.
    pub retry_attempts: u32,
    /// Read timeout in seconds.
    pub timeout_seconds: u64,
    /// Connect timeout in seconds.
    pub connect_timeout_seconds: u64,
    /// Bytes charged to the byte budget per write.
    pub chunk_size_bytes: usize,
    /// Aggregate bandwidth cap in MiB/s; 0 means unlimited.
    pub max_bandwidth_mbps: f64,
    /// Scheduler input window.
    pub batch_size: usize,
    /// Folder for derived destinations.
    pub output_folder: PathBuf,
    /// Segment workers per job (1-16).
    pub workers_per_job: usize,
    /// Smallest file fetched in segments.
    pub min_segmented_size: u64,
    /// First backoff delay in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Progress sampling interval in milliseconds.
    pub progress_interval_ms: u64,
    /// Batch-completion webhook.
    pub webhook_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_CONCURRENCY,
            retry_attempts: DEFAULT_MAX_RETRIES,
            timeout_seconds: READ_TIMEOUT_SECS,
            connect_timeout_seconds: CONNECT_TIMEOUT_SECS,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            max_bandwidth_mbps: 0.0,
            batch_size: DEFAULT_BATCH_SIZE,
            output_folder: PathBuf::from(DEFAULT_OUTPUT_FOLDER),
            workers_per_job: DEFAULT_WORKERS_PER_JOB,
            min_segmented_size: DEFAULT_MIN_SEGMENTED_SIZE,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 32_000,
            progress_interval_ms: 500,
            webhook_url: None,
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
}

impl EngineConfig {
    /// Defaults overridden by process environment variables, validated.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a variable does not parse or a value is
    /// out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup(name)` for each variable, validated.
    ///
    /// Unset or blank variables keep their default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a variable does not parse or a value is
    /// out of range.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "MAX_CONCURRENT")? {
            config.max_concurrent = v;
        }
        if let Some(v) = parse_var(&lookup, "RETRY_ATTEMPTS")? {
            config.retry_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "TIMEOUT")? {
            config.timeout_seconds = v;
        }
        if let Some(v) = parse_var(&lookup, "CONNECT_TIMEOUT")? {
            config.connect_timeout_seconds = v;
        }
        if let Some(v) = parse_var(&lookup, "CHUNK_SIZE")? {
            config.chunk_size_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, "MAX_BANDWIDTH")? {
            config.max_bandwidth_mbps = v;
        }
        if let Some(v) = parse_var(&lookup, "BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = parse_var::<String>(&lookup, "OUTPUT_FOLDER")? {
            config.output_folder = PathBuf::from(v);
        }
        if let Some(v) = parse_var(&lookup, "WORKERS_PER_JOB")? {
            config.workers_per_job = v;
        }
        if let Some(v) = parse_var(&lookup, "MIN_SEGMENTED_SIZE")? {
            config.min_segmented_size = v;
        }
        if let Some(v) = parse_var(&lookup, "RETRY_BASE_DELAY_MS")? {
            config.retry_base_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "RETRY_MAX_DELAY_MS")? {
            config.retry_max_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PROGRESS_INTERVAL_MS")? {
            config.progress_interval_ms = v;
        }
        if let Some(v) = parse_var::<String>(&lookup, "WEBHOOK_URL")? {
            config.webhook_url = Some(v);
        }

        config.validate()?;
        debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Checks every field against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn out_of_range(
            field: &'static str,
            expected: &'static str,
            actual: impl ToString,
        ) -> ConfigError {
            ConfigError::OutOfRange {
                field,
                expected,
                actual: actual.to_string(),
            }
        }

        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.max_concurrent) {
            return Err(out_of_range("max_concurrent", "between 1 and 100", self.max_concurrent));
        }
        if self.retry_attempts < 1 {
            return Err(out_of_range("retry_attempts", "at least 1", self.retry_attempts));
        }
        if self.timeout_seconds == 0 {
            return Err(out_of_range("timeout_seconds", "positive", self.timeout_seconds));
        }
        if self.connect_timeout_seconds == 0 {
            return Err(out_of_range(
                "connect_timeout_seconds",
                "positive",
                self.connect_timeout_seconds,
            ));
        }
        if self.chunk_size_bytes == 0 {
            return Err(out_of_range("chunk_size_bytes", "positive", self.chunk_size_bytes));
        }
        if !self.max_bandwidth_mbps.is_finite() || self.max_bandwidth_mbps < 0.0 {
            return Err(out_of_range(
                "max_bandwidth_mbps",
                "a finite number >= 0",
                self.max_bandwidth_mbps,
            ));
        }
        if self.batch_size == 0 {
            return Err(out_of_range("batch_size", "at least 1", self.batch_size));
        }
        if !(1..=MAX_WORKERS_PER_JOB).contains(&self.workers_per_job) {
            return Err(out_of_range("workers_per_job", "between 1 and 16", self.workers_per_job));
        }
        if self.progress_interval_ms == 0 {
            return Err(out_of_range(
                "progress_interval_ms",
                "positive",
                self.progress_interval_ms,
            ));
        }
        Ok(())
    }

    /// Byte budget in bytes/second; 0 means unlimited.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn bandwidth_bytes_per_sec(&self) -> u64 {
        if self.max_bandwidth_mbps <= 0.0 {
            return 0;
        }
        (self.max_bandwidth_mbps * BYTES_PER_MIB).round().max(1.0) as u64
    }

    /// Retry policy built from the retry fields.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    /// Read timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Progress sampling interval.
    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}
