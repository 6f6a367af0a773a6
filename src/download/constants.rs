//! Constants for the download module (timeouts, sizing, file naming).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default read size for streamed bodies.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Default number of segment workers per job.
pub const DEFAULT_WORKERS_PER_JOB: usize = 4;

/// Upper bound on segment workers per job.
pub const MAX_WORKERS_PER_JOB: usize = 16;

/// Files smaller than this are always fetched as a single stream.
pub const DEFAULT_MIN_SEGMENTED_SIZE: u64 = 1024 * 1024;

/// Suffix appended to the final path for the in-progress temp file.
pub const TEMP_SUFFIX: &str = ".temp";

/// Suffix appended to the temp path for the resume sidecar.
pub const SIDECAR_SUFFIX: &str = ".json";

/// Default sampling cadence for progress snapshots.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Number of aggregate-byte samples kept for the moving-average speed.
pub const PROGRESS_HISTORY_LEN: usize = 12;

/// Maximum Retry-After value honored (1 hour).
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);
