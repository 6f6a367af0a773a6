//! Per-attempt telemetry hook.
//!
//! The engine reports each finished attempt to a [`TelemetrySink`];
//! aggregation and export are left to the sink.

use std::time::Duration;

use serde::Serialize;
use tracing::info;

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Bytes were fetched and the file published.
    Success,
    /// The destination already existed; nothing was fetched.
    AlreadyExists,
    /// The attempt failed.
    Failed,
}

impl AttemptStatus {
    /// Stable label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::AlreadyExists => "already_exists",
            Self::Failed => "failed",
        }
    }
}

/// One finished attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// Source URL.
    pub url: String,
    /// Outcome classification.
    pub status: AttemptStatus,
    /// Bytes written during the attempt.
    pub bytes: u64,
    /// Wall time of the attempt.
    pub duration: Duration,
}

/// Receives attempt records. Implementations must not block.
pub trait TelemetrySink: Send + Sync {
    /// Records one finished attempt.
    fn record_attempt(&self, record: &AttemptRecord);
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record_attempt(&self, record: &AttemptRecord) {
        info!(
            target: "bulkget::telemetry",
            url = %record.url,
            status = record.status.as_str(),
            bytes = record.bytes,
            duration_ms = u64::try_from(record.duration.as_millis()).unwrap_or(u64::MAX),
            "download attempt"
        );
    }
}
