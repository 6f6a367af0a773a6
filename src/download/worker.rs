//! Machinery shared by the single-stream and segmented workers.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::DownloadError;
use super::progress::JobProgress;
use super::rate_limiter::RateLimiter;
use super::resume;
use super::retry::{RetryDecision, RetryPolicy, classify_error};
use super::scheduler::DownloadStats;
use super::telemetry::{AttemptRecord, AttemptStatus, TelemetrySink};
use super::transport::{BodyStream, HttpTransport};

/// Everything a worker needs besides its job.
pub(crate) struct TransferContext {
    pub(crate) transport: Arc<dyn HttpTransport>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) retry: RetryPolicy,
    pub(crate) chunk_size: usize,
    pub(crate) cancel: CancellationToken,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
    pub(crate) stats: Arc<DownloadStats>,
}

/// Attempt accounting for one retry loop.
///
/// A job's probe and single-stream transfer share one budget; each segment
/// of a segmented job gets its own.
pub(crate) struct Attempts {
    ctx: Arc<TransferContext>,
    cancel: CancellationToken,
    label: String,
    attempt: u32,
    started: Instant,
}

impl Attempts {
    pub(crate) fn new(ctx: Arc<TransferContext>, label: impl Into<String>) -> Self {
        let cancel = ctx.cancel.clone();
        Self::with_cancel(ctx, label, cancel)
    }

    /// Like [`new`](Self::new), but backoff waits stop on `cancel`.
    pub(crate) fn with_cancel(
        ctx: Arc<TransferContext>,
        label: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            cancel,
            label: label.into(),
            attempt: 1,
            started: Instant::now(),
        }
    }

    /// Wall time of the current attempt.
    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Records a failed attempt and waits out the backoff.
    ///
    /// Returns `Ok` when the caller should try again, or the error that
    /// ends the loop (permanent class, exhausted budget, or cancellation
    /// during the backoff).
    pub(crate) async fn retry_after(
        &mut self,
        error: DownloadError,
        bytes: u64,
    ) -> Result<(), DownloadError> {
        let class = classify_error(&error);
        warn!(
            url = %self.label,
            attempt = self.attempt,
            class = %class,
            error = %error,
            "attempt failed"
        );
        self.ctx.telemetry.record_attempt(&AttemptRecord {
            url: self.label.clone(),
            status: AttemptStatus::Failed,
            bytes,
            duration: self.elapsed(),
        });

        match self.ctx.retry.should_retry_error(&error, self.attempt) {
            RetryDecision::Retry { delay, attempt } => {
                info!(
                    url = %self.label,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "retrying after backoff"
                );
                self.ctx.stats.increment_retried();
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        return Err(DownloadError::cancelled(self.label.as_str()));
                    }
                    () = tokio::time::sleep(delay) => {}
                }
                self.attempt = attempt;
                self.started = Instant::now();
                Ok(())
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(url = %self.label, reason, "giving up");
                Err(error)
            }
        }
    }
}

/// Opens (creating if needed) `path` for writing at `offset`.
pub(crate) async fn open_at(path: &Path, offset: u64) -> Result<BufWriter<File>, DownloadError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    Ok(BufWriter::new(file))
}

/// Copies `body` into `writer` until the stream ends or `limit` bytes have
/// been accepted.
///
/// Each network chunk is re-split to the configured chunk size; every piece
/// is charged to the byte budget, written, then reported to `progress`.
/// `written` counts accepted bytes even when an error cuts the copy short;
/// the caller flushes `writer` either way.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn pump_body(
    ctx: &TransferContext,
    cancel: &CancellationToken,
    url: &str,
    body: &mut BodyStream,
    writer: &mut BufWriter<File>,
    path: &Path,
    limit: Option<u64>,
    progress: &JobProgress,
    written: &mut u64,
) -> Result<(), DownloadError> {
    loop {
        if limit.is_some_and(|limit| *written >= limit) {
            return Ok(());
        }
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DownloadError::cancelled(url)),
            next = body.next() => next,
        };
        let Some(chunk) = next else {
            return Ok(());
        };
        let mut chunk = chunk?;
        if let Some(limit) = limit {
            let room = usize::try_from(limit - *written).unwrap_or(usize::MAX);
            if chunk.len() > room {
                chunk.truncate(room);
            }
        }

        for piece in chunk.chunks(ctx.chunk_size.max(1)) {
            let len = piece.len() as u64;
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DownloadError::cancelled(url)),
                () = ctx.limiter.acquire_bytes(len) => {}
            }
            writer
                .write_all(piece)
                .await
                .map_err(|e| DownloadError::io(path, e))?;
            *written += len;
            progress.add(len);
        }
    }
}

/// Flushes `writer`, keeping the first error of `result` and the flush.
pub(crate) async fn flush_after(
    writer: &mut BufWriter<File>,
    path: &Path,
    result: Result<(), DownloadError>,
) -> Result<(), DownloadError> {
    let flushed = writer.flush().await.map_err(|e| DownloadError::io(path, e));
    result.and(flushed)
}

/// Publishes the temp file for `destination`.
///
/// Syncs the temp file, checks its length against `expected` when known,
/// then renames it onto the final path. The rename is the only point at
/// which the final path becomes visible. A length mismatch discards the
/// partial data.
pub(crate) async fn publish(destination: &Path, expected: Option<u64>) -> Result<u64, DownloadError> {
    let temp = resume::temp_path(destination);
    let file = OpenOptions::new()
        .write(true)
        .open(&temp)
        .await
        .map_err(|e| DownloadError::io(&temp, e))?;
    file.sync_all()
        .await
        .map_err(|e| DownloadError::io(&temp, e))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| DownloadError::io(&temp, e))?
        .len();
    drop(file);

    if let Some(expected) = expected
        && len != expected
    {
        resume::discard_partial(destination).await?;
        return Err(DownloadError::integrity(&temp, expected, len));
    }

    tokio::fs::rename(&temp, destination)
        .await
        .map_err(|e| DownloadError::io(destination, e))?;
    resume::remove_sidecar(destination).await;
    debug!(path = %destination.display(), bytes = len, "published");
    Ok(len)
}
