//! Sequential whole-file transfer with resume-from-offset.
//!
//! Bytes go to `<final>.temp`. An existing temp file is continued with a
//! `Range: bytes=<len>-` request only when the server supports ranges and
//! the temp data is known to belong to the current remote content (a
//! matching sidecar validator, or data written earlier in this run against
//! the same validator). Anything else restarts from zero.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::DownloadError;
use super::job::DownloadJob;
use super::planner::ProbeInfo;
use super::progress::JobProgress;
use super::resume::{self, ResumeRecord};
use super::transport::ByteRange;
use super::worker::{Attempts, TransferContext, flush_after, open_at, publish, pump_body};

/// Result of one single-stream request.
enum Step {
    /// Bytes are all in the temp file.
    Done,
    /// The server already had nothing left to send.
    AlreadyComplete,
}

/// Downloads `job` as one stream and publishes it.
///
/// Returns the bytes written by this call. Retries transient failures with
/// `attempts`; a [`DownloadError::ValidatorChanged`] is returned
/// immediately so the caller can re-probe from zero.
#[instrument(skip_all, fields(job_id = %job.id, url = %job.url))]
pub(crate) async fn run(
    ctx: &Arc<TransferContext>,
    job: &mut DownloadJob,
    probe: &ProbeInfo,
    progress: &JobProgress,
    attempts: &mut Attempts,
) -> Result<u64, DownloadError> {
    let destination = job.destination.clone();
    prepare_temp(job, probe).await?;
    job.validator.clone_from(&probe.validator);
    job.wrote_temp_this_run = true;

    if probe.is_resumable() && probe.validator.is_some() {
        ResumeRecord {
            url: job.url.clone(),
            validator: probe.validator.clone(),
            total_size: probe.total_size,
            segments: Vec::new(),
        }
        .store(&destination)
        .await?;
    }

    let mut transferred = 0u64;
    loop {
        let mut written = 0u64;
        match attempt(ctx, job, probe, progress, &mut written).await {
            Ok(step) => {
                transferred += written;
                if matches!(step, Step::AlreadyComplete) {
                    info!("server reports range not satisfiable; temp file already complete");
                }
                break;
            }
            Err(e @ (DownloadError::ValidatorChanged { .. } | DownloadError::Cancelled { .. })) => {
                return Err(e);
            }
            Err(e) => {
                transferred += written;
                attempts.retry_after(e, written).await?;
            }
        }
    }

    job.bytes_transferred += transferred;
    publish(&destination, probe.total_size).await?;
    ctx.stats.increment_published();
    Ok(transferred)
}

/// Keeps the temp file only when it can be trusted for resume.
async fn prepare_temp(job: &DownloadJob, probe: &ProbeInfo) -> Result<(), DownloadError> {
    let Some(len) = resume::temp_len(&job.destination).await else {
        return Ok(());
    };

    let same_run = job.wrote_temp_this_run && job.validator == probe.validator;
    let from_sidecar = match ResumeRecord::load(&job.destination).await {
        Some(record) => record.matches(&job.url, probe.validator.as_ref()),
        None => false,
    };
    let fits = probe.total_size.is_some_and(|total| len <= total);

    if probe.is_resumable() && fits && (same_run || from_sidecar) {
        debug!(offset = len, "resuming from existing temp file");
        return Ok(());
    }
    debug!(
        offset = len,
        resumable = probe.is_resumable(),
        same_run,
        from_sidecar,
        "discarding untrusted temp file"
    );
    resume::discard_partial(&job.destination).await
}

/// One request: resume or restart, then stream the body into the temp file.
async fn attempt(
    ctx: &Arc<TransferContext>,
    job: &DownloadJob,
    probe: &ProbeInfo,
    progress: &JobProgress,
    written: &mut u64,
) -> Result<Step, DownloadError> {
    let url = job.url.as_str();
    let temp = resume::temp_path(&job.destination);
    let existing = if probe.is_resumable() {
        resume::temp_len(&job.destination).await.unwrap_or(0)
    } else {
        0
    };
    progress.reset(existing);

    let range = (existing > 0).then(|| ByteRange::open(existing));
    let response = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => return Err(DownloadError::cancelled(url)),
        response = ctx.transport.get(url, range) => response?,
    };
    let head = response.head;
    let mut body = response.body;

    let offset = match head.status {
        416 if range.is_some() => {
            let complete = probe.total_size.is_none_or(|total| existing == total)
                && head.content_range_total().is_none_or(|total| existing == total);
            if complete {
                return Ok(Step::AlreadyComplete);
            }
            warn!(offset = existing, "range not satisfiable for a short temp file; restarting");
            resume::discard_partial(&job.destination).await?;
            return Err(head.status_error(url));
        }
        206 if range.is_some() => {
            if let (Some(expected), Some(actual)) = (&job.validator, head.validator())
                && *expected != actual
            {
                resume::discard_partial(&job.destination).await?;
                return Err(DownloadError::validator_changed(
                    url,
                    expected.as_str(),
                    actual.as_str(),
                ));
            }
            if head.content_range_start() != Some(existing) {
                return Err(DownloadError::malformed(
                    url,
                    format!(
                        "asked for offset {existing}, got Content-Range {:?}",
                        head.header("content-range")
                    ),
                ));
            }
            existing
        }
        200 => {
            if range.is_some() {
                debug!("server ignored the range request; restarting from zero");
            }
            0
        }
        206 => {
            return Err(DownloadError::malformed(
                url,
                "partial content for an unranged request",
            ));
        }
        _ => return Err(head.status_error(url)),
    };

    let mut writer = open_at(&temp, offset).await?;
    if offset == 0 {
        writer
            .get_mut()
            .set_len(0)
            .await
            .map_err(|e| DownloadError::io(&temp, e))?;
        progress.reset(0);
    }

    let expected = probe
        .total_size
        .map(|total| total.saturating_sub(offset))
        .or_else(|| head.content_length());
    let pumped = pump_body(
        ctx,
        &ctx.cancel,
        url,
        &mut body,
        &mut writer,
        &temp,
        expected,
        progress,
        written,
    )
    .await;
    flush_after(&mut writer, &temp, pumped).await?;

    if let Some(expected) = expected
        && *written < expected
    {
        return Err(DownloadError::incomplete(url, expected, *written));
    }
    Ok(Step::Done)
}
