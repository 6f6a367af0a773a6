//! Drives one job from `Pending` to a terminal outcome.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use super::{JobOutcome, JobResult};
use crate::download::DownloadError;
use crate::download::job::{DownloadJob, JobState};
use crate::download::planner::{ProbeInfo, TransferMode, TransferPlanner};
use crate::download::progress::JobProgress;
use crate::download::retry::{FailureClass, classify_error};
use crate::download::segment::Segment;
use crate::download::segmented;
use crate::download::single;
use crate::download::telemetry::{AttemptRecord, AttemptStatus};
use crate::download::worker::{Attempts, TransferContext};

/// How a successful job ended.
struct Finished {
    bytes: u64,
    already_existed: bool,
}

/// Runs `job` to completion and converts the result into its outcome.
///
/// Never returns an error: every failure becomes a
/// [`JobResult::Failed`] carrying its classification.
#[instrument(skip_all, fields(job_id = %job.id, url = %job.url))]
pub(super) async fn run_job(
    ctx: Arc<TransferContext>,
    planner: TransferPlanner,
    mut job: DownloadJob,
    progress: JobProgress,
) -> JobOutcome {
    let started = Instant::now();
    let result = drive(&ctx, &planner, &mut job, &progress).await;

    let result = match result {
        Ok(finished) => {
            let status = if finished.already_existed {
                AttemptStatus::AlreadyExists
            } else {
                AttemptStatus::Success
            };
            ctx.telemetry.record_attempt(&AttemptRecord {
                url: job.url.clone(),
                status,
                bytes: finished.bytes,
                duration: started.elapsed(),
            });
            info!(
                bytes = finished.bytes,
                already_existed = finished.already_existed,
                path = %job.destination.display(),
                "download complete"
            );
            JobResult::Success {
                path: job.destination.clone(),
                bytes: finished.bytes,
                already_existed: finished.already_existed,
            }
        }
        Err(error) => {
            let class = classify_error(&error);
            if class == FailureClass::Cancelled {
                // Cancellation bypasses the retry loop, so nothing has
                // reported this attempt yet.
                ctx.telemetry.record_attempt(&AttemptRecord {
                    url: job.url.clone(),
                    status: AttemptStatus::Failed,
                    bytes: job.bytes_transferred,
                    duration: started.elapsed(),
                });
            }
            let message = error.to_string();
            warn!(class = %class, error = %message, "download failed");
            job.fail(message.clone());
            JobResult::Failed { class, message }
        }
    };

    JobOutcome {
        id: job.id,
        url: job.url,
        result,
    }
}

async fn drive(
    ctx: &Arc<TransferContext>,
    planner: &TransferPlanner,
    job: &mut DownloadJob,
    progress: &JobProgress,
) -> Result<Finished, DownloadError> {
    if is_present(job).await {
        debug!(path = %job.destination.display(), "destination exists, skipping");
        advance(job, JobState::Verifying);
        advance(job, JobState::Completed);
        return Ok(Finished {
            bytes: 0,
            already_existed: true,
        });
    }

    if let Some(parent) = job.destination.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }

    // Probe retries, single-stream retries, and validator restarts share
    // one budget.
    let mut attempts = Attempts::new(Arc::clone(ctx), job.url.clone());
    let total = loop {
        advance(job, JobState::Probing);
        let probe = probe(ctx, planner, job, &mut attempts).await?;
        job.total_size = probe.total_size;
        progress.set_total(probe.total_size);

        let fetched = match planner.decide(&probe, job.workers) {
            TransferMode::SingleStream => {
                advance(job, JobState::SingleStream);
                single::run(ctx, job, &probe, progress, &mut attempts).await
            }
            TransferMode::Segmented(plan) => {
                advance(job, JobState::Segmented);
                fetch_and_combine(ctx, job, &probe, plan, progress).await
            }
        };

        match fetched {
            Ok(_) => break probe.total_size,
            Err(error @ DownloadError::ValidatorChanged { .. }) => {
                info!(error = %error, "remote content changed, restarting from zero");
                attempts.retry_after(error, 0).await?;
                progress.reset(0);
            }
            Err(error) => return Err(error),
        }
    };

    advance(job, JobState::Verifying);
    verify(job, total).await?;
    advance(job, JobState::Completed);
    Ok(Finished {
        bytes: job.bytes_transferred,
        already_existed: false,
    })
}

/// Probes `job.url`, retrying transient failures.
async fn probe(
    ctx: &TransferContext,
    planner: &TransferPlanner,
    job: &DownloadJob,
    attempts: &mut Attempts,
) -> Result<ProbeInfo, DownloadError> {
    loop {
        let result = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => Err(DownloadError::cancelled(job.url.as_str())),
            probed = planner.probe(&job.url) => probed,
        };
        match result {
            Ok(info) => {
                debug!(
                    size = ?info.total_size,
                    ranges = info.accepts_ranges,
                    validator = info.validator.is_some(),
                    "probed"
                );
                return Ok(info);
            }
            Err(error @ DownloadError::Cancelled { .. }) => return Err(error),
            Err(error) => attempts.retry_after(error, 0).await?,
        }
    }
}

async fn fetch_and_combine(
    ctx: &Arc<TransferContext>,
    job: &mut DownloadJob,
    probe: &ProbeInfo,
    plan: Vec<Segment>,
    progress: &JobProgress,
) -> Result<u64, DownloadError> {
    let fetched = segmented::fetch_segments(ctx, job, probe, plan, progress).await?;
    advance(job, JobState::Combining);
    let total = probe.total_size.unwrap_or_default();
    segmented::combine(ctx, &job.destination, total).await?;
    Ok(fetched)
}

/// Checks the published file against the probed size.
async fn verify(job: &DownloadJob, total: Option<u64>) -> Result<(), DownloadError> {
    let len = tokio::fs::metadata(&job.destination)
        .await
        .map_err(|e| DownloadError::io(&job.destination, e))?
        .len();
    match total {
        Some(expected) if expected != len => {
            Err(DownloadError::integrity(&job.destination, expected, len))
        }
        _ => Ok(()),
    }
}

async fn is_present(job: &DownloadJob) -> bool {
    tokio::fs::metadata(&job.destination)
        .await
        .is_ok_and(|meta| meta.is_file())
}

/// Applies a transition the driver knows to be legal.
fn advance(job: &mut DownloadJob, next: JobState) {
    if let Err(e) = job.transition(next) {
        warn!(error = %e, "unexpected job transition");
    }
}
