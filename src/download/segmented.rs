//! Parallel ranged transfer into one shared temp file, and the Combiner.
//!
//! The temp file is pre-sized to the full length. Each segment worker opens
//! it independently, seeks to its own cursor, and writes only inside its
//! `[start, end)` range, so siblings never overlap. A segment retries its own
//! remaining sub-range under the retry policy; a segment that gives up stops
//! its siblings. The Combiner is the join barrier: it runs only after every
//! segment reported complete.
//!
//! Segment requests count against the shared [`RateLimiter`]. The job's own
//! admission slot carries one request at a time; every further parallel
//! request holds an extra slot from the limiter for as long as its body is
//! streaming.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::DownloadError;
use super::job::{DownloadJob, ValidatorToken};
use super::planner::ProbeInfo;
use super::progress::JobProgress;
use super::rate_limiter::{RateLimiter, SlotPermit};
use super::resume::{self, ResumeRecord};
use super::segment::{Segment, is_partition};
use super::transport::ByteRange;
use super::worker::{Attempts, TransferContext, flush_after, open_at, publish, pump_body};

/// Fetches every segment of `job` into the temp file.
///
/// Returns the bytes written by this call once all segments are complete.
/// The resume sidecar is checkpointed whenever the segment workers stop.
#[instrument(skip_all, fields(job_id = %job.id, url = %job.url, segments = plan.len()))]
pub(crate) async fn fetch_segments(
    ctx: &Arc<TransferContext>,
    job: &mut DownloadJob,
    probe: &ProbeInfo,
    plan: Vec<Segment>,
    progress: &JobProgress,
) -> Result<u64, DownloadError> {
    let total = probe
        .total_size
        .ok_or_else(|| DownloadError::malformed(&job.url, "segmented transfer without a size"))?;
    let temp = resume::temp_path(&job.destination);

    let mut segments = resume_or_presize(job, probe, total, plan).await?;
    job.validator.clone_from(&probe.validator);
    job.wrote_temp_this_run = true;

    let already: u64 = segments.iter().map(|s| s.written).sum();
    progress.reset(already);
    checkpoint(job, total, &segments).await?;

    let counters: Vec<Arc<AtomicU64>> = segments
        .iter()
        .map(|s| Arc::new(AtomicU64::new(s.written)))
        .collect();
    let siblings = ctx.cancel.child_token();
    let slots = SegmentSlots::new(Arc::clone(&ctx.limiter));
    let mut set = JoinSet::new();
    for (segment, counter) in segments.iter().zip(&counters) {
        if segment.is_complete() {
            continue;
        }
        let worker = SegmentWorker {
            ctx: Arc::clone(ctx),
            url: job.url.clone(),
            temp: temp.clone(),
            validator: probe.validator.clone(),
            segment: *segment,
            written: Arc::clone(counter),
            cancel: siblings.clone(),
            slots: slots.clone(),
            progress: progress.clone(),
        };
        set.spawn(worker.run());
    }

    let mut failure: Option<DownloadError> = None;
    while let Some(joined) = set.join_next().await {
        let result = joined
            .unwrap_or_else(|e| Err(DownloadError::io(&temp, std::io::Error::other(e))));
        if let Err(e) = result {
            if !matches!(e, DownloadError::Cancelled { .. }) {
                siblings.cancel();
            }
            failure = Some(match failure {
                None => e,
                Some(DownloadError::Cancelled { .. }) => e,
                Some(first) if matches!(e, DownloadError::ValidatorChanged { .. }) => {
                    debug!(error = %first, "superseded by validator change");
                    e
                }
                Some(first) => first,
            });
        }
    }

    for (segment, counter) in segments.iter_mut().zip(&counters) {
        segment.written = counter.load(Ordering::SeqCst).min(segment.len());
    }
    let fetched = segments.iter().map(|s| s.written).sum::<u64>() - already;
    job.bytes_transferred += fetched;

    match failure {
        Some(e @ DownloadError::ValidatorChanged { .. }) => {
            resume::discard_partial(&job.destination).await?;
            Err(e)
        }
        Some(e) => {
            checkpoint(job, total, &segments).await?;
            Err(e)
        }
        None => {
            info!(bytes = fetched, "all segments complete");
            Ok(fetched)
        }
    }
}

/// Verifies the joined temp file and publishes it at the final path.
#[instrument(skip_all, fields(path = %destination.display()))]
pub(crate) async fn combine(
    ctx: &TransferContext,
    destination: &Path,
    total: u64,
) -> Result<u64, DownloadError> {
    let len = publish(destination, Some(total)).await?;
    ctx.stats.increment_published();
    Ok(len)
}

/// Reuses a sidecar-backed segment plan, or starts a fresh pre-sized temp file.
async fn resume_or_presize(
    job: &DownloadJob,
    probe: &ProbeInfo,
    total: u64,
    plan: Vec<Segment>,
) -> Result<Vec<Segment>, DownloadError> {
    let temp = resume::temp_path(&job.destination);
    if let Some(record) = ResumeRecord::load(&job.destination).await
        && record.matches(&job.url, probe.validator.as_ref())
        && record.total_size == Some(total)
        && is_partition(&record.segments, total)
        && resume::temp_len(&job.destination).await == Some(total)
    {
        let done: u64 = record.segments.iter().map(|s| s.written.min(s.len())).sum();
        info!(resumed_bytes = done, "resuming segmented transfer from sidecar");
        return Ok(record
            .segments
            .into_iter()
            .map(|mut s| {
                s.written = s.written.min(s.len());
                s
            })
            .collect());
    }

    resume::discard_partial(&job.destination).await?;
    let writer = open_at(&temp, 0).await?;
    writer
        .get_ref()
        .set_len(total)
        .await
        .map_err(|e| DownloadError::io(&temp, e))?;
    debug!(total, "pre-sized temp file");
    Ok(plan)
}

async fn checkpoint(job: &DownloadJob, total: u64, segments: &[Segment]) -> Result<(), DownloadError> {
    if job.validator.is_none() {
        return Ok(());
    }
    ResumeRecord {
        url: job.url.clone(),
        validator: job.validator.clone(),
        total_size: Some(total),
        segments: segments.to_vec(),
    }
    .store(&job.destination)
    .await
}

/// Network slots shared by one job's segment workers.
#[derive(Clone)]
struct SegmentSlots {
    /// Stands in for the admission slot the job already holds.
    admission: Arc<Semaphore>,
    limiter: Arc<RateLimiter>,
}

/// Held for the lifetime of one segment request.
struct SegmentLease {
    _admission: Option<OwnedSemaphorePermit>,
    _shared: Option<SlotPermit>,
}

impl SegmentSlots {
    fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(1)),
            limiter,
        }
    }

    /// Waits for the job's own slot or a free limiter slot, whichever
    /// comes first. The own slot is never closed, so this only returns
    /// `None` if that invariant breaks.
    async fn lease(&self) -> Option<SegmentLease> {
        let own = || async move {
            Arc::clone(&self.admission)
                .acquire_owned()
                .await
                .ok()
                .map(|permit| SegmentLease {
                    _admission: Some(permit),
                    _shared: None,
                })
        };
        tokio::select! {
            biased;
            lease = own() => lease,
            slot = self.limiter.acquire_slot() => match slot {
                Ok(slot) => Some(SegmentLease {
                    _admission: None,
                    _shared: Some(slot),
                }),
                Err(_) => own().await,
            },
        }
    }
}

/// One segment's retry loop.
struct SegmentWorker {
    ctx: Arc<TransferContext>,
    url: String,
    temp: PathBuf,
    validator: Option<ValidatorToken>,
    segment: Segment,
    written: Arc<AtomicU64>,
    cancel: CancellationToken,
    slots: SegmentSlots,
    progress: JobProgress,
}

impl SegmentWorker {
    async fn run(self) -> Result<(), DownloadError> {
        let mut attempts =
            Attempts::with_cancel(Arc::clone(&self.ctx), self.url.clone(), self.cancel.clone());
        loop {
            let current = Segment {
                written: self.written.load(Ordering::SeqCst),
                ..self.segment
            };
            let Some(range) = current.remaining() else {
                return Ok(());
            };

            let mut fresh = 0u64;
            let result = self.fetch(range, &mut fresh).await;
            self.written.fetch_add(fresh, Ordering::SeqCst);
            match result {
                Ok(()) => {
                    debug!(start = self.segment.start, end = self.segment.end, "segment complete");
                    return Ok(());
                }
                Err(
                    e @ (DownloadError::ValidatorChanged { .. } | DownloadError::Cancelled { .. }),
                ) => return Err(e),
                Err(e) => {
                    warn!(
                        start = self.segment.start,
                        end = self.segment.end,
                        cursor = range.start + fresh,
                        "segment interrupted"
                    );
                    attempts.retry_after(e, fresh).await?;
                }
            }
        }
    }

    async fn fetch(&self, range: ByteRange, written: &mut u64) -> Result<(), DownloadError> {
        let url = self.url.as_str();
        let _lease = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(DownloadError::cancelled(url)),
            lease = self.slots.lease() => lease.ok_or_else(|| DownloadError::cancelled(url))?,
        };
        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(DownloadError::cancelled(url)),
            response = self.ctx.transport.get(url, Some(range)) => response?,
        };
        let head = response.head;
        let mut body = response.body;

        match head.status {
            206 => {}
            200 => {
                return Err(DownloadError::malformed(
                    url,
                    "server ignored a segment range request",
                ));
            }
            _ => return Err(head.status_error(url)),
        }
        if let (Some(expected), Some(actual)) = (&self.validator, head.validator())
            && *expected != actual
        {
            return Err(DownloadError::validator_changed(
                url,
                expected.as_str(),
                actual.as_str(),
            ));
        }
        if head.content_range_start() != Some(range.start) {
            return Err(DownloadError::malformed(
                url,
                format!(
                    "asked for {range}, got Content-Range {:?}",
                    head.header("content-range")
                ),
            ));
        }

        let expected = range.len();
        let mut writer = open_at(&self.temp, range.start).await?;
        let pumped = pump_body(
            &self.ctx,
            &self.cancel,
            url,
            &mut body,
            &mut writer,
            &self.temp,
            expected,
            &self.progress,
            written,
        )
        .await;
        flush_after(&mut writer, &self.temp, pumped).await?;

        if let Some(expected) = expected
            && *written < expected
        {
            return Err(DownloadError::incomplete(url, expected, *written));
        }
        Ok(())
    }
}
