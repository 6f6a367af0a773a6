//! Live byte accounting and throughput/ETA estimation.
//!
//! Workers update per-job counters through a [`JobProgress`] handle; a
//! sampler (see [`ProgressTracker::spawn_sampler`]) periodically folds the
//! counters into a [`ProgressSnapshot`]. Snapshots are derived state only:
//! they are never persisted and never used to decide completion.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::constants::{DEFAULT_PROGRESS_INTERVAL, PROGRESS_HISTORY_LEN};
use super::job::JobId;

/// Point-in-time view of aggregate progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Bytes on disk for active jobs plus bytes of finished jobs.
    pub bytes_completed: u64,
    /// Expected total, `None` while any active job has an unknown size.
    pub total_bytes: Option<u64>,
    /// Moving-average throughput in bytes/second.
    pub speed_bps: f64,
    /// Estimated time remaining, `None` when speed or total is unknown.
    pub eta: Option<Duration>,
    /// Jobs currently registered with the tracker.
    pub active_jobs: usize,
}

impl ProgressSnapshot {
    /// Completion percentage in `0.0..=100.0`, when the total is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some((self.bytes_completed as f64 / total as f64 * 100.0).min(100.0)),
            None => None,
        }
    }
}

/// Counters for a single job. Only that job's workers mutate them.
#[derive(Debug, Default)]
struct JobCounter {
    bytes: AtomicU64,
    total: AtomicU64,
    total_known: AtomicBool,
}

/// Worker-side handle for one job's counters.
#[derive(Debug, Clone)]
pub struct JobProgress {
    counter: Arc<JobCounter>,
    received: Arc<AtomicU64>,
}

impl JobProgress {
    /// Records `n` freshly written bytes.
    pub fn add(&self, n: u64) {
        self.counter.bytes.fetch_add(n, Ordering::Relaxed);
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    /// Resets the on-disk byte count, e.g. when resuming from a temp file or
    /// discarding one. Does not count as throughput.
    pub fn reset(&self, bytes: u64) {
        self.counter.bytes.store(bytes, Ordering::Relaxed);
    }

    /// Records the job's expected size once the probe learns it.
    pub fn set_total(&self, total: Option<u64>) {
        match total {
            Some(total) => {
                self.counter.total.store(total, Ordering::Relaxed);
                self.counter.total_known.store(true, Ordering::Relaxed);
            }
            None => self.counter.total_known.store(false, Ordering::Relaxed),
        }
    }

    /// Bytes currently accounted to this job.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.counter.bytes.load(Ordering::Relaxed)
    }
}

/// Aggregates per-job counters into speed and ETA estimates.
#[derive(Debug)]
pub struct ProgressTracker {
    jobs: DashMap<JobId, Arc<JobCounter>>,
    /// Monotonic count of bytes received across all jobs; drives speed.
    received: Arc<AtomicU64>,
    /// Bytes of jobs that already left the tracker.
    retired_bytes: AtomicU64,
    history: Mutex<VecDeque<u64>>,
    latest: Mutex<ProgressSnapshot>,
    interval: Duration,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL)
    }
}

impl ProgressTracker {
    /// Creates a tracker sampling every `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            received: Arc::new(AtomicU64::new(0)),
            retired_bytes: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(PROGRESS_HISTORY_LEN)),
            latest: Mutex::new(ProgressSnapshot::default()),
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Sampling interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Registers a job and returns the handle its workers report through.
    pub fn register(&self, id: JobId) -> JobProgress {
        let counter = Arc::clone(self.jobs.entry(id).or_default().value());
        JobProgress {
            counter,
            received: Arc::clone(&self.received),
        }
    }

    /// Removes a job. Its bytes stay in the aggregate when `keep_bytes` is set
    /// (completed jobs) and are dropped otherwise (failed or cancelled jobs).
    pub fn finish(&self, id: JobId, keep_bytes: bool) {
        if let Some((_, counter)) = self.jobs.remove(&id)
            && keep_bytes
        {
            self.retired_bytes
                .fetch_add(counter.bytes.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Samples the counters and recomputes the snapshot.
    ///
    /// Speed is the mean of successive deltas in the sample history divided
    /// by the sampling interval.
    #[allow(clippy::cast_precision_loss)]
    pub async fn tick(&self) -> ProgressSnapshot {
        let sample = self.received.load(Ordering::Relaxed);
        let speed_bps = {
            let mut history = self.history.lock().await;
            if history.len() == PROGRESS_HISTORY_LEN {
                history.pop_front();
            }
            history.push_back(sample);
            mean_delta(&history) / self.interval.as_secs_f64()
        };

        let retired = self.retired_bytes.load(Ordering::Relaxed);
        let mut bytes_completed = retired;
        let mut total_bytes = Some(retired);
        for entry in &self.jobs {
            let counter = entry.value();
            bytes_completed += counter.bytes.load(Ordering::Relaxed);
            total_bytes = match total_bytes {
                Some(sum) if counter.total_known.load(Ordering::Relaxed) => {
                    Some(sum + counter.total.load(Ordering::Relaxed))
                }
                _ => None,
            };
        }

        let eta = match total_bytes {
            Some(total) if speed_bps > 0.0 => {
                let remaining = total.saturating_sub(bytes_completed) as f64;
                Some(Duration::from_secs_f64(remaining / speed_bps))
            }
            _ => None,
        };

        let snapshot = ProgressSnapshot {
            bytes_completed,
            total_bytes,
            speed_bps,
            eta,
            active_jobs: self.jobs.len(),
        };
        trace!(?snapshot, "progress sampled");
        *self.latest.lock().await = snapshot.clone();
        snapshot
    }

    /// Most recently computed snapshot.
    pub async fn snapshot(&self) -> ProgressSnapshot {
        self.latest.lock().await.clone()
    }

    /// Spawns a task calling [`tick`](Self::tick) every interval until
    /// `stop` is cancelled.
    pub fn spawn_sampler(self: &Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.interval);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        tracker.tick().await;
                    }
                }
            }
            tracker.tick().await;
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean_delta(history: &VecDeque<u64>) -> f64 {
    if history.len() < 2 {
        return 0.0;
    }
    let deltas: Vec<u64> = history
        .iter()
        .zip(history.iter().skip(1))
        .map(|(a, b)| b.saturating_sub(*a))
        .collect();
    deltas.iter().sum::<u64>() as f64 / deltas.len() as f64
}
