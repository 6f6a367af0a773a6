//! Progress UI (spinner) for download runs.

use std::sync::Arc;
use std::time::Duration;

use bulkget_core::ProgressSnapshot;
use bulkget_core::download::ProgressTracker;
use indicatif::{HumanBytes, HumanDuration, ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawns the spinner fed by `tracker` snapshots until `stop` fires.
/// Returns `None` when the spinner is disabled.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    tracker: Arc<ProgressTracker>,
    total_jobs: usize,
    stop: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !enabled {
        return None;
    }
    Some(tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        let cadence = tracker.interval();
        loop {
            let snapshot = tracker.snapshot().await;
            spinner.set_message(render(&snapshot, total_jobs));
            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(cadence) => {}
            }
        }
        spinner.finish_and_clear();
    }))
}

/// One-line progress text.
pub(crate) fn render(snapshot: &ProgressSnapshot, total_jobs: usize) -> String {
    let mut line = match snapshot.total_bytes {
        Some(total) => format!(
            "{} / {}",
            HumanBytes(snapshot.bytes_completed),
            HumanBytes(total)
        ),
        None => format!("{}", HumanBytes(snapshot.bytes_completed)),
    };
    if let Some(percent) = snapshot.percent() {
        line.push_str(&format!(" ({percent:.1}%)"));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let speed = snapshot.speed_bps.max(0.0) as u64;
    line.push_str(&format!(" at {}/s", HumanBytes(speed)));
    if let Some(eta) = snapshot.eta {
        line.push_str(&format!(", ETA {}", HumanDuration(eta)));
    }
    line.push_str(&format!(
        " [{} active of {total_jobs}]",
        snapshot.active_jobs
    ));
    line
}
