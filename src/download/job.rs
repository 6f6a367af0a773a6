//! Download jobs and their lifecycle state machine.
//!
//! A [`DownloadJob`] is created by the scheduler when a [`JobRequest`] is
//! pulled from the input, mutated only by the pipeline running it, and
//! dropped once its terminal outcome has been emitted. The temp file on disk
//! outlives it and is the durable resume anchor.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Identity of a job within one scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A caller's request to materialize a URL on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Source URL.
    pub url: String,
    /// Explicit destination; derived from the URL under the output folder when absent.
    #[serde(default)]
    pub destination: Option<PathBuf>,
    /// Segment worker hint; the configured default is used when absent.
    #[serde(default)]
    pub workers: Option<usize>,
}

impl JobRequest {
    /// Request for `url` with default destination and worker count.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            destination: None,
            workers: None,
        }
    }

    /// Overrides the destination path.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Overrides the segment worker hint.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }
}

impl From<&str> for JobRequest {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for JobRequest {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

/// Lifecycle states of a job.
///
/// ```text
/// Pending -> Probing -> SingleStream ----------------> Verifying -> Completed
///                    \-> Segmented -> Combining ----/
/// Pending -> Verifying (destination already present)
/// any non-terminal state -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Enqueued, not yet started.
    Pending,
    /// Learning size, range support, and validator.
    Probing,
    /// Fetching as one sequential stream.
    SingleStream,
    /// Fetching disjoint byte ranges in parallel.
    Segmented,
    /// Waiting for all segments, then publishing the file.
    Combining,
    /// Checking the published file.
    Verifying,
    /// Terminal: the file is at its final path.
    Completed,
    /// Terminal: gave up.
    Failed,
}

impl JobState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// A transfer-mode state may go back to `Probing` only when the job
    /// restarts from zero after the remote content changed; nothing goes
    /// back once `Combining` has been entered.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobState::{
            Combining, Completed, Failed, Pending, Probing, Segmented, SingleStream, Verifying,
        };
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Pending, Probing | Verifying)
            | (Probing, SingleStream | Segmented | Verifying)
            | (SingleStream | Segmented, Probing)
            | (SingleStream, Verifying)
            | (Segmented, Combining)
            | (Combining, Verifying)
            | (Verifying, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Probing => "probing",
            Self::SingleStream => "single_stream",
            Self::Segmented => "segmented",
            Self::Combining => "combining",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal job transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State the job was in.
    pub from: JobState,
    /// State that was requested.
    pub to: JobState,
}

/// Opaque server-issued identity of the remote content (a strong `ETag`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidatorToken(String);

impl ValidatorToken {
    /// Parses an `ETag` header value. Weak validators (`W/"..."`) and empty
    /// tags are rejected because they do not promise byte-identical content.
    #[must_use]
    pub fn from_etag(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.starts_with("W/") || value.starts_with("w/") {
            return None;
        }
        let tag = value.trim_matches('"');
        (!tag.is_empty()).then(|| Self(tag.to_string()))
    }

    /// The tag without surrounding quotes.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ValidatorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Live state of one job.
#[derive(Debug)]
pub struct DownloadJob {
    /// Identity within this run.
    pub id: JobId,
    /// Source URL.
    pub url: String,
    /// Final path of the published file.
    pub destination: PathBuf,
    /// Segment worker hint.
    pub workers: usize,
    state: JobState,
    /// Expected size once probed.
    pub total_size: Option<u64>,
    /// Bytes written by this run.
    pub bytes_transferred: u64,
    /// Most recent failure message.
    pub last_error: Option<String>,
    /// Validator the current temp data was written against.
    pub validator: Option<ValidatorToken>,
    /// Set once this run has written to the temp file, allowing in-process
    /// resume even without a validator.
    pub wrote_temp_this_run: bool,
}

impl DownloadJob {
    /// Creates a pending job.
    #[must_use]
    pub fn new(id: JobId, url: String, destination: PathBuf, workers: usize) -> Self {
        Self {
            id,
            url,
            destination,
            workers,
            state: JobState::Pending,
            total_size: None,
            bytes_transferred: 0,
            last_error: None,
            validator: None,
            wrote_temp_this_run: false,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Moves the job to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when the state machine forbids the move.
    pub fn transition(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(job_id = %self.id, from = %self.state, to = %next, "job transition");
        self.state = next;
        Ok(())
    }

    /// Marks the job failed with `message`. Ignored once terminal.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        if !self.state.is_terminal() {
            self.state = JobState::Failed;
        }
    }
}
