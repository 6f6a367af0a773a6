//! Retry logic with exponential backoff for transient transfer failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureClass`] types for
//! classifying transfer errors and determining retry behavior.
//!
//! # Overview
//!
//! When a probe or transfer fails, the error is classified exactly once into
//! a [`FailureClass`]:
//! - [`FailureClass::TransientNetwork`] - connect, timeout, reset, short body
//! - [`FailureClass::TransientServer`] - 5xx, throttling, recoverable range errors
//! - [`FailureClass::Permanent`] - other 4xx, malformed responses, bad URLs
//! - [`FailureClass::LocalIo`] - disk full, permission denied
//! - [`FailureClass::Cancelled`] - operator-initiated stop
//!
//! The [`RetryPolicy`] then determines whether to retry based on the class
//! and attempt count. The policy holds no mutable state, so the same inputs
//! always produce the same decision.
//!
//! # Example
//!
//! ```
//! use bulkget_core::download::{DownloadError, RetryPolicy, RetryDecision, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let busy = DownloadError::http_status("https://mirror.test/data.bin", 503);
//! let gone = DownloadError::http_status("https://mirror.test/data.bin", 404);
//!
//! assert!(matches!(
//!     policy.should_retry(classify_error(&busy), 1),
//!     RetryDecision::Retry { attempt: 2, .. }
//! ));
//! assert!(matches!(
//!     policy.should_retry(classify_error(&gone), 1),
//!     RetryDecision::DoNotRetry { .. }
//! ));
//! ```

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::DownloadError;
use super::constants::MAX_RETRY_AFTER;

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// First backoff step.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Ceiling for any single wait, Retry-After included.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Backoff multiplier applied per attempt.
const BACKOFF_BASE: f64 = 2.0;

/// Classification of transfer failures.
///
/// Decided once at the point of failure and carried as data through the
/// retry loop and into the job's terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    /// Connect errors, timeouts, resets, bodies that closed early.
    TransientNetwork,

    /// 5xx, throttling, and range errors that a restart can recover from.
    TransientServer,

    /// 4xx other than throttling, malformed headers, invalid URLs.
    Permanent,

    /// Local filesystem failure (disk full, permission denied).
    LocalIo,

    /// Operator-initiated cancellation.
    Cancelled,
}

impl FailureClass {
    /// Whether failures of this class may succeed on a later attempt.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientNetwork | Self::TransientServer)
    }

    /// Stable kebab-case label used in logs and outcomes.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient-network",
            Self::TransientServer => "transient-server",
            Self::Permanent => "permanent",
            Self::LocalIo => "local-io",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * 2^(attempt - 1), max_delay)
/// ```
///
/// With defaults, delays are 1s, 2s, 4s before retries run out.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    max_retries: u32,

    /// Delay before the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// `max_delay` is raised to `base_delay` when configured below it.
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Creates a policy with a custom retry count, using defaults for delays.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Returns the number of retries allowed after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the total attempt budget (initial attempt plus retries).
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Determines whether to retry a failed attempt.
    ///
    /// # Arguments
    ///
    /// * `class` - Classification of the failure
    /// * `attempt` - The attempt number that just failed (1-indexed)
    #[instrument(level = "debug", skip(self), fields(max_retries = self.max_retries))]
    pub fn should_retry(&self, class: FailureClass, attempt: u32) -> RetryDecision {
        if !class.is_retryable() {
            return RetryDecision::DoNotRetry {
                reason: format!("{class} failure - retry would not help"),
            };
        }

        if attempt > self.max_retries {
            debug!(attempt, max = self.max_retries, "retries exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }

        let delay = self.delay_for(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Classifies `error` and decides, honoring a server `Retry-After` hint.
    ///
    /// The hint replaces the computed backoff but is still capped at the
    /// policy's maximum delay.
    pub fn should_retry_error(&self, error: &DownloadError, attempt: u32) -> RetryDecision {
        let class = classify_error(error);
        match self.should_retry(class, attempt) {
            RetryDecision::Retry { delay, attempt } => {
                let delay = error
                    .retry_after()
                    .and_then(parse_retry_after)
                    .map_or(delay, |hinted| hinted.min(self.max_delay));
                RetryDecision::Retry { delay, attempt }
            }
            decision => decision,
        }
    }

    /// Backoff before the retry that follows failed attempt `attempt`.
    ///
    /// Formula: `min(base_delay * 2^(attempt - 1), max_delay)`
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = base_ms * BACKOFF_BASE.powf(f64::from(exponent));
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

/// Classifies a transfer error into a [`FailureClass`].
///
/// # HTTP Status Code Classification
///
/// | Status | Class | Rationale |
/// |--------|-------|-----------|
/// | 408 | TransientServer | Request timeout - may succeed |
/// | 416 | TransientServer | Range not satisfiable - restart from zero |
/// | 429 | TransientServer | Throttled - retry after backoff |
/// | other 4xx | Permanent | Client error - won't succeed on retry |
/// | 5xx | TransientServer | Server error - may be temporary |
///
/// # Non-HTTP Errors
///
/// | Error | Class |
/// |-------|-------|
/// | Timeout, Network (most), Incomplete | TransientNetwork |
/// | Network (TLS) | Permanent |
/// | Integrity, ValidatorChanged | TransientServer |
/// | InvalidUrl, MalformedResponse | Permanent |
/// | Io | LocalIo |
/// | Cancelled | Cancelled |
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureClass {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),
        DownloadError::Timeout { .. } | DownloadError::Incomplete { .. } => {
            FailureClass::TransientNetwork
        }
        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureClass::Permanent
            } else {
                FailureClass::TransientNetwork
            }
        }
        DownloadError::Integrity { .. } | DownloadError::ValidatorChanged { .. } => {
            FailureClass::TransientServer
        }
        DownloadError::InvalidUrl { .. } | DownloadError::MalformedResponse { .. } => {
            FailureClass::Permanent
        }
        DownloadError::Io { .. } => FailureClass::LocalIo,
        DownloadError::Cancelled { .. } => FailureClass::Cancelled,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureClass {
    match status {
        408 => FailureClass::TransientServer, // Request Timeout
        416 => FailureClass::TransientServer, // Range Not Satisfiable
        429 => FailureClass::TransientServer, // Too Many Requests
        status if (400..500).contains(&status) => FailureClass::Permanent,
        status if (500..600).contains(&status) => FailureClass::TransientServer,
        _ => FailureClass::Permanent,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use bulkget_core::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<u64>() {
        let duration = Duration::from_secs(seconds);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };

    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
        // Date already passed
        Err(_) => Some(Duration::ZERO),
    }
}
