//! Transfer errors.
//!
//! Every variant carries the URL or path it concerns. Classification into
//! retryable and terminal failures happens once, in
//! [`classify_error`](super::retry::classify_error).

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while probing or transferring a file.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Connection-level failure below HTTP.
    #[error("network error downloading {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Connect or read deadline elapsed.
    #[error("timeout downloading {url}")]
    Timeout {
        url: String,
    },

    /// Non-success status from the server.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// Raw `Retry-After` header, parsed later by the retry policy.
        retry_after: Option<String>,
    },

    /// Local filesystem failure on a temp file, sidecar or destination.
    #[error("IO error writing to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Not an absolute http(s) URL.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        url: String,
    },

    /// The server answered with headers or a status the transfer cannot use.
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse {
        /// The URL whose response was rejected.
        url: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The body closed cleanly before the expected number of bytes arrived.
    #[error("stream for {url} ended after {received} of {expected} bytes")]
    Incomplete {
        /// The URL being transferred.
        url: String,
        /// Bytes the range or content length promised.
        expected: u64,
        /// Bytes actually received before the stream closed.
        received: u64,
    },

    /// The assembled file is not the size the probe announced.
    #[error("{path} has {actual_bytes} bytes, expected {expected_bytes}")]
    Integrity {
        path: PathBuf,
        expected_bytes: u64,
        actual_bytes: u64,
    },

    /// The remote resource changed identity since the partial data was written.
    #[error("remote content for {url} changed (validator {expected} -> {actual})")]
    ValidatorChanged {
        /// The URL being transferred.
        url: String,
        /// Validator recorded when the partial data was written.
        expected: String,
        /// Validator the server reports now.
        actual: String,
    },

    /// The transfer was stopped by the global cancellation signal.
    #[error("download of {url} cancelled")]
    Cancelled {
        /// The URL whose transfer was interrupted.
        url: String,
    },
}

impl DownloadError {
    /// Wraps a reqwest failure; reqwest timeouts become [`DownloadError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    pub fn malformed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn incomplete(url: impl Into<String>, expected: u64, received: u64) -> Self {
        Self::Incomplete {
            url: url.into(),
            expected,
            received,
        }
    }

    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    pub fn validator_changed(
        url: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ValidatorChanged {
            url: url.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Returns the Retry-After header carried by an HTTP status error.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}
