//! The HTTP capability the engine depends on.
//!
//! Workers talk to the network only through [`HttpTransport`]. The reqwest
//! implementation lives in [`client`](super::client); tests may supply their
//! own.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use super::DownloadError;
use super::job::ValidatorToken;

/// Streamed response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, DownloadError>>;

/// A byte range for a `Range` request header. `end` is exclusive;
/// `None` means "to the end of the resource".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte requested.
    pub start: u64,
    /// One past the last byte requested, or open-ended.
    pub end: Option<u64>,
}

impl ByteRange {
    /// Range `[start, end)`.
    #[must_use]
    pub fn bounded(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Range `[start, ..)`.
    #[must_use]
    pub fn open(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes requested when bounded.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    /// `Range` header value with an inclusive end: `bytes=start-(end-1)`.
    #[must_use]
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) if end > self.start => format!("bytes={}-{}", self.start, end - 1),
            Some(_) => format!("bytes={}-{}", self.start, self.start),
            None => format!("bytes={}-", self.start),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header_value())
    }
}

/// Status and headers of a response, with header names lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    /// HTTP status code.
    pub status: u16,
    headers: HashMap<String, String>,
}

impl ResponseHead {
    /// Creates a head from a status and `(name, value)` pairs.
    pub fn new<I, K, V>(status: u16, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
        }
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parsed `Content-Length`.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// Whether the server advertises `Accept-Ranges: bytes`.
    #[must_use]
    pub fn accepts_ranges(&self) -> bool {
        self.header("accept-ranges")
            .is_some_and(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
    }

    /// Strong `ETag`, if any.
    #[must_use]
    pub fn validator(&self) -> Option<ValidatorToken> {
        self.header("etag").and_then(ValidatorToken::from_etag)
    }

    /// First byte offset from `Content-Range: bytes start-end/total`.
    #[must_use]
    pub fn content_range_start(&self) -> Option<u64> {
        let value = self.header("content-range")?.trim();
        let spec = value.strip_prefix("bytes")?.trim_start();
        let (start, _) = spec.split_once('-')?;
        start.trim().parse().ok()
    }

    /// Complete length from `Content-Range: bytes start-end/total`, or from
    /// the `bytes */total` form a 416 carries.
    #[must_use]
    pub fn content_range_total(&self) -> Option<u64> {
        let value = self.header("content-range")?;
        let (_, total) = value.rsplit_once('/')?;
        total.trim().parse().ok()
    }

    /// Raw `Retry-After` value.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        self.header("retry-after")
    }

    /// Converts a non-success status into the matching [`DownloadError`].
    #[must_use]
    pub fn status_error(&self, url: &str) -> DownloadError {
        DownloadError::http_status_with_retry_after(
            url,
            self.status,
            self.retry_after().map(str::to_string),
        )
    }
}

/// A response whose body has not been consumed yet.
pub struct TransportResponse {
    /// Status and headers.
    pub head: ResponseHead,
    /// Body chunks; dropping it abandons the body.
    pub body: BodyStream,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

/// Minimal HTTP capability: header-only probe and optionally ranged GET.
///
/// Both methods return a response for every status code; only failures to
/// obtain a response at all are errors.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issues a `HEAD` request.
    async fn head(&self, url: &str) -> Result<ResponseHead, DownloadError>;

    /// Issues a `GET`, with a `Range` header when `range` is set.
    async fn get(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<TransportResponse, DownloadError>;
}
