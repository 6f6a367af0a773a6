//! reqwest-backed [`HttpTransport`].
//!
//! This module provides the `HttpClient` struct, created once and shared by
//! every worker so that connections are pooled across jobs.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{HeaderMap, RANGE};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use super::transport::{ByteRange, HttpTransport, ResponseHead, TransportResponse};

/// HTTP client for probes and streamed, optionally ranged, downloads.
///
/// Transparent decompression is left off so byte offsets in `Range`
/// requests match the bytes stored on disk.
///
/// # Example
///
/// ```no_run
/// use bulkget_core::download::{HttpClient, HttpTransport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new()?;
/// let head = client.head("https://example.com/file.bin").await?;
/// println!("size: {:?}", head.content_length());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with the default timeouts (30s connect, 5min read).
    ///
    /// # Errors
    ///
    /// Returns the builder error when the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a client with explicit timeouts.
    ///
    /// `read_timeout` bounds the gap between body reads, not the whole
    /// transfer, so large files are not cut off.
    ///
    /// # Errors
    ///
    /// Returns the builder error when the TLS backend cannot be initialized.
    #[instrument(level = "debug")]
    pub fn with_timeouts(
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(default_user_agent())
            .build()?;
        Ok(Self { client })
    }
}

fn default_user_agent() -> String {
    format!("bulkget/{}", env!("CARGO_PKG_VERSION"))
}

fn parse_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        _ => Err(DownloadError::invalid_url(url)),
    }
}

fn to_head(status: u16, headers: &HeaderMap) -> ResponseHead {
    ResponseHead::new(
        status,
        headers
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?.to_string()))),
    )
}

#[async_trait]
impl HttpTransport for HttpClient {
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    async fn head(&self, url: &str) -> Result<ResponseHead, DownloadError> {
        let parsed = parse_url(url)?;
        let response = self
            .client
            .head(parsed)
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;
        let head = to_head(response.status().as_u16(), response.headers());
        debug!(status = head.status, "HEAD response");
        Ok(head)
    }

    #[instrument(level = "debug", skip(self), fields(url = %url, range = ?range))]
    async fn get(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<TransportResponse, DownloadError> {
        let parsed = parse_url(url)?;
        let mut request = self.client.get(parsed);
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;
        let head = to_head(response.status().as_u16(), response.headers());
        debug!(status = head.status, "GET response");

        let owned_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| DownloadError::network(owned_url.as_str(), e)))
            .boxed();
        Ok(TransportResponse { head, body })
    }
}
