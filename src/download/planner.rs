//! Metadata probing and single-stream vs segmented decision.

use std::sync::Arc;

use tracing::{debug, instrument};

use super::DownloadError;
use super::constants::{DEFAULT_MIN_SEGMENTED_SIZE, MAX_WORKERS_PER_JOB};
use super::job::ValidatorToken;
use super::segment::{Segment, plan_segments};
use super::transport::{ByteRange, HttpTransport, ResponseHead};

/// What a probe learned about a remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    /// Total size, `None` when the server did not say.
    pub total_size: Option<u64>,
    /// Whether the server honors byte ranges.
    pub accepts_ranges: bool,
    /// Strong validator, when offered.
    pub validator: Option<ValidatorToken>,
}

impl ProbeInfo {
    /// Whether a partial temp file can be continued with a range request.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.total_size.is_some() && self.accepts_ranges
    }

    fn from_head(head: &ResponseHead) -> Self {
        Self {
            total_size: head.content_length(),
            accepts_ranges: head.accepts_ranges(),
            validator: head.validator(),
        }
    }
}

/// How a job's bytes will be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMode {
    /// One sequential stream.
    SingleStream,
    /// Parallel disjoint ranges into one pre-sized temp file.
    Segmented(Vec<Segment>),
}

/// Probes URLs and chooses a [`TransferMode`].
#[derive(Clone)]
pub struct TransferPlanner {
    transport: Arc<dyn HttpTransport>,
    min_segmented_size: u64,
}

impl std::fmt::Debug for TransferPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferPlanner")
            .field("min_segmented_size", &self.min_segmented_size)
            .finish_non_exhaustive()
    }
}

impl TransferPlanner {
    /// Creates a planner that segments files of at least `min_segmented_size` bytes.
    #[must_use]
    pub fn new(transport: Arc<dyn HttpTransport>, min_segmented_size: u64) -> Self {
        Self {
            transport,
            min_segmented_size: min_segmented_size.max(1),
        }
    }

    /// Creates a planner with the default segmentation threshold.
    #[must_use]
    pub fn with_defaults(transport: Arc<dyn HttpTransport>) -> Self {
        Self::new(transport, DEFAULT_MIN_SEGMENTED_SIZE)
    }

    /// Learns size, range support, and validator for `url`.
    ///
    /// Tries `HEAD` first. When that fails, returns a non-2xx status, or
    /// does not report a non-zero `Content-Length`, opens a `GET` for
    /// `bytes=0-` and abandons the body after reading the headers. A `416`
    /// with `Content-Range: bytes */0` means the resource is empty.
    ///
    /// # Errors
    ///
    /// Returns the fallback request's error, or [`DownloadError::HttpStatus`]
    /// when the fallback answers with a non-2xx status.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn probe(&self, url: &str) -> Result<ProbeInfo, DownloadError> {
        match self.transport.head(url).await {
            Ok(head) if head.is_success() && head.content_length().is_some_and(|n| n > 0) => {
                let info = ProbeInfo::from_head(&head);
                debug!(?info, "probed with HEAD");
                return Ok(info);
            }
            Ok(head) => debug!(status = head.status, "HEAD unusable, falling back to GET"),
            Err(DownloadError::InvalidUrl { url }) => return Err(DownloadError::InvalidUrl { url }),
            Err(e) => debug!(error = %e, "HEAD failed, falling back to GET"),
        }

        let response = self.transport.get(url, Some(ByteRange::open(0))).await?;
        let head = response.head;
        drop(response.body);

        let info = match head.status {
            416 if head.content_range_total() == Some(0) => ProbeInfo {
                total_size: Some(0),
                accepts_ranges: head.accepts_ranges(),
                validator: head.validator(),
            },
            206 => ProbeInfo {
                total_size: head.content_range_total().or(head.content_length()),
                accepts_ranges: true,
                validator: head.validator(),
            },
            status if (200..300).contains(&status) => ProbeInfo::from_head(&head),
            _ => return Err(head.status_error(url)),
        };
        debug!(?info, "probed with GET");
        Ok(info)
    }

    /// Chooses the transfer mode for `info` with up to `workers` segments.
    ///
    /// Segments only when size and range support are both known and the
    /// size reaches the threshold; the worker count is clamped to 1..=16.
    #[must_use]
    pub fn decide(&self, info: &ProbeInfo, workers: usize) -> TransferMode {
        let workers = workers.clamp(1, MAX_WORKERS_PER_JOB);
        match info.total_size {
            Some(size) if info.accepts_ranges && workers > 1 && size >= self.min_segmented_size => {
                TransferMode::Segmented(plan_segments(size, workers))
            }
            _ => TransferMode::SingleStream,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::transport::TransportResponse;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::sync::Mutex;

    /// Scripted transport: fixed HEAD and GET heads, records GET ranges.
    struct Scripted {
        head: Result<ResponseHead, ()>,
        get: ResponseHead,
        get_ranges: Mutex<Vec<Option<ByteRange>>>,
    }

    #[async_trait]
    impl HttpTransport for Scripted {
        async fn head(&self, url: &str) -> Result<ResponseHead, DownloadError> {
            self.head.clone().map_err(|()| DownloadError::timeout(url))
        }

        async fn get(
            &self,
            _url: &str,
            range: Option<ByteRange>,
        ) -> Result<TransportResponse, DownloadError> {
            self.get_ranges.lock().unwrap().push(range);
            Ok(TransportResponse {
                head: self.get.clone(),
                body: futures_util::stream::empty().boxed(),
            })
        }
    }

    fn planner(head: Result<ResponseHead, ()>, get: ResponseHead) -> (TransferPlanner, Arc<Scripted>) {
        let scripted = Arc::new(Scripted {
            head,
            get,
            get_ranges: Mutex::new(Vec::new()),
        });
        (TransferPlanner::new(scripted.clone(), 1024), scripted)
    }

    #[tokio::test]
    async fn test_probe_uses_head_when_usable() {
        let head = ResponseHead::new(
            200,
            [("content-length", "4096"), ("accept-ranges", "bytes"), ("etag", "\"v1\"")],
        );
        let (planner, scripted) = planner(Ok(head), ResponseHead::new(500, [("x", "y")]));
        let info = planner.probe("https://example.com/f").await.unwrap();
        assert_eq!(info.total_size, Some(4096));
        assert!(info.accepts_ranges);
        assert_eq!(info.validator.unwrap().as_str(), "v1");
        assert!(scripted.get_ranges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_probe_falls_back_to_ranged_get_when_head_rejected() {
        let get = ResponseHead::new(
            206,
            [("content-range", "bytes 0-99/100"), ("content-length", "100")],
        );
        let (planner, scripted) = planner(Ok(ResponseHead::new(405, [("allow", "GET")])), get);
        let info = planner.probe("https://example.com/f").await.unwrap();
        assert_eq!(info.total_size, Some(100));
        assert!(info.accepts_ranges);
        assert_eq!(
            *scripted.get_ranges.lock().unwrap(),
            vec![Some(ByteRange::open(0))]
        );
    }

    #[tokio::test]
    async fn test_probe_falls_back_when_head_errors_or_lacks_length() {
        let get = ResponseHead::new(200, [("content-length", "50")]);
        let (planner, _) = planner(Err(()), get.clone());
        let info = planner.probe("https://example.com/f").await.unwrap();
        assert_eq!(info.total_size, Some(50));
        assert!(!info.accepts_ranges);

        let (planner, scripted) = planner_with_empty_head(get);
        planner.probe("https://example.com/f").await.unwrap();
        assert_eq!(scripted.get_ranges.lock().unwrap().len(), 1);
    }

    fn planner_with_empty_head(get: ResponseHead) -> (TransferPlanner, Arc<Scripted>) {
        planner(Ok(ResponseHead::new(200, [("content-length", "0")])), get)
    }

    #[tokio::test]
    async fn test_probe_treats_unsatisfiable_empty_range_as_zero_size() {
        let (planner, _) =
            planner_with_empty_head(ResponseHead::new(416, [("content-range", "bytes */0")]));
        let info = planner.probe("https://example.com/empty").await.unwrap();
        assert_eq!(info.total_size, Some(0));
        assert_eq!(planner.decide(&info, 4), TransferMode::SingleStream);

        // a 416 for a non-empty resource is still an error
        let (planner, _) =
            planner_with_empty_head(ResponseHead::new(416, [("content-range", "bytes */10")]));
        let err = planner.probe("https://example.com/odd").await.unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { status: 416, .. }));
    }

    #[tokio::test]
    async fn test_probe_fallback_error_status_is_reported() {
        let (planner, _) = planner(
            Ok(ResponseHead::new(404, [("x", "y")])),
            ResponseHead::new(404, [("x", "y")]),
        );
        let err = planner.probe("https://example.com/missing").await.unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
    }

    #[test]
    fn test_decide_segments_large_ranged_files() {
        let (planner, _) = planner(Err(()), ResponseHead::default());
        let info = ProbeInfo {
            total_size: Some(10 * 1024),
            accepts_ranges: true,
            validator: None,
        };
        match planner.decide(&info, 4) {
            TransferMode::Segmented(segments) => assert_eq!(segments.len(), 4),
            TransferMode::SingleStream => panic!("expected segmented"),
        }
        // worker hint is clamped
        match planner.decide(&info, 64) {
            TransferMode::Segmented(segments) => assert_eq!(segments.len(), MAX_WORKERS_PER_JOB),
            TransferMode::SingleStream => panic!("expected segmented"),
        }
    }

    #[test]
    fn test_decide_single_stream_cases() {
        let (planner, _) = planner(Err(()), ResponseHead::default());
        let cases = [
            (Some(10 * 1024), false, 4),
            (None, true, 4),
            (Some(512), true, 4),
            (Some(10 * 1024), true, 1),
        ];
        for (total_size, accepts_ranges, workers) in cases {
            let info = ProbeInfo {
                total_size,
                accepts_ranges,
                validator: None,
            };
            assert_eq!(
                planner.decide(&info, workers),
                TransferMode::SingleStream,
                "{info:?} workers={workers}"
            );
        }
    }
}
