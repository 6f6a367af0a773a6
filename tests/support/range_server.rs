//! A wiremock responder that serves one file with HTTP range semantics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// One GET as seen by the responder.
#[derive(Debug, Clone)]
pub struct Seen {
    pub at: Instant,
    pub range: Option<String>,
}

/// Serves `body` for GET, honoring `Range: bytes=a-b` / `bytes=a-`.
#[derive(Clone)]
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    etag: Option<String>,
    ranges: bool,
    fail_first: usize,
    delay: Option<Duration>,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            etag: None,
            ranges: true,
            fail_first: 0,
            delay: None,
            hits: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sends `ETag: "<tag>"` on every success.
    pub fn with_etag(mut self, tag: &str) -> Self {
        self.etag = Some(format!("\"{tag}\""));
        self
    }

    /// Ignores `Range` and always answers 200 without `Accept-Ranges`.
    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    /// Answers the first `n` GETs with 503.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Delays every response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    /// Range headers of every GET, in arrival order.
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.seen().into_iter().map(|s| s.range).collect()
    }

    fn template(&self, status: u16) -> ResponseTemplate {
        let mut template = ResponseTemplate::new(status);
        if let Some(delay) = self.delay {
            template = template.set_delay(delay);
        }
        template
    }

    fn success(&self, status: u16, bytes: Vec<u8>) -> ResponseTemplate {
        let mut template = self.template(status).set_body_bytes(bytes);
        if self.ranges {
            template = template.insert_header("accept-ranges", "bytes");
        }
        if let Some(etag) = &self.etag {
            template = template.insert_header("etag", etag.as_str());
        }
        template
    }
}

fn parse_range(value: &str, len: u64) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse::<u64>().ok()?.min(len.saturating_sub(1))),
    };
    Some((start, end))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let n = self.hits.fetch_add(1, Ordering::SeqCst);
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.seen.lock().unwrap().push(Seen {
            at: Instant::now(),
            range: range.clone(),
        });

        if n < self.fail_first {
            return self.template(503).set_body_string("unavailable");
        }

        let len = self.body.len() as u64;
        let parsed = range.as_deref().and_then(|r| parse_range(r, len));
        match parsed {
            Some((start, _)) if self.ranges && start >= len => self
                .template(416)
                .insert_header("content-range", format!("bytes */{len}").as_str()),
            Some((start, end)) if self.ranges => {
                let end = end.unwrap_or(len - 1);
                let slice = self.body[start as usize..=end as usize].to_vec();
                self.success(206, slice).insert_header(
                    "content-range",
                    format!("bytes {start}-{end}/{len}").as_str(),
                )
            }
            _ => self.success(200, self.body.as_ref().clone()),
        }
    }
}

/// Mounts `responder` for GET `route` and a 405 for HEAD, so probes go
/// through the ranged GET fallback.
pub async fn mount_file(server: &MockServer, route: &str, responder: RangeResponder) {
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(405))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(responder)
        .mount(server)
        .await;
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
