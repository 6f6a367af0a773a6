//! Batch-completion notification.
//!
//! A [`BatchNotifier`] is invoked once per batch, after every outcome has
//! been emitted. Notification failures are logged and never change the
//! batch result.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::download::BatchSummary;

/// Receives the summary of a finished batch.
#[async_trait]
pub trait BatchNotifier: Send + Sync {
    /// Called once after the batch drains.
    async fn notify(&self, summary: &BatchSummary);
}

/// JSON body posted by [`WebhookNotifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookPayload {
    /// One-line human-readable summary.
    pub message: String,
    /// Jobs that reached a terminal outcome.
    pub total: usize,
    /// Jobs downloaded.
    pub succeeded: usize,
    /// Jobs that failed.
    pub failed: usize,
}

impl From<&BatchSummary> for WebhookPayload {
    fn from(summary: &BatchSummary) -> Self {
        Self {
            message: format!(
                "Download batch finished: {} succeeded, {} failed of {}",
                summary.succeeded, summary.failed, summary.total
            ),
            total: summary.total,
            succeeded: summary.succeeded,
            failed: summary.failed,
        }
    }
}

/// Posts the batch summary to a webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Request timeout for the webhook call.
    pub const TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a notifier posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(Self::TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Target URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BatchNotifier for WebhookNotifier {
    #[instrument(skip_all, fields(url = %self.url))]
    async fn notify(&self, summary: &BatchSummary) {
        let payload = WebhookPayload::from(summary);
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(status = response.status().as_u16(), "webhook delivered");
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "webhook rejected");
            }
            Err(e) => {
                warn!(error = %e, "webhook failed");
            }
        }
    }
}
