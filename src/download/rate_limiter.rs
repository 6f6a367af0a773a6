//! Dual throttle for transfers: concurrency slots and a byte budget.
//!
//! This module provides the [`RateLimiter`] struct which enforces two
//! independent caps shared by every job in the process:
//!
//! - **Slots** bound how many transfers may be in flight at once. A slot is a
//!   semaphore permit; it is returned when the [`SlotPermit`] is dropped.
//! - **Byte budget** bounds aggregate throughput with a token bucket refilled
//!   continuously at the configured bytes/second. A rate of zero disables it.
//!
//! # Example
//!
//! ```
//! use bulkget_core::download::RateLimiter;
//!
//! # async fn example() {
//! // Two transfers at a time, 1 MiB/s shared across them
//! let limiter = RateLimiter::new(2, 1024 * 1024);
//!
//! let slot = limiter.acquire_slot().await.unwrap();
//! limiter.acquire_bytes(8192).await;
//! drop(slot);
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

/// Returned when the slot pool was closed while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limiter slot pool closed")]
pub struct LimiterClosed;

/// Shared concurrency and bandwidth limiter.
///
/// This struct is designed to be wrapped in `Arc` and shared across multiple
/// Tokio tasks. Slot accounting uses a `tokio::sync::Semaphore`; the byte
/// budget is a `tokio::sync::Mutex`-guarded token bucket whose lock is never
/// held across a sleep.
#[derive(Debug)]
pub struct RateLimiter {
    /// Concurrency permits, one per in-flight transfer.
    slots: Arc<Semaphore>,

    /// Configured slot count.
    max_concurrent: usize,

    /// Slots currently handed out.
    in_flight: Arc<AtomicUsize>,

    /// Highest value `in_flight` has reached.
    peak_in_flight: Arc<AtomicUsize>,

    /// Byte budget, `None` when bandwidth is unlimited.
    bandwidth: Option<Mutex<TokenBucket>>,
}

/// Release handle for a concurrency slot.
///
/// The slot returns to the pool when this value is dropped.
#[derive(Debug)]
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The internal state of the byte token bucket.
#[derive(Debug)]
struct TokenBucket {
    /// Maximum tokens (bytes) the bucket can hold; one second of budget.
    capacity: u64,
    /// Tokens currently available. Never goes below zero.
    tokens: u64,
    /// Refill rate in bytes per second.
    rate: u64,
    /// Last time tokens were added.
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u64) -> Self {
        let capacity = rate.max(1);
        Self {
            capacity,
            tokens: capacity,
            rate,
            last_refill: Instant::now(),
        }
    }

    /// Adds tokens accumulated since the last refill.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let tokens_to_add = (elapsed.as_secs_f64() * self.rate as f64) as u64;

        if tokens_to_add > 0 {
            self.tokens = self.tokens.saturating_add(tokens_to_add).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Debits `amount` if available, else returns how long to wait for it.
    #[allow(clippy::cast_precision_loss)]
    fn try_take(&mut self, amount: u64) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= amount {
            self.tokens -= amount;
            return Ok(());
        }
        let missing = amount - self.tokens;
        Err(Duration::from_secs_f64(missing as f64 / self.rate as f64))
    }
}

impl RateLimiter {
    /// Creates a limiter with `max_concurrent` slots and a byte budget of
    /// `bytes_per_sec` (0 = unlimited).
    ///
    /// A `max_concurrent` of zero is raised to one.
    #[must_use]
    #[instrument(level = "debug")]
    pub fn new(max_concurrent: usize, bytes_per_sec: u64) -> Self {
        let max_concurrent = max_concurrent.max(1);
        debug!("creating rate limiter");
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            bandwidth: (bytes_per_sec > 0).then(|| Mutex::new(TokenBucket::new(bytes_per_sec))),
        }
    }

    /// Creates a limiter with `max_concurrent` slots and no byte budget.
    #[must_use]
    pub fn unlimited_bandwidth(max_concurrent: usize) -> Self {
        Self::new(max_concurrent, 0)
    }

    /// Returns the configured slot count.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Returns whether the byte budget is disabled.
    #[must_use]
    pub fn is_bandwidth_unlimited(&self) -> bool {
        self.bandwidth.is_none()
    }

    /// Returns how many slots are currently held.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Returns the highest number of simultaneously held slots observed.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Waits for a concurrency slot.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterClosed`] if the slot pool was closed with
    /// [`close`](Self::close) while waiting.
    pub async fn acquire_slot(&self) -> Result<SlotPermit, LimiterClosed> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)?;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        trace!(in_flight = now, "slot acquired");

        Ok(SlotPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Closes the slot pool, failing current and future `acquire_slot` calls.
    pub fn close(&self) {
        self.slots.close();
    }

    /// Waits until `amount` bytes of budget are available, then debits them.
    ///
    /// Requests larger than the bucket capacity are debited in
    /// capacity-sized pieces, so the bucket never overdraws. No-op when
    /// bandwidth is unlimited.
    pub async fn acquire_bytes(&self, amount: u64) {
        let Some(bucket) = &self.bandwidth else {
            return;
        };

        let mut remaining = amount;
        while remaining > 0 {
            let piece = {
                let guard = bucket.lock().await;
                remaining.min(guard.capacity)
            };
            loop {
                let wait = {
                    let mut guard = bucket.lock().await;
                    match guard.try_take(piece) {
                        Ok(()) => break,
                        Err(wait) => wait,
                    }
                };
                // Lock is released before sleeping
                trace!(wait_ms = wait.as_millis(), piece, "waiting for byte budget");
                tokio::time::sleep(wait).await;
            }
            remaining -= piece;
        }
    }

    /// Returns the bytes currently available in the budget, `None` when unlimited.
    pub async fn available_bytes(&self) -> Option<u64> {
        let bucket = self.bandwidth.as_ref()?;
        let mut guard = bucket.lock().await;
        guard.refill();
        Some(guard.tokens)
    }
}
