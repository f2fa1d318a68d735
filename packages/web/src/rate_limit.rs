//! Token-bucket rate limiting shared across concurrent fetches.
//!
//! A [`RateLimiter`] lets `burst` calls through immediately, then one more
//! call every `period`. It is meant to be wrapped in an `Arc` and shared by
//! every fetch derived from one request so the remote API sees the
//! aggregate rate, not a per-chunk one.
//!
//! The bucket is tracked as a theoretical arrival time: the instant at
//! which the bucket would be full again. Callers queue on an async mutex,
//! so waiting acquirers are served in arrival order.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Shared token bucket.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    period: Duration,
    /// How far ahead of now the arrival time may run before callers wait.
    tolerance: Duration,
    arrival: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter allowing `burst` immediate calls and one call per
    /// `period` after that.
    ///
    /// A `burst` of zero is treated as one.
    #[must_use]
    pub fn new(period: Duration, burst: u32) -> Self {
        Self {
            bucket: Some(Bucket {
                period,
                tolerance: period.saturating_mul(burst.max(1) - 1),
                arrival: Mutex::new(None),
            }),
        }
    }

    /// Creates a limiter that never waits.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self { bucket: None }
    }

    /// Returns `true` if this limiter never waits.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&self) {
        let Some(bucket) = &self.bucket else {
            return;
        };

        // Held across the sleep so later callers queue behind this one.
        let mut arrival = bucket.arrival.lock().await;
        let now = Instant::now();
        let next = arrival.map_or(now, |at| at.max(now));

        let wait = (next - now).saturating_sub(bucket.tolerance);
        if !wait.is_zero() {
            log::trace!("Rate limited, waiting {wait:?}");
            tokio::time::sleep(wait).await;
        }

        *arrival = Some(next + bucket.period);
    }
}
