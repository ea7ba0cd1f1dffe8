//! Token-bucket rate limiting for outbound RTM calls.
//!
//! RTM allows roughly one request per second per API key with a small burst
//! allowance.  Every call through the client takes a token here first.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Longest the limiter itself will make a caller wait before rejecting.
const MAX_WAIT: Duration = Duration::from_secs(5);

/// Sustained request rate RTM tolerates, in requests per second.
pub const DEFAULT_RATE: f64 = 1.0;
/// Default burst capacity.
pub const DEFAULT_BURST: u32 = 3;

struct Bucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

/// Token bucket gating all outbound RTM calls.
///
/// Tokens accrue continuously at the sustained rate, capped at the burst
/// capacity; each call consumes one.  A caller short of a token waits for
/// the shortfall, unless the wait would exceed five seconds, in which case
/// the call is rejected immediately rather than queueing without bound.
///
/// The bucket state is held under one lock for the whole wait, so waiting
/// callers drain in arrival order.  Dropping the `acquire` future during
/// the wait releases the lock without consuming a token.
pub struct RateLimiter {
    state: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter with the given sustained rate (tokens per second)
    /// and burst capacity.  The bucket starts full.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is not positive or `burst` is zero.
    pub fn new(rate: f64, burst: u32) -> RateLimiter {
        assert!(rate > 0.0, "rate must be positive");
        assert!(burst > 0, "burst must be positive");
        RateLimiter {
            state: Mutex::new(Bucket {
                rate,
                burst: burst as f64,
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for the shortfall if necessary.
    ///
    /// Returns [`Error::RateLimited`] without waiting when the computed
    /// wait exceeds five seconds.
    pub async fn acquire(&self) -> Result<()> {
        let mut bucket = self.state.lock().await;
        let now = Instant::now();
        bucket.refill(now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let shortfall = Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate);
        if shortfall > MAX_WAIT {
            log::warn!(
                "rate limiter rejecting call: would wait {:.1}s",
                shortfall.as_secs_f64()
            );
            return Err(Error::RateLimited(format!(
                "request rate exceeded; next token in {:.1}s",
                shortfall.as_secs_f64()
            )));
        }

        tokio::time::sleep(shortfall).await;
        bucket.refill(Instant::now());
        bucket.tokens = (bucket.tokens - 1.0).max(0.0);
        Ok(())
    }

    /// Replace the sustained rate and burst capacity.
    ///
    /// The current token count is capped at the new burst so a shrink takes
    /// effect immediately.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is not positive or `burst` is zero.
    pub async fn reconfigure(&self, rate: f64, burst: u32) {
        assert!(rate > 0.0, "rate must be positive");
        assert!(burst > 0, "burst must be positive");
        let mut bucket = self.state.lock().await;
        bucket.refill(Instant::now());
        bucket.rate = rate;
        bucket.burst = burst as f64;
        bucket.tokens = bucket.tokens.min(bucket.burst);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new(DEFAULT_RATE, DEFAULT_BURST)
    }
}
