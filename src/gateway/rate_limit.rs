//! Rate Limiting for inbound client frames
//!
//! Each connection gets its own token bucket, so one chatty client cannot
//! starve the command loop for anyone else.
//!
//! ```text
//! ┌─────────────┐
//! │   Bucket    │ ← Holds tokens (max = capacity)
//! │  ● ● ● ●    │
//! │  ● ● ●      │ ← Tokens refill at `rate` per second
//! └─────────────┘
//!       │
//!       ▼
//! Frame arrives:
//!   - token available → consume 1, handle the frame
//!   - bucket empty    → reply with a `rate_limited` error
//! ```

use std::time::{Duration, Instant};

// Tokens are stored scaled by 1000 so fractional refills are not lost
const SCALE: u64 = 1000;

/// Token bucket owned by a single connection
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum tokens in bucket (burst capacity)
    capacity: u64,
    /// Tokens added per second
    refill_rate: f64,
    tokens_scaled: u64,
    last_refill: Instant,
}

impl RateLimiter {
    /// # Arguments
    /// * `capacity` - Burst size
    /// * `refill_rate` - Sustained frames per second
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_rate: refill_rate.max(0.0),
            tokens_scaled: capacity * SCALE,
            last_refill: Instant::now(),
        }
    }

    /// Bucket allowing `rate` frames per second with a burst of four seconds' worth
    pub fn per_second(rate: f64) -> Self {
        Self::new((rate * 4.0).ceil() as u64, rate)
    }

    /// Take one token if available
    pub fn try_acquire(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens_scaled < SCALE {
            return false;
        }
        self.tokens_scaled -= SCALE;
        true
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate * SCALE as f64) as u64;
        if tokens_to_add > 0 {
            self.last_refill = now;
            self.tokens_scaled = (self.tokens_scaled + tokens_to_add).min(self.capacity * SCALE);
        }
    }

    /// How long until the next token is available
    pub fn retry_after(&self) -> Duration {
        if self.refill_rate > 0.0 {
            Duration::from_secs_f64(1.0 / self.refill_rate)
        } else {
            Duration::from_secs(1)
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}
