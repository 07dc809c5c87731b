//! Per-consumer token-bucket rate limiter.
//!
//! One bucket per attached consumer socket, consumed once per inbound wire
//! message.  Capacity is the configured burst size; tokens refill at
//! `tokens_per_second`.  Exhaustion rejects the message for that consumer
//! only, without closing the socket.

use std::time::Instant;

use bc_domain::config::RateLimitConfig;

pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_params(config.burst_size, config.tokens_per_second)
    }

    pub fn with_params(burst_size: u32, tokens_per_second: f64) -> Self {
        Self {
            capacity: burst_size as f64,
            tokens: burst_size as f64,
            refill_per_sec: tokens_per_second,
            last_refill: Instant::now(),
        }
    }

    /// Consume one token.  Returns false when the bucket is empty.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }
}
