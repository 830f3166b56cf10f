//! Timing utilities
//!
//! Everything takes the current `Instant` from the caller so worker loops
//! and tests share one notion of time.

use std::time::{Duration, Instant};

/// Sender-side media clock
///
/// Packet timestamps are microseconds since the clock started, truncated to
/// 32 bits; they wrap roughly every 71 minutes.
#[derive(Debug, Clone, Copy)]
pub struct MediaClock {
    start: Instant,
}

impl MediaClock {
    pub fn new(start: Instant) -> Self {
        MediaClock { start }
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn micros(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.start)
            .as_micros()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    /// 32-bit wire timestamp
    pub fn timestamp(&self, now: Instant) -> u32 {
        self.micros(now) as u32
    }
}

/// Periodic deadline: ACKs, keep-alives, statistics sampling
#[derive(Debug, Clone)]
pub struct Timer {
    interval: Duration,
    last_fire: Instant,
}

impl Timer {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Timer {
            interval,
            last_fire: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_fire) >= self.interval
    }

    pub fn reset(&mut self, now: Instant) {
        self.last_fire = now;
    }

    pub fn time_until_expiration(&self, now: Instant) -> Duration {
        self.interval
            .saturating_sub(now.saturating_duration_since(self.last_fire))
    }

    /// Fire if expired, returning true if it fired
    pub fn try_fire(&mut self, now: Instant) -> bool {
        if self.expired(now) {
            self.reset(now);
            true
        } else {
            false
        }
    }
}

/// Token bucket over bytes
///
/// Enforces the feeder's configured maximum bitrate.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Maximum tokens (burst size)
    capacity: u64,
    tokens: u64,
    /// Bytes added per microsecond
    rate: f64,
    last_update: Instant,
}

impl RateLimiter {
    pub fn new(rate_bps: u64, burst_bytes: u64, now: Instant) -> Self {
        RateLimiter {
            capacity: burst_bytes,
            tokens: burst_bytes,
            rate: bytes_per_micro(rate_bps),
            last_update: now,
        }
    }

    pub fn set_rate(&mut self, rate_bps: u64, now: Instant) {
        self.refill(now);
        self.rate = bytes_per_micro(rate_bps);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_us = now.saturating_duration_since(self.last_update).as_micros() as f64;
        let new_tokens = (elapsed_us * self.rate) as u64;

        if new_tokens > 0 {
            self.tokens = (self.tokens + new_tokens).min(self.capacity);
            self.last_update = now;
        }
    }

    /// Take `bytes` worth of tokens; false leaves the bucket untouched
    pub fn consume(&mut self, bytes: usize, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= bytes as u64 {
            self.tokens -= bytes as u64;
            true
        } else {
            false
        }
    }

    pub fn time_to_available(&mut self, bytes: usize, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= bytes as u64 {
            return Duration::ZERO;
        }
        if self.rate <= 0.0 {
            return Duration::MAX;
        }
        let needed = (bytes as u64) - self.tokens;
        Duration::from_micros((needed as f64 / self.rate).ceil() as u64)
    }
}

fn bytes_per_micro(rate_bps: u64) -> f64 {
    rate_bps as f64 / 8.0 / 1_000_000.0
}
