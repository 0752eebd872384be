use core::time::Duration;
use std::time::Instant;

/// A token-bucket shaper implementation.
///
/// One token is one byte.
#[derive(Debug)]
pub struct Shaper {
    /// Tokens per second.
    limit: u64,
    tokens: f64,
    burst_size: u64,
    prev_ts: Instant,
}

impl Shaper {
    pub fn new(burst_size: u64, limit: u64) -> Self {
        Self::with_start(burst_size, limit, Instant::now())
    }

    fn with_start(burst_size: u64, limit: u64, now: Instant) -> Self {
        Self {
            limit,
            tokens: 0.0,
            burst_size,
            prev_ts: now,
        }
    }

    /// Called on each loop tick in a generator.
    ///
    /// Returns the number of tokens available to consume.
    #[inline]
    pub fn tick(&mut self) -> u64 {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.prev_ts);

        self.tokens += self.limit as f64 * elapsed.as_secs_f64();
        self.prev_ts = now;
        // Never accumulate more than one second worth of tokens.
        self.tokens = self.tokens.min(self.limit as f64);
        if (self.tokens as u64) < self.burst_size {
            return 0;
        }

        self.tokens as u64
    }

    /// Consume specified amount of tokens.
    ///
    /// Must be called after actual token consumption (i.e. sending bytes) to
    /// maintain this shaper.
    #[inline]
    pub fn consume(&mut self, num: u64) {
        self.tokens -= num as f64;
    }

    /// Approximate time until the next burst is available.
    pub fn delay(&self) -> Duration {
        if self.limit == 0 {
            return Duration::from_millis(10);
        }

        let missing = (self.burst_size as f64 - self.tokens).max(0.0);
        Duration::from_secs_f64(missing / self.limit as f64).max(Duration::from_millis(1))
    }
}
