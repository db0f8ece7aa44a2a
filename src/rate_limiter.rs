//! Token-bucket rate limiter gating outbound event or byte rate (spec §4.2).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use crate::config::RateLimitMode;

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    mode: RateLimitMode,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: f64, refill_rate: f64, mode: RateLimitMode) -> Self {
        Self {
            mode,
            bucket: Mutex::new(Bucket { tokens: capacity, capacity, refill_rate, last_refill: Instant::now() }),
        }
    }

    pub fn mode(&self) -> RateLimitMode {
        self.mode
    }

    /// Applies a hot-reloaded `capacity`/`refill_rate` (§4.8); `mode` is not
    /// reloadable. Clamps the current token count down to the new capacity.
    pub fn reconfigure(&self, capacity: f64, refill_rate: f64) {
        let mut bucket = self.bucket.lock().unwrap();
        bucket.capacity = capacity;
        bucket.refill_rate = refill_rate;
        bucket.tokens = bucket.tokens.min(capacity);
    }

    fn refill_locked(bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.refill_rate).min(bucket.capacity);
        bucket.last_refill = now;
    }

    /// Non-blocking: returns `true` and deducts `n` tokens if available.
    pub fn try_acquire(&self, n: f64) -> bool {
        let mut bucket = self.bucket.lock().unwrap();
        Self::refill_locked(&mut bucket);
        if bucket.tokens >= n {
            bucket.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Suspends until `n` tokens are available or `deadline` elapses.
    /// Returns `false` if the deadline elapsed without ever acquiring the
    /// tokens; callers must not proceed as if the tokens were granted (P6).
    pub async fn acquire(&self, n: f64, deadline: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.try_acquire(n) {
                return true;
            }
            if start.elapsed() >= deadline {
                return false;
            }
            let wait = {
                let bucket = self.bucket.lock().unwrap();
                let deficit = (n - bucket.tokens).max(0.0);
                Duration::from_secs_f64((deficit / bucket.refill_rate).clamp(0.001, 1.0))
            };
            sleep(wait.min(deadline.saturating_sub(start.elapsed()))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_drains_and_blocks_past_capacity() {
        let rl = RateLimiter::new(10.0, 1.0, RateLimitMode::Events);
        assert!(rl.try_acquire(10.0));
        assert!(!rl.try_acquire(1.0));
    }

    #[tokio::test]
    async fn acquire_eventually_succeeds_after_refill() {
        let rl = RateLimiter::new(1.0, 1000.0, RateLimitMode::Events);
        assert!(rl.try_acquire(1.0));
        assert!(rl.acquire(1.0, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn acquire_returns_false_when_deadline_elapses_without_tokens() {
        let rl = RateLimiter::new(1.0, 0.001, RateLimitMode::Events);
        assert!(rl.try_acquire(1.0));
        assert!(!rl.acquire(1.0, Duration::from_millis(20)).await);
    }

    #[test]
    fn reconfigure_clamps_tokens_to_new_lower_capacity() {
        let rl = RateLimiter::new(10.0, 1.0, RateLimitMode::Events);
        rl.reconfigure(5.0, 2.0);
        assert!(rl.try_acquire(5.0));
        assert!(!rl.try_acquire(0.1));
    }
}
