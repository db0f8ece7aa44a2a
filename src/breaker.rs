//! Per-sink circuit breaker state machine (spec §4.3).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::EdgeBotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

impl State {
    /// Numeric encoding for `edgebot_breaker_state{sink}` (§6.6).
    pub fn as_gauge(self) -> i64 {
        match self {
            State::Closed => 0,
            State::Open => 1,
            State::HalfOpen => 2,
        }
    }
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_inflight: usize,
}

pub struct Breaker {
    failure_threshold: u32,
    open_duration: Duration,
    half_open_max_inflight: usize,
    inner: Mutex<Inner>,
}

/// A guarded call slot. Drop without calling `success`/`failure` counts as
/// neither (used only for `Cancelled` attempts that never completed).
pub struct Permit<'a> {
    breaker: &'a Breaker,
    half_open: bool,
    resolved: bool,
}

impl Breaker {
    pub fn new(failure_threshold: u32, open_duration: Duration, half_open_max_inflight: usize) -> Self {
        Self {
            failure_threshold,
            open_duration,
            half_open_max_inflight,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_inflight: 0,
            }),
        }
    }

    pub fn state(&self) -> State {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    fn maybe_transition_to_half_open(&self, inner: &mut Inner) {
        if inner.state == State::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.open_duration {
                    inner.state = State::HalfOpen;
                    inner.half_open_inflight = 0;
                }
            }
        }
    }

    /// Attempts to admit one call. Returns `CircuitOpen` if rejected.
    pub fn try_acquire(&self) -> Result<Permit<'_>, EdgeBotError> {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            State::Open => Err(EdgeBotError::CircuitOpen),
            State::Closed => Ok(Permit { breaker: self, half_open: false, resolved: false }),
            State::HalfOpen => {
                if inner.half_open_inflight >= self.half_open_max_inflight {
                    Err(EdgeBotError::CircuitOpen)
                } else {
                    inner.half_open_inflight += 1;
                    Ok(Permit { breaker: self, half_open: true, resolved: false })
                }
            }
        }
    }
}

impl<'a> Permit<'a> {
    pub fn success(mut self) {
        self.resolved = true;
        let mut inner = self.breaker.inner.lock().unwrap();
        if self.half_open {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn failure(mut self) {
        self.resolved = true;
        let mut inner = self.breaker.inner.lock().unwrap();
        if self.half_open {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
            inner.state = State::Open;
            inner.opened_at = Some(Instant::now());
            return;
        }
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.breaker.failure_threshold {
            inner.state = State::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

impl<'a> Drop for Permit<'a> {
    fn drop(&mut self) {
        if !self.resolved && self.half_open {
            let mut inner = self.breaker.inner.lock().unwrap();
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_open_after_threshold_consecutive_failures() {
        let b = Breaker::new(3, Duration::from_secs(60), 2);
        for _ in 0..3 {
            b.try_acquire().unwrap().failure();
        }
        assert_eq!(b.state(), State::Open);
        assert!(matches!(b.try_acquire(), Err(EdgeBotError::CircuitOpen)));
    }

    #[test]
    fn half_open_closes_on_first_success() {
        let b = Breaker::new(1, Duration::from_millis(1), 2);
        b.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(b.state(), State::HalfOpen);
        b.try_acquire().unwrap().success();
        assert_eq!(b.state(), State::Closed);
    }

    #[test]
    fn half_open_reopens_on_any_failure() {
        let b = Breaker::new(1, Duration::from_millis(1), 2);
        b.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(b.state(), State::HalfOpen);
        b.try_acquire().unwrap().failure();
        assert_eq!(b.state(), State::Open);
    }

    #[test]
    fn half_open_caps_concurrent_admits() {
        let b = Breaker::new(1, Duration::from_millis(1), 1);
        b.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(5));
        let _p = b.try_acquire().unwrap();
        assert!(matches!(b.try_acquire(), Err(EdgeBotError::CircuitOpen)));
    }
}
