//! Token-bucket admission control for outbound calls
//!
//! Bursts up to `capacity` are admitted instantly, then calls are spaced at
//! `refill_rate_per_sec`. Waiting callers sleep for exactly the time until
//! the next token, never in fixed polling steps.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

const STATS_WINDOW: Duration = Duration::from_secs(60);

/// Pure bucket arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThrottleState {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate_per_sec: f64,
}

impl ThrottleState {
    /// Full bucket
    pub fn new(capacity: f64, refill_rate_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate_per_sec,
        }
    }

    pub fn refill(&mut self, elapsed_secs: f64) {
        if elapsed_secs > 0.0 {
            let refilled = self.tokens + elapsed_secs * self.refill_rate_per_sec;
            self.tokens = refilled.min(self.capacity);
        }
    }

    /// Debit one token if available
    pub fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one whole token is available
    pub fn time_until_token(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.refill_rate_per_sec <= 0.0 {
            return Duration::MAX;
        }
        // Rates small enough to overflow a Duration never refill in practice
        Duration::try_from_secs_f64((1.0 - self.tokens) / self.refill_rate_per_sec)
            .unwrap_or(Duration::MAX)
    }
}

/// Snapshot returned by [`Throttle::get_stats`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleStats {
    pub tokens_available: f64,
    pub requests_last_minute: usize,
    pub requests_per_second: f64,
    pub burst_size: f64,
}

struct Inner {
    bucket: ThrottleState,
    last_refill: Instant,
    granted: VecDeque<Instant>,
}

impl Inner {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.bucket.refill(elapsed.as_secs_f64());
        self.last_refill = now;
    }

    /// Take a token or report how long to wait for one
    fn admit(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.bucket.try_take() {
            self.granted.push_back(now);
            Ok(())
        } else {
            Err(self.bucket.time_until_token())
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&t) = self.granted.front() {
            if now.saturating_duration_since(t) > STATS_WINDOW {
                self.granted.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct Throttle {
    inner: Mutex<Inner>,
}

impl Throttle {
    /// `burst_size` is the bucket capacity, at least one token
    pub fn new(requests_per_second: f64, burst_size: u32) -> Self {
        let capacity = f64::from(burst_size).max(1.0);
        Self {
            inner: Mutex::new(Inner {
                bucket: ThrottleState::new(capacity, requests_per_second),
                last_refill: Instant::now(),
                granted: VecDeque::new(),
            }),
        }
    }

    /// Admit without waiting
    pub fn try_acquire(&self) -> bool {
        self.inner.lock().admit(Instant::now()).is_ok()
    }

    /// Block until a token is available or `timeout` elapses
    ///
    /// Fails as soon as the next token is known to arrive after the
    /// deadline, since only elapsed time adds tokens.
    pub fn acquire(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let now = Instant::now();
            let wait = match self.inner.lock().admit(now) {
                Ok(()) => return true,
                Err(wait) => wait,
            };
            match Self::bounded_wait(wait, deadline, now) {
                Some(sleep) => {
                    debug!(wait_ms = sleep.as_millis() as u64, "throttled");
                    std::thread::sleep(sleep);
                }
                None => return false,
            }
        }
    }

    pub async fn acquire_async(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let now = Instant::now();
            let wait = match self.inner.lock().admit(now) {
                Ok(()) => return true,
                Err(wait) => wait,
            };
            match Self::bounded_wait(wait, deadline, now) {
                Some(sleep) => {
                    debug!(wait_ms = sleep.as_millis() as u64, "throttled");
                    tokio::time::sleep(sleep).await;
                }
                None => return false,
            }
        }
    }

    fn bounded_wait(wait: Duration, deadline: Option<Instant>, now: Instant) -> Option<Duration> {
        match deadline {
            None if wait == Duration::MAX => None,
            None => Some(wait),
            Some(d) => {
                let remaining = d.saturating_duration_since(now);
                if wait > remaining {
                    None
                } else {
                    Some(wait)
                }
            }
        }
    }

    pub fn get_stats(&self) -> ThrottleStats {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.refill(now);
        inner.prune(now);
        ThrottleStats {
            tokens_available: inner.bucket.tokens,
            requests_last_minute: inner.granted.len(),
            requests_per_second: inner.bucket.refill_rate_per_sec,
            burst_size: inner.bucket.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_burst_then_throttled() {
        let throttle = Throttle::new(1.0, 3);
        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(!throttle.try_acquire());
    }

    #[test]
    fn test_acquire_waits_for_refill() {
        let throttle = Throttle::new(20.0, 1);
        assert!(throttle.try_acquire());

        let start = Instant::now();
        assert!(throttle.acquire(Some(Duration::from_secs(2))));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(30), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn test_acquire_times_out() {
        let throttle = Throttle::new(0.5, 1);
        assert!(throttle.try_acquire());
        assert!(!throttle.acquire(Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_stats_window() {
        let throttle = Throttle::new(100.0, 5);
        for _ in 0..4 {
            assert!(throttle.try_acquire());
        }
        let stats = throttle.get_stats();
        assert_eq!(stats.requests_last_minute, 4);
        assert_eq!(stats.burst_size, 5.0);
        assert_eq!(stats.requests_per_second, 100.0);
        assert!(stats.tokens_available <= 5.0);
    }

    #[test]
    fn test_time_until_token() {
        let mut state = ThrottleState::new(1.0, 2.0);
        assert_eq!(state.time_until_token(), Duration::ZERO);
        assert!(state.try_take());
        assert_eq!(state.time_until_token(), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_burst_still_admits() {
        let throttle = Throttle::new(10.0, 0);
        assert_eq!(throttle.get_stats().burst_size, 1.0);
        assert!(throttle.try_acquire());
        assert!(throttle.acquire(Some(Duration::from_secs(1))));
    }

    #[test]
    fn test_tiny_rate_waits_forever() {
        let state = ThrottleState {
            tokens: 0.0,
            capacity: 1.0,
            refill_rate_per_sec: 1e-300,
        };
        assert_eq!(state.time_until_token(), Duration::MAX);

        let throttle = Throttle::new(1e-300, 1);
        assert!(throttle.try_acquire());
        // Unbounded wait with no refill in sight gives up instead of sleeping
        assert!(!throttle.acquire(None));
    }

    #[tokio::test]
    async fn test_acquire_async() {
        let throttle = Throttle::new(50.0, 1);
        assert!(throttle.acquire_async(None).await);
        assert!(throttle.acquire_async(Some(Duration::from_secs(1))).await);
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_within_bounds(
            capacity in 1u32..20,
            rate in 0.1f64..50.0,
            ops in proptest::collection::vec((0.0f64..5.0, any::<bool>()), 0..200),
        ) {
            let mut state = ThrottleState::new(f64::from(capacity), rate);
            for (elapsed, take) in ops {
                state.refill(elapsed);
                if take {
                    state.try_take();
                }
                prop_assert!(state.tokens >= 0.0);
                prop_assert!(state.tokens <= state.capacity);
            }
        }
    }
}
