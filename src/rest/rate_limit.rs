// =============================================================================
// Adaptive rate limiter — single shared token-bucket-style interval
// =============================================================================
//
// One instance gates every outbound broker REST call. The current interval
// widens on 429 and decays back down on success, bounded to [min, max].
// Grounded on the Python source's SmartRateLimiter: identical constants and
// identical monotonic interval arithmetic.
// =============================================================================

use parking_lot::Mutex;
use tokio::time::{sleep, Duration, Instant};

const MIN_INTERVAL_SECS: f64 = 0.5;
const MAX_INTERVAL_SECS: f64 = 5.0;
const DECAY_RATE: f64 = 0.95;
const PENALTY_MULTIPLIER: f64 = 1.5;

struct Inner {
    current_interval: f64,
    last_call: Option<Instant>,
}

/// Shared across every REST caller; treated as a dependency injected into
/// the REST client rather than a hidden global.
pub struct RateLimiter {
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                current_interval: MIN_INTERVAL_SECS,
                last_call: None,
            }),
        }
    }

    /// Block until the current interval has elapsed since the last call.
    pub async fn wait(&self) {
        let sleep_for = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let wait_secs = match inner.last_call {
                Some(last) => {
                    let elapsed = now.duration_since(last).as_secs_f64();
                    (inner.current_interval - elapsed).max(0.0)
                }
                None => 0.0,
            };
            inner.last_call = Some(now);
            wait_secs
        };

        if sleep_for > 0.0 {
            sleep(Duration::from_secs_f64(sleep_for)).await;
        }
    }

    pub fn report_success(&self) {
        let mut inner = self.inner.lock();
        inner.current_interval = (inner.current_interval * DECAY_RATE).max(MIN_INTERVAL_SECS);
    }

    pub fn report_429(&self) {
        let mut inner = self.inner.lock();
        inner.current_interval =
            (inner.current_interval * PENALTY_MULTIPLIER).min(MAX_INTERVAL_SECS);
    }

    pub fn current_interval(&self) -> f64 {
        self.inner.lock().current_interval
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_growth_under_repeated_429s() {
        let limiter = RateLimiter::new();
        let mut expected = MIN_INTERVAL_SECS;
        for _ in 0..5 {
            limiter.report_429();
            expected = (expected * PENALTY_MULTIPLIER).min(MAX_INTERVAL_SECS);
            assert!((limiter.current_interval() - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn monotonic_decay_under_repeated_successes() {
        let limiter = RateLimiter::new();
        // Push the interval up first so decay has somewhere to go.
        for _ in 0..6 {
            limiter.report_429();
        }
        let mut expected = limiter.current_interval();
        for _ in 0..5 {
            limiter.report_success();
            expected = (expected * DECAY_RATE).max(MIN_INTERVAL_SECS);
            assert!((limiter.current_interval() - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn interval_never_exceeds_max() {
        let limiter = RateLimiter::new();
        for _ in 0..50 {
            limiter.report_429();
        }
        assert!(limiter.current_interval() <= MAX_INTERVAL_SECS + 1e-9);
    }

    #[test]
    fn interval_never_drops_below_min() {
        let limiter = RateLimiter::new();
        for _ in 0..50 {
            limiter.report_success();
        }
        assert!(limiter.current_interval() >= MIN_INTERVAL_SECS - 1e-9);
    }

    #[tokio::test]
    async fn wait_does_not_block_on_first_call() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        limiter.wait().await;
        assert!(start.elapsed().as_millis() < 50);
    }
}
