//! Exponential backoff for retries and reconnects
//!
//! `BackoffPolicy::compute_delay` is a pure function of the attempt number
//! and the error class. Rate-limit responses use their own (larger)
//! base/multiplier pair. Every delay gets jitter so that many workers
//! retrying the same upstream do not retry in lockstep.

use rand::Rng;
use std::time::Duration;

/// Parameters for delay computation
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry of a transient failure
    pub base_delay: Duration,
    /// Growth factor per attempt for transient failures
    pub multiplier: f64,
    /// Upper bound on any computed delay (before jitter)
    pub max_delay: Duration,
    /// Delay before the first retry of a rate-limited call
    pub rate_limit_base_delay: Duration,
    /// Growth factor per attempt for rate-limited calls
    pub rate_limit_multiplier: f64,
    /// Jitter as a fraction of the delay, applied as +/- (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Total attempts for `retry_with_backoff`, including the first one
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            rate_limit_base_delay: Duration::from_secs(2),
            rate_limit_multiplier: 3.0,
            jitter_factor: 0.25,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Short delays for tests and local development
    pub fn aggressive() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            multiplier: 1.5,
            max_delay: Duration::from_secs(1),
            rate_limit_base_delay: Duration::from_millis(50),
            rate_limit_multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }

    /// Conservative delays for shared, heavily rate-limited providers
    pub fn conservative() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            rate_limit_base_delay: Duration::from_secs(5),
            rate_limit_multiplier: 3.0,
            jitter_factor: 0.3,
            max_attempts: 5,
        }
    }

    /// Delay for `attempt` (1-based) without jitter
    ///
    /// `min(base * multiplier^(attempt-1), max_delay)`. Attempt 0 is treated
    /// as attempt 1. The rate-limited schedule never drops below the normal
    /// one, whatever the configured pair.
    pub fn base_delay_for(&self, attempt: u32, rate_limited: bool) -> Duration {
        let normal = self.schedule(self.base_delay, self.multiplier, attempt);
        if rate_limited {
            let limited =
                self.schedule(self.rate_limit_base_delay, self.rate_limit_multiplier, attempt);
            limited.max(normal)
        } else {
            normal
        }
    }

    fn schedule(&self, base: Duration, multiplier: f64, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let raw = base.as_nanos() as f64 * multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        let capped = raw.min(self.max_delay.as_nanos() as f64);

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_nanos(capped.round() as u64)
        } else {
            self.max_delay
        }
    }

    /// Delay for `attempt` with random jitter of +/- `jitter_factor`
    pub fn compute_delay(&self, attempt: u32, rate_limited: bool) -> Duration {
        let jitter = if self.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.compute_delay_with_jitter(attempt, rate_limited, jitter)
    }

    /// Delay with an explicit jitter sample in `[-1.0, 1.0]` (for testing)
    pub fn compute_delay_with_jitter(
        &self,
        attempt: u32,
        rate_limited: bool,
        jitter: f64,
    ) -> Duration {
        let base = self.base_delay_for(attempt, rate_limited).as_nanos() as f64;
        let jitter = jitter.clamp(-1.0, 1.0) * self.jitter_factor;
        Duration::from_nanos((base * (1.0 + jitter)).max(0.0).round() as u64)
    }
}

/// `compute_delay(attempt, policy, is_rate_limited)`
pub fn compute_delay(attempt: u32, policy: &BackoffPolicy, is_rate_limited: bool) -> Duration {
    policy.compute_delay(attempt, is_rate_limited)
}

/// Attempt tracker for reconnect loops
///
/// Hands out one delay per attempt until `max_attempts` is reached.
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    max_attempts: Option<u32>,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a tracker; `None` means unlimited attempts
    pub fn new(policy: BackoffPolicy, max_attempts: Option<u32>) -> Self {
        Self {
            policy,
            max_attempts,
            current_attempt: 0,
        }
    }

    /// Get the next delay and advance the attempt counter
    ///
    /// Returns None once max attempts are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }
        self.current_attempt += 1;
        Some(self.policy.compute_delay(self.current_attempt, false))
    }

    /// Reset to the initial state (after a successful connect)
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Attempts handed out so far
    pub fn attempt_number(&self) -> u32 {
        self.current_attempt
    }

    /// Check if more attempts are available
    pub fn can_retry(&self) -> bool {
        match self.max_attempts {
            Some(max) => self.current_attempt < max,
            None => true,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            rate_limit_base_delay: Duration::from_millis(400),
            rate_limit_multiplier: 3.0,
            jitter_factor: 0.0,
            max_attempts: 3,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let policy = no_jitter();
        assert_eq!(policy.compute_delay(1, false), Duration::from_millis(100));
        assert_eq!(policy.compute_delay(2, false), Duration::from_millis(200));
        assert_eq!(policy.compute_delay(3, false), Duration::from_millis(400));
    }

    #[test]
    fn test_attempt_zero_same_as_one() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay_for(0, false), policy.base_delay_for(1, false));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = no_jitter();
        assert_eq!(policy.compute_delay(30, false), Duration::from_secs(10));
        assert_eq!(policy.compute_delay(30, true), Duration::from_secs(10));
        // Huge attempt numbers do not overflow
        assert_eq!(policy.compute_delay(u32::MAX, true), Duration::from_secs(10));
    }

    #[test]
    fn test_rate_limited_uses_own_pair() {
        let policy = no_jitter();
        assert_eq!(policy.compute_delay(1, true), Duration::from_millis(400));
        assert_eq!(policy.compute_delay(2, true), Duration::from_millis(1200));
    }

    #[test]
    fn test_rate_limited_floor_is_normal_schedule() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_secs(1),
            rate_limit_base_delay: Duration::from_millis(100),
            rate_limit_multiplier: 1.0,
            ..no_jitter()
        };
        assert_eq!(policy.compute_delay(1, true), Duration::from_secs(1));
        assert_eq!(policy.compute_delay(3, true), Duration::from_secs(4));
        assert_eq!(policy.compute_delay(3, false), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy {
            jitter_factor: 0.25,
            ..no_jitter()
        };

        let low = policy.compute_delay_with_jitter(2, false, -1.0);
        let high = policy.compute_delay_with_jitter(2, false, 1.0);
        assert_relative_eq!(low.as_secs_f64(), 0.150, epsilon = 1e-6);
        assert_relative_eq!(high.as_secs_f64(), 0.250, epsilon = 1e-6);

        for _ in 0..200 {
            let d = policy.compute_delay(2, false).as_secs_f64();
            assert!((0.150 - 1e-6..=0.250 + 1e-6).contains(&d));
        }
    }

    #[test]
    fn test_jitter_varies() {
        let policy = BackoffPolicy::default();
        let delays: Vec<Duration> = (0..5).map(|_| policy.compute_delay(1, false)).collect();
        // With jitter, these should not all be exactly equal
        assert!(delays.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn test_tracker_max_attempts() {
        let mut backoff = ExponentialBackoff::new(no_jitter(), Some(3));

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        assert!(backoff.next_delay().is_none());
        assert!(!backoff.can_retry());

        backoff.reset();
        assert_eq!(backoff.attempt_number(), 0);
        assert!(backoff.can_retry());
    }

    #[test]
    fn test_tracker_unlimited() {
        let mut backoff = ExponentialBackoff::new(no_jitter(), None);
        for _ in 0..100 {
            assert!(backoff.next_delay().is_some());
        }
        assert_eq!(backoff.attempt_number(), 100);
    }

    #[test]
    fn test_presets() {
        assert_eq!(BackoffPolicy::aggressive().base_delay, Duration::from_millis(10));
        assert_eq!(BackoffPolicy::conservative().max_delay, Duration::from_secs(60));
        assert_relative_eq!(BackoffPolicy::default().jitter_factor, 0.25);
    }
}
