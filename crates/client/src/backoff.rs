//! Reconnection backoff math.
//!
//! Runtime-agnostic so the connection state machine and its tests share it.

use std::time::Duration;

use rand::Rng;

const NANOS_PER_SEC: u64 = 1_000_000_000;
const MAX_SHIFT: u32 = 32;

/// Exponential backoff state shared by reconnect logic.
///
/// After `n` consecutive failures the next attempt waits `2^min(n, cap)` seconds plus a
/// uniform jitter in `[0, 1)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffState {
    attempts: u32,
    max_exponent: u32,
}

impl BackoffState {
    pub fn new(max_exponent: u32) -> Self {
        Self {
            attempts: 0,
            max_exponent,
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Consecutive failures since the last successful connection, capped.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt and return how long to wait before the next one.
    pub fn record_failure(&mut self) -> Duration {
        let jitter: f64 = rand::thread_rng().gen();
        self.record_failure_with_jitter(jitter)
    }

    pub fn record_failure_with_jitter(&mut self, jitter: f64) -> Duration {
        if self.attempts < self.max_exponent {
            self.attempts += 1;
        }
        Self::delay_for(self.attempts, jitter)
    }

    /// Delay for a given exponent; jitter is clamped into `[0, 1)`.
    ///
    /// Jitter is added in whole nanoseconds so the delay never rounds up to `2^n + 1`.
    pub fn delay_for(exponent: u32, jitter: f64) -> Duration {
        let nanos = (jitter.clamp(0.0, 1.0) * NANOS_PER_SEC as f64) as u64;
        Duration::from_secs(1u64 << exponent.min(MAX_SHIFT))
            + Duration::from_nanos(nanos.min(NANOS_PER_SEC - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_then_caps() {
        let mut backoff = BackoffState::new(7);
        let delays: Vec<u64> = (0..10)
            .map(|_| backoff.record_failure_with_jitter(0.0).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 64, 128, 128, 128, 128]);
        assert_eq!(backoff.attempts(), 7);
    }

    #[test]
    fn test_delay_bounds_with_random_jitter() {
        let cap = 7;
        let mut backoff = BackoffState::new(cap);
        for n in 1..=12u32 {
            let delay = backoff.record_failure().as_secs_f64();
            let base = 2f64.powi(n.min(cap) as i32);
            assert!(delay >= base, "attempt {n}: {delay} < {base}");
            assert!(delay < base + 1.0, "attempt {n}: {delay} >= {}", base + 1.0);
        }
    }

    #[test]
    fn test_reset_restarts_from_base() {
        let mut backoff = BackoffState::new(7);
        backoff.record_failure_with_jitter(0.5);
        backoff.record_failure_with_jitter(0.5);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(
            backoff.record_failure_with_jitter(0.0),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_jitter_is_clamped() {
        assert!(BackoffState::delay_for(0, 5.0) < Duration::from_secs(2));
        assert_eq!(BackoffState::delay_for(0, -1.0), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_near_one_stays_below_next_second() {
        for jitter in [0.9999999999, 1.0 - f64::EPSILON, 1.0] {
            let delay = BackoffState::delay_for(7, jitter);
            assert!(delay >= Duration::from_secs(128), "{jitter}: {delay:?}");
            assert!(delay < Duration::from_secs(129), "{jitter}: {delay:?}");
        }
    }
}
