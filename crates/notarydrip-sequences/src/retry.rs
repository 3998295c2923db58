//! Retry/backoff schedule for transient dispatch failures.

use chrono::{DateTime, Duration, Utc};
use notarydrip_core::config::RetryConfig;
use rand::Rng;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Leave the send pending until this instant.
    RetryAt(DateTime<Utc>),
    /// Retries are used up.
    Exhausted,
}

/// Bounded list of retry delays with optional jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delays_secs: Vec<u64>,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(delays_secs: Vec<u64>, jitter: f64) -> Self {
        Self {
            delays_secs,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.backoff_secs.clone(), config.jitter)
    }

    /// First attempt plus one per configured delay.
    pub fn max_attempts(&self) -> u32 {
        self.delays_secs.len() as u32 + 1
    }

    /// Delay before the retry that follows attempt number `attempts` (1-based),
    /// or None if that was the last allowed attempt.
    pub fn delay_after(&self, attempts: u32) -> Option<Duration> {
        let idx = attempts.checked_sub(1)? as usize;
        let base = *self.delays_secs.get(idx)? as i64;

        let spread = (base as f64 * self.jitter) as i64;
        let jitter = if spread > 0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0
        };
        Some(Duration::seconds((base + jitter).max(0)))
    }

    /// Decide after a transient failure on attempt `attempts`.
    pub fn decide(&self, attempts: u32, now: DateTime<Utc>) -> RetryDecision {
        match self.delay_after(attempts) {
            Some(delay) => RetryDecision::RetryAt(now + delay),
            None => RetryDecision::Exhausted,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay_after(1), Some(Duration::minutes(1)));
        assert_eq!(policy.delay_after(2), Some(Duration::minutes(5)));
        assert_eq!(policy.delay_after(3), Some(Duration::minutes(30)));
        assert_eq!(policy.delay_after(4), Some(Duration::hours(2)));
        assert_eq!(policy.delay_after(5), None);
        assert_eq!(policy.delay_after(0), None);
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::new(vec![10], 0.0);
        let now = Utc::now();
        assert_eq!(policy.decide(1, now), RetryDecision::RetryAt(now + Duration::seconds(10)));
        assert_eq!(policy.decide(2, now), RetryDecision::Exhausted);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(vec![100], 0.2);
        for _ in 0..50 {
            let d = policy.delay_after(1).unwrap().num_seconds();
            assert!((80..=120).contains(&d), "delay {d} outside jitter band");
        }
    }
}
