use chrono::{DateTime, Utc};
use std::time::Duration;

/// Exponential backoff for withdrawals that failed transiently.
///
/// After the n-th transient failure (`retry_count == n`) the next attempt is
/// eligible at `now + min(base_delay * 2^n, max_delay)`. A withdrawal gets
/// `max_retries` attempts in total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: i32, base_delay: Duration, max_delay: Duration) -> Self {
        let max_retries = max_retries.max(1);
        let max_delay = max_delay.max(base_delay);
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exp = 2_u32.saturating_pow(retry_count.max(0) as u32);
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `retry_count` transient failures.
    pub fn allows_retry(&self, retry_count: i32) -> bool {
        retry_count < self.max_retries
    }

    pub fn next_retry_at(&self, now: DateTime<Utc>, retry_count: i32) -> DateTime<Utc> {
        let delay = chrono::Duration::milliseconds(self.backoff(retry_count).as_millis() as i64);
        now + delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30), Duration::from_secs(600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clamps_input_parameters() {
        let policy = RetryPolicy::new(0, Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_secs(30), Duration::from_secs(200));
        let delays: Vec<_> = (0..5).map(|n| policy.backoff(n)).collect();
        assert_eq!(delays[0], Duration::from_secs(30));
        assert_eq!(delays[1], Duration::from_secs(60));
        assert_eq!(delays[2], Duration::from_secs(120));
        assert_eq!(delays[3], Duration::from_secs(200)); // capped
        assert_eq!(delays[4], Duration::from_secs(200));
    }

    #[test]
    fn backoff_saturates_for_large_counts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(i32::MAX), policy.max_delay);
    }

    #[test]
    fn next_retry_at_is_offset_from_now() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1500), Duration::from_secs(60));
        let now = Utc::now();
        assert_eq!(
            policy.next_retry_at(now, 1),
            now + chrono::Duration::milliseconds(3000)
        );
    }

    #[test]
    fn allows_retry_below_bound() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }
}
