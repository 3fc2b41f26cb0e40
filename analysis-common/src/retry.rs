use std::time;

/// The retry policy used to determine how long a failed job waits before it
/// is re-sent to the queue.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// The backoff interval for the first retry.
    base: time::Duration,
    /// The maximum possible backoff between retries.
    cap: time::Duration,
}

impl RetryPolicy {
    pub fn new(base_seconds: u64, cap_seconds: u64) -> Self {
        Self {
            base: time::Duration::from_secs(base_seconds),
            cap: time::Duration::from_secs(cap_seconds),
        }
    }

    /// Calculate the time until the next retry for a job failing its
    /// `attempt`-th attempt: `min(cap, base * 2^(attempt - 1))`.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        // Exponent is clamped so a pathological attempt count cannot overflow.
        let exponent = attempt.saturating_sub(1).min(31);
        let candidate = self.base.saturating_mul(2u32.pow(exponent));

        std::cmp::min(candidate, self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: time::Duration::from_secs(10),
            cap: time::Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.time_until_next_retry(1).as_secs(), 10);
        assert_eq!(policy.time_until_next_retry(2).as_secs(), 20);
        assert_eq!(policy.time_until_next_retry(3).as_secs(), 40);
        assert_eq!(policy.time_until_next_retry(5).as_secs(), 160);
        assert_eq!(policy.time_until_next_retry(6).as_secs(), 300);
        assert_eq!(policy.time_until_next_retry(60).as_secs(), 300);
    }

    #[test]
    fn test_backoff_stays_within_bounds() {
        let policy = RetryPolicy::new(10, 300);

        for attempt in 1..=64 {
            let delay = policy.time_until_next_retry(attempt);
            assert!(delay.as_secs() >= 10);
            assert!(delay.as_secs() <= 300);
        }
    }

    #[test]
    fn test_zeroth_attempt_uses_base_interval() {
        let policy = RetryPolicy::new(5, 60);

        assert_eq!(policy.time_until_next_retry(0).as_secs(), 5);
    }
}
