//! Per-entry retry backoff.

use std::time::Duration;

/// Capped exponential backoff: `base * 2^(n-1)`, never more than `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Create a schedule starting at `base` and capped at `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before the next attempt after `retry_count` failures.
    ///
    /// Zero failures means no delay.
    #[must_use]
    pub fn delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry_count - 1).min(31);
        self.base
            .checked_mul(1_u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(900))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(2), Duration::from_secs(10));
        assert_eq!(backoff.delay(3), Duration::from_secs(20));
        assert_eq!(backoff.delay(4), Duration::from_secs(40));
        assert_eq!(backoff.delay(5), Duration::from_secs(60));
        assert_eq!(backoff.delay(50), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_huge_retry_count_saturates() {
        let backoff = Backoff::new(Duration::from_secs(u64::MAX / 2), Duration::MAX);
        assert_eq!(backoff.delay(u32::MAX), Duration::MAX);
    }

    #[test]
    fn test_max_below_base_is_raised() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(10));
    }

    #[test]
    fn test_default() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(20), Duration::from_secs(900));
    }
}
