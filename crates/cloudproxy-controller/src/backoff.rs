//! Exponential backoff for provider retries.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// `base * 2^attempt`, capped at `max`. `attempt` counts earlier failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_millis() as u64;
        let cap = self.max.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).min(cap))
    }

    /// Unix millis of the next attempt after a failure at `now`.
    pub fn retry_at(&self, now: u64, attempt: u32) -> u64 {
        now.saturating_add(self.delay(attempt).as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(4), Duration::from_secs(10));
        assert_eq!(backoff.delay(200), Duration::from_secs(10));
    }

    #[test]
    fn retry_at_offsets_now() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(60));
        assert_eq!(backoff.retry_at(1_000, 2), 3_000);
    }
}
