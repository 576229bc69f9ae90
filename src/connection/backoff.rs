use std::time::Duration;

/// Capped exponential reconnect delay: `min(cap, base × 2^min(max_exponent, attempt))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_exponent: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(10),
            max_exponent: 6,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (the first retry is attempt 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(self.max_exponent).min(31);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sequence_caps_at_ten_seconds() {
        let backoff = Backoff::default();
        let delays: Vec<u128> = (1..=7).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(delays, [1000, 2000, 4000, 8000, 10000, 10000, 10000]);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let backoff = Backoff { max_exponent: 40, ..Backoff::default() };
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
        assert_eq!(Backoff::default().delay(0), Duration::from_millis(500));
    }
}
