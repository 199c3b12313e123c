use liveswap_models::PolicyConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential retry delay: `base * 2^(failures - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms.max(base_ms)),
        }
    }

    pub fn from_policy(policy: &PolicyConfig) -> Self {
        Self::new(policy.backoff_base_ms, policy.backoff_max_ms)
    }

    pub fn base_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.base.as_millis() as u64;
        let factor = 1u64
            .checked_shl(consecutive_failures - 1)
            .filter(|f| *f != 0)
            .unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_ms.saturating_mul(factor));
        delay.min(self.max)
    }

    /// Base delay plus up to 10% jitter, never above `max`.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let base = self.base_delay(consecutive_failures);
        let jitter_ms = (base.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        (base + jitter).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff::new(1_000, 10_000);
        assert_eq!(backoff.base_delay(0), Duration::ZERO);
        assert_eq!(backoff.base_delay(1), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(2));
        assert_eq!(backoff.base_delay(4), Duration::from_secs(8));
        assert_eq!(backoff.base_delay(5), Duration::from_secs(10));
        assert_eq!(backoff.base_delay(200), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff::new(1_000, 3_000);
        for failures in 1..6 {
            let base = backoff.base_delay(failures);
            let delay = backoff.delay(failures);
            assert!(delay >= base);
            assert!(delay <= Duration::from_secs(3));
            assert!(delay <= base + base / 10);
        }
    }
}
