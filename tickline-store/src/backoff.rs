//! Exponential backoff used between store write retries.

use std::time::Duration;

/// Exponential backoff with optional jitter.
///
/// The delay for attempt `n` (0-based) is `base * factor^n`, capped at
/// `max`. Jitter spreads the result across +/- 50% so synchronized retries
/// from parallel workers do not stampede the store.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = scaled.min(self.max.as_secs_f64());
        let mut delay = Duration::from_secs_f64(capped);

        if self.jitter {
            let spread_ms = (delay.as_millis() as f64 * 0.5) as u64;
            let offset = fastrand::u64(0..=spread_ms * 2) as i64 - spread_ms as i64;
            let total = delay.as_millis() as i64 + offset;
            delay = Duration::from_millis(total.max(0) as u64);
        }

        delay
    }
}

/// Retry budget for one store operation.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> Backoff {
        Backoff {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_millis(500),
            jitter: false,
        }
    }

    #[test]
    fn delays_grow_exponentially() {
        let backoff = fixed();
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn delays_are_capped() {
        let backoff = fixed();
        assert_eq!(backoff.delay(3), Duration::from_millis(500));
        assert_eq!(backoff.delay(10), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_half_spread() {
        let backoff = Backoff {
            jitter: true,
            ..fixed()
        };
        for attempt in 0..4 {
            let expected = 100.0 * 2f64.powi(attempt as i32);
            let expected = expected.min(500.0);
            for _ in 0..20 {
                let ms = backoff.delay(attempt).as_millis() as f64;
                assert!(ms >= expected * 0.49, "attempt {attempt}: {ms} too small");
                assert!(ms <= expected * 1.51, "attempt {attempt}: {ms} too large");
            }
        }
    }

    #[test]
    fn default_policy_matches_append_contract() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
    }
}
