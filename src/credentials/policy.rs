use chrono::Duration;
use rand::{thread_rng, Rng};

use crate::cli::config::PoolSettings;

/// What to do with a credential after a failed release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Park it and hand it out again once the backoff has elapsed.
    Cooldown(Duration),
    /// Take it out of rotation until an operator re-enables it.
    Disable,
    /// Mark it failed; the cooldown sweep never revives it.
    Fail,
}

/// Decides the fate of a credential from its accumulated failure count.
pub trait CooldownPolicy: Send + Sync {
    fn on_failure(&self, failure_count: u32) -> FailureDisposition;
}

/// `base * 2^(n-1)` capped at `max`, disabling once `disable_threshold`
/// failures have accumulated.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    disable_threshold: u32,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, disable_threshold: u32) -> Self {
        Self {
            base,
            max,
            disable_threshold,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Backoff for the `failure_count`-th consecutive failure, before jitter.
    pub fn backoff(&self, failure_count: u32) -> Duration {
        let exponent = failure_count.saturating_sub(1).min(30);
        let base_ms = self.base.num_milliseconds().max(0);
        let scaled = base_ms.saturating_mul(1_i64 << exponent);
        Duration::milliseconds(scaled.min(self.max.num_milliseconds()))
    }
}

impl From<&PoolSettings> for ExponentialBackoff {
    fn from(settings: &PoolSettings) -> Self {
        Self::new(
            Duration::seconds(settings.backoff_base_secs as i64),
            Duration::seconds(settings.backoff_max_secs as i64),
            settings.disable_threshold,
        )
        .with_jitter(settings.backoff_jitter)
    }
}

impl CooldownPolicy for ExponentialBackoff {
    fn on_failure(&self, failure_count: u32) -> FailureDisposition {
        if failure_count >= self.disable_threshold {
            return FailureDisposition::Disable;
        }

        let mut backoff = self.backoff(failure_count);
        if self.jitter > 0.0 {
            let extra_ms = backoff.num_milliseconds() as f64 * thread_rng().gen_range(0.0..=self.jitter);
            backoff = (backoff + Duration::milliseconds(extra_ms as i64)).min(self.max);
        }

        FailureDisposition::Cooldown(backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::seconds(30), Duration::seconds(300), 4)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::seconds(30));
        assert_eq!(policy.backoff(2), Duration::seconds(60));
        assert_eq!(policy.backoff(3), Duration::seconds(120));
        assert_eq!(policy.backoff(10), Duration::seconds(300));
    }

    #[test]
    fn test_disable_threshold() {
        let policy = policy();
        assert_eq!(
            policy.on_failure(1),
            FailureDisposition::Cooldown(Duration::seconds(30))
        );
        assert_eq!(policy.on_failure(4), FailureDisposition::Disable);
        assert_eq!(policy.on_failure(9), FailureDisposition::Disable);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = policy().with_jitter(0.5);
        for _ in 0..50 {
            match policy.on_failure(2) {
                FailureDisposition::Cooldown(d) => {
                    assert!(d >= Duration::seconds(60));
                    assert!(d <= Duration::seconds(90));
                }
                other => panic!("unexpected disposition {:?}", other),
            }
        }
    }
}
