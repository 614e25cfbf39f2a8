//! Restart backoff for crashed workers.

use std::time::Duration;

/// Default delay before the first restart attempt.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound on the restart delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default number of consecutive failed restarts before a slot is marked failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Exponential restart policy applied per slot.
///
/// The attempt counter is consecutive: a worker that stays up for at least
/// `max_delay` resets it, so an occasional crash never climbs toward the cap.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Consecutive attempts allowed, `None` for unlimited.
    pub max_attempts: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: 2.0,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

impl RestartPolicy {
    /// Calculate the delay for a given attempt number (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs).min(self.max_delay)
    }

    /// Whether attempt number `attempt` (1-based) may run.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Whether a worker that ran for `uptime` counts as having recovered.
    #[must_use]
    pub fn is_stable(&self, uptime: Duration) -> bool {
        uptime >= self.max_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_and_cap() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(1000), Duration::from_secs(30));
    }

    #[test]
    fn test_attempt_zero_uses_initial_delay() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), policy.initial_delay);
    }

    #[test]
    fn test_max_attempts() {
        let policy = RestartPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(policy.allows(1));
        assert!(policy.allows(3));
        assert!(!policy.allows(4));

        let unlimited = RestartPolicy {
            max_attempts: None,
            ..Default::default()
        };
        assert!(unlimited.allows(u32::MAX));
    }

    #[test]
    fn test_stability_threshold() {
        let policy = RestartPolicy::default();
        assert!(!policy.is_stable(Duration::from_secs(29)));
        assert!(policy.is_stable(Duration::from_secs(30)));
    }
}
