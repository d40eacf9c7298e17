//! Retry bounds shared by the registration and block-read paths.
//!
//! [`RetryPolicy`] bounds retries by attempt count with exponential backoff.
//! [`RetryBudget`] bounds them by wall-clock time instead.

use std::time::{Duration, Instant};

use crate::config::MasterConfig;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Pause after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

impl From<&MasterConfig> for RetryPolicy {
    fn from(config: &MasterConfig) -> Self {
        Self::new(
            config.registration_max_attempts,
            Duration::from_millis(config.registration_initial_backoff_ms),
            Duration::from_millis(config.registration_max_backoff_ms),
        )
    }
}

/// A wall-clock deadline started at construction.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    started: Instant,
    budget: Duration,
}

impl RetryBudget {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn is_exhausted(&self) -> bool {
        self.elapsed() >= self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_policy_allows_at_least_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_zero_budget_is_exhausted_immediately() {
        let budget = RetryBudget::start(Duration::ZERO);
        assert!(budget.is_exhausted());
        assert_eq!(budget.remaining(), Duration::ZERO);

        let budget = RetryBudget::start(Duration::from_secs(60));
        assert!(!budget.is_exhausted());
        assert!(budget.remaining() > Duration::from_secs(59));
    }
}
