//! Retry policy as a pure decision over (attempt, failure category).
//!
//! The delay it returns is scheduling input for the orchestrator; nothing here
//! sleeps, so the policy is testable without timers.

use std::time::Duration;

use crate::models::enhancement::FailureCategory;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryController {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RetryController {
    /// `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `attempt` is the number of dispatch attempts already made, including
    /// the one that just failed.
    ///
    /// - `Validation` / `AuthError`: give up immediately.
    /// - `ProviderError` / `Timeout`: retry after `base * 2^attempt` (capped at
    ///   `max_delay`) until `attempt` reaches `max_attempts`.
    pub fn next_action(&self, attempt: u32, category: FailureCategory) -> RetryDecision {
        if !category.is_retryable() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(attempt))
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RetryController {
        RetryController::new(3, Duration::from_secs(1), Duration::from_secs(60))
    }

    #[test]
    fn test_input_errors_never_retry() {
        let c = controller();
        assert_eq!(
            c.next_action(1, FailureCategory::Validation),
            RetryDecision::GiveUp
        );
        assert_eq!(
            c.next_action(1, FailureCategory::AuthError),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_transient_errors_back_off_exponentially() {
        let c = controller();
        assert_eq!(
            c.next_action(1, FailureCategory::ProviderError),
            RetryDecision::Retry(Duration::from_secs(2))
        );
        assert_eq!(
            c.next_action(2, FailureCategory::Timeout),
            RetryDecision::Retry(Duration::from_secs(4))
        );
    }

    #[test]
    fn test_gives_up_at_attempt_cap() {
        let c = controller();
        assert_eq!(
            c.next_action(3, FailureCategory::ProviderError),
            RetryDecision::GiveUp
        );
        assert_eq!(
            c.next_action(7, FailureCategory::Timeout),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_delay_is_capped() {
        let c = RetryController::new(100, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(
            c.next_action(10, FailureCategory::ProviderError),
            RetryDecision::Retry(Duration::from_secs(30))
        );
        // Shift overflow saturates rather than wrapping.
        assert_eq!(
            c.next_action(40, FailureCategory::ProviderError),
            RetryDecision::Retry(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_zero_max_attempts_is_clamped() {
        let c = RetryController::new(0, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(c.max_attempts(), 1);
        assert_eq!(
            c.next_action(1, FailureCategory::ProviderError),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_default_policy() {
        let c = RetryController::default();
        assert_eq!(c.max_attempts(), 3);
        assert_eq!(
            c.next_action(0, FailureCategory::Timeout),
            RetryDecision::Retry(Duration::from_secs(1))
        );
    }
}
