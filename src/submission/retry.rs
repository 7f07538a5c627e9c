// Retry budget and fixed backoff ladder for portal submissions.
// The orchestrator never sleeps; it only computes when the next try is due.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::SubmissionConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SubmissionConfig::default())
    }
}

impl From<&SubmissionConfig> for RetryPolicy {
    fn from(config: &SubmissionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config
                .backoff_seconds
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_seconds),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt_number`-th try (1-based) of a cycle fails.
    /// Tries past the end of the ladder reuse the last rung.
    pub fn delay_after(&self, attempt_number: u32) -> Duration {
        let index = attempt_number.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }

    pub fn has_attempts_remaining(&self, attempt_number: u32) -> bool {
        attempt_number < self.max_attempts
    }

    /// When the next try is due, or `None` once the budget is spent.
    pub fn next_retry_at(&self, attempt_number: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.has_attempts_remaining(attempt_number) {
            return None;
        }
        let delay = chrono::Duration::from_std(self.delay_after(attempt_number)).ok()?;
        now.checked_add_signed(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_default_ladder() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.attempt_timeout, Duration::from_secs(120));
        assert_eq!(policy.delay_after(1), Duration::from_secs(60));
        assert_eq!(policy.delay_after(2), Duration::from_secs(300));
        assert_eq!(policy.delay_after(3), Duration::from_secs(900));
        assert_eq!(policy.delay_after(9), Duration::from_secs(900));
    }

    #[test]
    fn test_next_retry_at_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.next_retry_at(1, now()),
            Some(now() + chrono::Duration::seconds(60))
        );
        assert_eq!(
            policy.next_retry_at(2, now()),
            Some(now() + chrono::Duration::seconds(300))
        );
        assert_eq!(policy.next_retry_at(3, now()), None);
    }

    #[test]
    fn test_empty_ladder_retries_immediately() {
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: Vec::new(),
            attempt_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.next_retry_at(1, now()), Some(now()));
    }

    proptest! {
        #[test]
        fn prop_retry_never_scheduled_past_budget(max in 1u32..10, attempt in 1u32..20) {
            let policy = RetryPolicy { max_attempts: max, ..RetryPolicy::default() };
            let scheduled = policy.next_retry_at(attempt, now());
            prop_assert_eq!(scheduled.is_some(), attempt < max);
            if let Some(at) = scheduled {
                prop_assert!(at >= now() + chrono::Duration::seconds(60));
            }
        }
    }
}
