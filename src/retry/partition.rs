/// Stale routing retries: refresh the routing map, then try once more
use super::{RetryAction, RetryDecision, RetryPolicyKind};
use crate::transport::ServiceFailure;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PartitionKeyMismatchRetryPolicy {
    max_attempts: u32,
    attempts: u32,
}

impl PartitionKeyMismatchRetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
        }
    }

    /// Handles gone ranges, splits in progress and key/range mismatches.
    /// A repeat after the refresh means the metadata itself is wrong.
    pub fn should_retry(&mut self, failure: &ServiceFailure) -> Option<RetryDecision> {
        if !failure.kind().is_stale_routing() {
            return None;
        }

        if self.attempts >= self.max_attempts {
            return Some(RetryDecision::exhausted(RetryPolicyKind::PartitionKeyMismatch));
        }

        self.attempts += 1;
        Some(RetryDecision::retry(
            Duration::ZERO,
            RetryAction::RefreshRoutingMap,
        ))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_refresh_then_terminal() {
        let mut policy = PartitionKeyMismatchRetryPolicy::new(1);
        let gone = ServiceFailure::partition_key_range_gone();

        assert_eq!(
            policy.should_retry(&gone),
            Some(RetryDecision::retry(Duration::ZERO, RetryAction::RefreshRoutingMap))
        );
        assert_eq!(
            policy.should_retry(&gone),
            Some(RetryDecision::exhausted(RetryPolicyKind::PartitionKeyMismatch))
        );
    }

    #[test]
    fn test_split_and_mismatch_share_the_budget() {
        let mut policy = PartitionKeyMismatchRetryPolicy::new(2);
        assert!(policy
            .should_retry(&ServiceFailure::new(410, 1007, "completing split"))
            .unwrap()
            .should_retry());
        assert!(policy
            .should_retry(&ServiceFailure::new(400, 1001, "mismatch"))
            .unwrap()
            .should_retry());
        assert!(!policy
            .should_retry(&ServiceFailure::partition_key_range_gone())
            .unwrap()
            .should_retry());
        assert_eq!(policy.attempts(), 2);
    }

    #[test]
    fn test_ignores_other_failures() {
        let mut policy = PartitionKeyMismatchRetryPolicy::new(1);
        assert!(policy.should_retry(&ServiceFailure::new(410, 0, "gone")).is_none());
        assert!(policy.should_retry(&ServiceFailure::throttled(None)).is_none());
    }
}
