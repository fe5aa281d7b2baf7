/// Throttling retries bounded by attempt count and cumulative wait
use super::{RetryAction, RetryDecision, RetryPolicyKind};
use crate::transport::{FailureKind, ServiceFailure};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ResourceThrottleRetryPolicy {
    max_attempts: u32,
    max_wait: Duration,
    default_retry_after: Duration,
    attempts: u32,
    cumulative_wait: Duration,
}

impl ResourceThrottleRetryPolicy {
    pub fn new(max_attempts: u32, max_wait: Duration, default_retry_after: Duration) -> Self {
        Self {
            max_attempts,
            max_wait,
            default_retry_after,
            attempts: 0,
            cumulative_wait: Duration::ZERO,
        }
    }

    pub fn should_retry(&mut self, failure: &ServiceFailure) -> Option<RetryDecision> {
        if failure.kind() != FailureKind::RequestRateTooLarge {
            return None;
        }

        if self.attempts >= self.max_attempts {
            return Some(RetryDecision::exhausted(RetryPolicyKind::ResourceThrottle));
        }

        let delay = match failure.retry_after {
            Some(delay) => Some(delay),
            None => self.default_retry_after.checked_mul(self.attempts + 1),
        };
        let total = delay.and_then(|delay| self.cumulative_wait.checked_add(delay));

        let (delay, total) = match (delay, total) {
            (Some(delay), Some(total)) if total <= self.max_wait => (delay, total),
            _ => {
                log::debug!(
                    "Throttle backoff {:?} would exceed wait budget {:?} (waited {:?})",
                    delay,
                    self.max_wait,
                    self.cumulative_wait
                );
                return Some(RetryDecision::exhausted(RetryPolicyKind::ResourceThrottle));
            }
        };

        self.attempts += 1;
        self.cumulative_wait = total;
        Some(RetryDecision::retry(delay, RetryAction::None))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn cumulative_wait(&self) -> Duration {
        self.cumulative_wait
    }
}
