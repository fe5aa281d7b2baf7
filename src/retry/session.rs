/// Session read retries: move to the next region when the replica lacks our session
use super::{RetryAction, RetryDecision, RetryPolicyKind};
use crate::transport::{FailureKind, ServiceFailure};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionReadRetryPolicy {
    max_attempts: u32,
    attempts: u32,
    next_backoff: Duration,
    max_backoff: Duration,
    location_index: usize,
}

impl SessionReadRetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            attempts: 0,
            next_backoff: initial_backoff,
            max_backoff,
            location_index: 0,
        }
    }

    pub fn should_retry(&mut self, failure: &ServiceFailure) -> Option<RetryDecision> {
        if failure.kind() != FailureKind::ReadSessionNotAvailable {
            return None;
        }

        if self.attempts >= self.max_attempts {
            return Some(RetryDecision::exhausted(RetryPolicyKind::SessionRead));
        }

        self.attempts += 1;
        self.location_index += 1;

        let after = self.next_backoff.min(self.max_backoff);
        self.next_backoff = (self.next_backoff * 2).min(self.max_backoff);

        Some(RetryDecision::retry(
            after,
            RetryAction::RouteToLocation(self.location_index),
        ))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
