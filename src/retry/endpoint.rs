/// Endpoint discovery retries: fail over after refreshing the region topology
use super::{RetryAction, RetryDecision, RetryPolicyKind};
use crate::transport::{FailureKind, ServiceFailure};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EndpointDiscoveryRetryPolicy {
    enabled: bool,
    max_failovers: u32,
    retry_interval: Duration,
    failovers: u32,
}

impl EndpointDiscoveryRetryPolicy {
    pub fn new(enabled: bool, max_failovers: u32, retry_interval: Duration) -> Self {
        Self {
            enabled,
            max_failovers,
            retry_interval,
            failovers: 0,
        }
    }

    /// The first failover is immediate; later ones wait `retry_interval`.
    /// With discovery disabled unreachable endpoints are terminal.
    pub fn should_retry(&mut self, failure: &ServiceFailure) -> Option<RetryDecision> {
        if failure.kind() != FailureKind::EndpointUnreachable {
            return None;
        }

        if !self.enabled {
            return Some(RetryDecision::terminal());
        }

        if self.failovers >= self.max_failovers {
            return Some(RetryDecision::exhausted(RetryPolicyKind::EndpointDiscovery));
        }

        let after = if self.failovers == 0 {
            Duration::ZERO
        } else {
            self.retry_interval
        };
        self.failovers += 1;

        Some(RetryDecision::retry(after, RetryAction::RefreshTopology))
    }

    pub fn failovers(&self) -> u32 {
        self.failovers
    }
}
