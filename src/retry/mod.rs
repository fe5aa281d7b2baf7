/// Retry policy chain
///
/// Every logical request gets its own [`RetryChain`]. On each failed attempt the
/// chain asks its policies in a fixed order; the first policy that recognises
/// the failure decides. Failures nobody recognises are terminal.
pub mod endpoint;
pub mod partition;
pub mod session;
pub mod throttle;

pub use endpoint::EndpointDiscoveryRetryPolicy;
pub use partition::PartitionKeyMismatchRetryPolicy;
pub use session::SessionReadRetryPolicy;
pub use throttle::ResourceThrottleRetryPolicy;

use crate::transport::ServiceFailure;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryPolicyKind {
    SessionRead,
    EndpointDiscovery,
    ResourceThrottle,
    PartitionKeyMismatch,
}

impl fmt::Display for RetryPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicyKind::SessionRead => write!(f, "session-read"),
            RetryPolicyKind::EndpointDiscovery => write!(f, "endpoint-discovery"),
            RetryPolicyKind::ResourceThrottle => write!(f, "resource-throttle"),
            RetryPolicyKind::PartitionKeyMismatch => write!(f, "partition-key-mismatch"),
        }
    }
}

/// Side effect the router performs before the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    None,
    /// Send the next attempt to the n-th available regional endpoint
    RouteToLocation(usize),
    /// Mark the failed endpoint unavailable and re-read the region topology
    RefreshTopology,
    /// Refresh the collection's routing map and resolve the target again
    RefreshRoutingMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration, action: RetryAction },
    /// `exhausted` names the policy whose budget ran out, if any
    NoRetry { exhausted: Option<RetryPolicyKind> },
}

impl RetryDecision {
    pub fn retry(after: Duration, action: RetryAction) -> Self {
        RetryDecision::Retry { after, action }
    }

    pub fn terminal() -> Self {
        RetryDecision::NoRetry { exhausted: None }
    }

    pub fn exhausted(policy: RetryPolicyKind) -> Self {
        RetryDecision::NoRetry {
            exhausted: Some(policy),
        }
    }

    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// Retry budgets shared by every chain a router creates
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    pub max_throttle_retry_attempts: u32,
    pub max_throttle_wait: Duration,
    /// Multiplied by the attempt number when the server sends no retry-after
    pub default_throttle_retry_after: Duration,
    pub max_session_read_retry_attempts: u32,
    pub session_read_initial_backoff: Duration,
    pub session_read_max_backoff: Duration,
    pub max_endpoint_failover_retries: u32,
    pub endpoint_retry_interval: Duration,
    pub max_partition_key_mismatch_retries: u32,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_throttle_retry_attempts: 9,
            max_throttle_wait: Duration::from_secs(30),
            default_throttle_retry_after: Duration::from_millis(5),
            max_session_read_retry_attempts: 4,
            session_read_initial_backoff: Duration::from_millis(5),
            session_read_max_backoff: Duration::from_millis(500),
            max_endpoint_failover_retries: 1,
            endpoint_retry_interval: Duration::from_secs(1),
            max_partition_key_mismatch_retries: 1,
        }
    }
}

/// A single retry policy; the set of variants is closed
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    EndpointDiscovery(EndpointDiscoveryRetryPolicy),
    SessionRead(SessionReadRetryPolicy),
    ResourceThrottle(ResourceThrottleRetryPolicy),
    PartitionKeyMismatch(PartitionKeyMismatchRetryPolicy),
}

impl RetryPolicy {
    pub fn kind(&self) -> RetryPolicyKind {
        match self {
            RetryPolicy::EndpointDiscovery(_) => RetryPolicyKind::EndpointDiscovery,
            RetryPolicy::SessionRead(_) => RetryPolicyKind::SessionRead,
            RetryPolicy::ResourceThrottle(_) => RetryPolicyKind::ResourceThrottle,
            RetryPolicy::PartitionKeyMismatch(_) => RetryPolicyKind::PartitionKeyMismatch,
        }
    }

    /// `None` when the failure is not this policy's to decide
    pub fn should_retry(&mut self, failure: &ServiceFailure) -> Option<RetryDecision> {
        match self {
            RetryPolicy::EndpointDiscovery(policy) => policy.should_retry(failure),
            RetryPolicy::SessionRead(policy) => policy.should_retry(failure),
            RetryPolicy::ResourceThrottle(policy) => policy.should_retry(failure),
            RetryPolicy::PartitionKeyMismatch(policy) => policy.should_retry(failure),
        }
    }
}

/// Request-scoped composition of all retry policies
#[derive(Debug, Clone)]
pub struct RetryChain {
    policies: Vec<RetryPolicy>,
    attempts: u32,
}

impl RetryChain {
    pub fn new(options: &RetryOptions, endpoint_discovery_enabled: bool) -> Self {
        Self::from_policies(vec![
            RetryPolicy::EndpointDiscovery(EndpointDiscoveryRetryPolicy::new(
                endpoint_discovery_enabled,
                options.max_endpoint_failover_retries,
                options.endpoint_retry_interval,
            )),
            RetryPolicy::SessionRead(SessionReadRetryPolicy::new(
                options.max_session_read_retry_attempts,
                options.session_read_initial_backoff,
                options.session_read_max_backoff,
            )),
            RetryPolicy::ResourceThrottle(ResourceThrottleRetryPolicy::new(
                options.max_throttle_retry_attempts,
                options.max_throttle_wait,
                options.default_throttle_retry_after,
            )),
            RetryPolicy::PartitionKeyMismatch(PartitionKeyMismatchRetryPolicy::new(
                options.max_partition_key_mismatch_retries,
            )),
        ])
    }

    pub fn from_policies(policies: Vec<RetryPolicy>) -> Self {
        Self {
            policies,
            attempts: 0,
        }
    }

    /// Decide what to do about `failure`
    pub fn should_retry(&mut self, failure: &ServiceFailure) -> RetryDecision {
        for policy in self.policies.iter_mut() {
            let Some(decision) = policy.should_retry(failure) else {
                continue;
            };

            match decision {
                RetryDecision::Retry { after, action } => {
                    self.attempts += 1;
                    log::debug!(
                        "{} policy retries after {:?} ({:?}), retry #{}: {}",
                        policy.kind(),
                        after,
                        action,
                        self.attempts,
                        failure
                    );
                }
                RetryDecision::NoRetry { exhausted: Some(kind) } => {
                    log::warn!(
                        "{} retry budget exhausted after {} retries: {}",
                        kind,
                        self.attempts,
                        failure
                    );
                }
                RetryDecision::NoRetry { exhausted: None } => {
                    log::debug!("{} policy declined to retry: {}", policy.kind(), failure);
                }
            }
            return decision;
        }

        log::debug!("No retry policy recognises {} ({})", failure, failure.kind());
        RetryDecision::terminal()
    }

    /// Total retries granted so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policies(&self) -> &[RetryPolicy] {
        &self.policies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> RetryChain {
        RetryChain::new(&RetryOptions::default(), true)
    }

    #[test]
    fn test_chain_order_is_fixed() {
        let kinds: Vec<_> = chain().policies().iter().map(RetryPolicy::kind).collect();
        assert_eq!(
            kinds,
            vec![
                RetryPolicyKind::EndpointDiscovery,
                RetryPolicyKind::SessionRead,
                RetryPolicyKind::ResourceThrottle,
                RetryPolicyKind::PartitionKeyMismatch,
            ]
        );
    }

    #[test]
    fn test_each_failure_reaches_its_policy() {
        let mut chain = chain();

        let throttle = chain.should_retry(&ServiceFailure::throttled(Some(Duration::from_millis(40))));
        assert_eq!(throttle, RetryDecision::retry(Duration::from_millis(40), RetryAction::None));

        let session = chain.should_retry(&ServiceFailure::read_session_not_available());
        assert_eq!(
            session,
            RetryDecision::retry(Duration::from_millis(5), RetryAction::RouteToLocation(1))
        );

        let gone = chain.should_retry(&ServiceFailure::partition_key_range_gone());
        assert_eq!(gone, RetryDecision::retry(Duration::ZERO, RetryAction::RefreshRoutingMap));

        let unreachable = chain.should_retry(&ServiceFailure::service_unavailable());
        assert_eq!(
            unreachable,
            RetryDecision::retry(Duration::ZERO, RetryAction::RefreshTopology)
        );

        assert_eq!(chain.attempts(), 4);
    }

    #[test]
    fn test_unrecognised_failure_is_terminal() {
        let mut chain = chain();
        let decision = chain.should_retry(&ServiceFailure::new(409, 0, "conflict"));
        assert_eq!(decision, RetryDecision::terminal());
        assert!(!decision.should_retry());
        assert_eq!(chain.attempts(), 0);
    }

    #[test]
    fn test_budgets_are_independent() {
        let mut chain = chain();
        assert!(chain.should_retry(&ServiceFailure::partition_key_range_gone()).should_retry());
        assert_eq!(
            chain.should_retry(&ServiceFailure::partition_key_range_gone()),
            RetryDecision::exhausted(RetryPolicyKind::PartitionKeyMismatch)
        );

        // Throttle budget is untouched by the mismatch retries
        assert!(chain.should_retry(&ServiceFailure::throttled(None)).should_retry());
    }

    #[test]
    fn test_chains_do_not_share_state() {
        let options = RetryOptions::default();
        let mut first = RetryChain::new(&options, true);
        let mut second = RetryChain::new(&options, true);

        assert!(first.should_retry(&ServiceFailure::partition_key_range_gone()).should_retry());
        assert!(second.should_retry(&ServiceFailure::partition_key_range_gone()).should_retry());
    }

    #[test]
    fn test_policy_kind_display() {
        assert_eq!(RetryPolicyKind::ResourceThrottle.to_string(), "resource-throttle");
        assert_eq!(RetryPolicyKind::PartitionKeyMismatch.to_string(), "partition-key-mismatch");
    }
}
