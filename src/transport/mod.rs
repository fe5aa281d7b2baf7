/// Transport seam: logical requests, per-attempt routed requests and service outcomes
///
/// The routing layer never performs I/O itself. A [`Transport`] implementation
/// receives one fully routed attempt at a time and reports either a response
/// or a structured [`ServiceFailure`].
use crate::core::{PartitionKey, Range, ServerIdentity};
use crate::endpoint::RegionalEndpoint;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod status {
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const GONE: u16 = 410;
    pub const TOO_MANY_REQUESTS: u16 = 429;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

pub mod sub_status {
    pub const WRITE_FORBIDDEN: u32 = 3;
    pub const PARTITION_KEY_MISMATCH: u32 = 1001;
    /// On 404: the replica has not caught up with the session token
    pub const READ_SESSION_NOT_AVAILABLE: u32 = 1002;
    /// On 410: the partition key range was split or merged away
    pub const PARTITION_KEY_RANGE_GONE: u32 = 1002;
    pub const COMPLETING_SPLIT: u32 = 1007;
    pub const DATABASE_ACCOUNT_NOT_FOUND: u32 = 1008;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Read,
    Write,
    Query,
}

impl OperationType {
    pub fn is_read_only(&self) -> bool {
        matches!(self, OperationType::Read | OperationType::Query)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Read => write!(f, "read"),
            OperationType::Write => write!(f, "write"),
            OperationType::Query => write!(f, "query"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    Strong,
    BoundedStaleness,
    #[default]
    Session,
    ConsistentPrefix,
    Eventual,
}

/// Which partition(s) a request addresses
#[derive(Debug, Clone, PartialEq)]
pub enum RequestTarget {
    PartitionKey(PartitionKey),
    EffectivePartitionKey(String),
    PartitionKeyRangeId(String),
    /// Cross-partition: every range overlapping this effective key range
    Range(Range<String>),
}

/// A logical request as issued by the caller
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub activity_id: String,
    pub collection: String,
    pub operation: OperationType,
    pub target: RequestTarget,
    pub payload: Bytes,
    pub throughput_group: Option<String>,
    pub consistency: ConsistencyLevel,
}

impl OperationRequest {
    pub fn new<S: Into<String>>(collection: S, operation: OperationType, target: RequestTarget) -> Self {
        Self {
            activity_id: crate::utils::generate_activity_id(),
            collection: collection.into(),
            operation,
            target,
            payload: Bytes::new(),
            throughput_group: None,
            consistency: ConsistencyLevel::default(),
        }
    }

    pub fn read<S: Into<String>>(collection: S, key: PartitionKey) -> Self {
        Self::new(collection, OperationType::Read, RequestTarget::PartitionKey(key))
    }

    pub fn write<S: Into<String>>(collection: S, key: PartitionKey, payload: Bytes) -> Self {
        Self::new(collection, OperationType::Write, RequestTarget::PartitionKey(key)).with_payload(payload)
    }

    pub fn query<S: Into<String>>(collection: S, range: Range<String>, payload: Bytes) -> Self {
        Self::new(collection, OperationType::Query, RequestTarget::Range(range)).with_payload(payload)
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_throughput_group<S: Into<String>>(mut self, group: S) -> Self {
        self.throughput_group = Some(group.into());
        self
    }

    pub fn with_consistency(mut self, consistency: ConsistencyLevel) -> Self {
        self.consistency = consistency;
        self
    }

    /// Session tokens are only attached to reads under session consistency
    pub fn needs_session_token(&self) -> bool {
        self.operation.is_read_only() && self.consistency == ConsistencyLevel::Session
    }
}

/// One attempt of a request, bound to a partition, its owner and a regional endpoint
#[derive(Debug, Clone)]
pub struct RoutedRequest {
    pub activity_id: String,
    pub collection: String,
    pub operation: OperationType,
    pub partition_key_range_id: String,
    pub owner: ServerIdentity,
    pub endpoint: RegionalEndpoint,
    pub session_token: Option<String>,
    pub payload: Bytes,
    /// Zero for the first attempt
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    pub status: u16,
    pub payload: Bytes,
    /// Request units actually consumed
    pub request_charge: f64,
    /// Compound session token (`"<rangeId>:<version>#<lsn>"`)
    pub session_token: Option<String>,
}

impl ServiceResponse {
    pub fn ok(payload: Bytes, request_charge: f64) -> Self {
        Self {
            status: 200,
            payload,
            request_charge,
            session_token: None,
        }
    }

    pub fn with_session_token<S: Into<String>>(mut self, token: S) -> Self {
        self.session_token = Some(token.into());
        self
    }
}

/// Failure signatures the retry chain distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RequestRateTooLarge,
    ReadSessionNotAvailable,
    PartitionKeyRangeGone,
    CompletingSplit,
    PartitionKeyMismatch,
    EndpointUnreachable,
    Other,
}

impl FailureKind {
    pub fn is_transient(&self) -> bool {
        !matches!(self, FailureKind::Other)
    }

    /// Failures caused by a stale routing map
    pub fn is_stale_routing(&self) -> bool {
        matches!(
            self,
            FailureKind::PartitionKeyRangeGone
                | FailureKind::CompletingSplit
                | FailureKind::PartitionKeyMismatch
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::RequestRateTooLarge => "request rate too large",
            FailureKind::ReadSessionNotAvailable => "read session not available",
            FailureKind::PartitionKeyRangeGone => "partition key range gone",
            FailureKind::CompletingSplit => "completing split",
            FailureKind::PartitionKeyMismatch => "partition key mismatch",
            FailureKind::EndpointUnreachable => "endpoint unreachable",
            FailureKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Structured failure reported by the transport
#[derive(Debug, Clone, PartialEq, Error)]
#[error("status {status}.{sub_status}: {message}")]
pub struct ServiceFailure {
    pub status: u16,
    pub sub_status: u32,
    pub message: String,
    /// Server-suggested backoff, usually present on throttling
    pub retry_after: Option<Duration>,
    pub request_charge: f64,
}

impl ServiceFailure {
    pub fn new<S: Into<String>>(status: u16, sub_status: u32, message: S) -> Self {
        Self {
            status,
            sub_status,
            message: message.into(),
            retry_after: None,
            request_charge: 0.0,
        }
    }

    pub fn throttled(retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(status::TOO_MANY_REQUESTS, 0, "request rate is large")
        }
    }

    pub fn read_session_not_available() -> Self {
        Self::new(
            status::NOT_FOUND,
            sub_status::READ_SESSION_NOT_AVAILABLE,
            "read session not available",
        )
    }

    pub fn partition_key_range_gone() -> Self {
        Self::new(
            status::GONE,
            sub_status::PARTITION_KEY_RANGE_GONE,
            "partition key range is gone",
        )
    }

    pub fn service_unavailable() -> Self {
        Self::new(status::SERVICE_UNAVAILABLE, 0, "service unavailable")
    }

    pub fn with_request_charge(mut self, request_charge: f64) -> Self {
        self.request_charge = request_charge;
        self
    }

    pub fn kind(&self) -> FailureKind {
        match (self.status, self.sub_status) {
            (status::TOO_MANY_REQUESTS, _) => FailureKind::RequestRateTooLarge,
            (status::NOT_FOUND, sub_status::READ_SESSION_NOT_AVAILABLE) => {
                FailureKind::ReadSessionNotAvailable
            }
            (status::GONE, sub_status::PARTITION_KEY_RANGE_GONE) => {
                FailureKind::PartitionKeyRangeGone
            }
            (status::GONE, sub_status::COMPLETING_SPLIT) => FailureKind::CompletingSplit,
            (status::BAD_REQUEST, sub_status::PARTITION_KEY_MISMATCH) => {
                FailureKind::PartitionKeyMismatch
            }
            (status::SERVICE_UNAVAILABLE, _) => FailureKind::EndpointUnreachable,
            (status::FORBIDDEN, sub_status::WRITE_FORBIDDEN)
            | (status::FORBIDDEN, sub_status::DATABASE_ACCOUNT_NOT_FOUND) => {
                FailureKind::EndpointUnreachable
            }
            _ => FailureKind::Other,
        }
    }
}

/// I/O collaborator that performs one routed attempt
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: RoutedRequest) -> Result<ServiceResponse, ServiceFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert_eq!(ServiceFailure::throttled(None).kind(), FailureKind::RequestRateTooLarge);
        assert_eq!(
            ServiceFailure::read_session_not_available().kind(),
            FailureKind::ReadSessionNotAvailable
        );
        assert_eq!(
            ServiceFailure::partition_key_range_gone().kind(),
            FailureKind::PartitionKeyRangeGone
        );
        assert_eq!(ServiceFailure::new(410, 1007, "split").kind(), FailureKind::CompletingSplit);
        assert_eq!(
            ServiceFailure::new(400, 1001, "mismatch").kind(),
            FailureKind::PartitionKeyMismatch
        );
        assert_eq!(ServiceFailure::service_unavailable().kind(), FailureKind::EndpointUnreachable);
        assert_eq!(ServiceFailure::new(403, 3, "write forbidden").kind(), FailureKind::EndpointUnreachable);
        assert_eq!(ServiceFailure::new(403, 1008, "account").kind(), FailureKind::EndpointUnreachable);

        // Same sub-status means different things under different status codes
        assert_eq!(ServiceFailure::new(404, 0, "not found").kind(), FailureKind::Other);
        assert_eq!(ServiceFailure::new(410, 0, "gone").kind(), FailureKind::Other);
        assert_eq!(ServiceFailure::new(403, 0, "auth").kind(), FailureKind::Other);
    }

    #[test]
    fn test_failure_kind_predicates() {
        assert!(FailureKind::RequestRateTooLarge.is_transient());
        assert!(!FailureKind::Other.is_transient());
        assert!(FailureKind::CompletingSplit.is_stale_routing());
        assert!(!FailureKind::EndpointUnreachable.is_stale_routing());
    }

    #[test]
    fn test_failure_display() {
        let failure = ServiceFailure::throttled(Some(Duration::from_millis(20))).with_request_charge(1.5);
        assert_eq!(failure.to_string(), "status 429.0: request rate is large");
        assert_eq!(failure.retry_after, Some(Duration::from_millis(20)));
        assert_eq!(failure.request_charge, 1.5);
    }

    #[test]
    fn test_session_token_needed_only_for_session_reads() {
        let read = OperationRequest::read("orders", PartitionKey::new("a"));
        assert!(read.needs_session_token());
        assert!(!read.clone().with_consistency(ConsistencyLevel::Eventual).needs_session_token());

        let write = OperationRequest::write("orders", PartitionKey::new("a"), Bytes::from_static(b"{}"));
        assert!(!write.needs_session_token());
        assert_eq!(write.payload, Bytes::from_static(b"{}"));
    }
}
