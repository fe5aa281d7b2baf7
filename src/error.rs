/// Unified error handling for the routing layer
///
/// Errors fall into three groups: transient service failures (handled by the
/// retry chain and only surfaced once a policy gives up), structural failures
/// (a routing snapshot that cannot be trusted), and caller/configuration errors.
use crate::retry::RetryPolicyKind;
use crate::transport::ServiceFailure;
use std::fmt;
use std::io;

use thiserror::Error;

/// Main error type for routing operations
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Range construction violated `min <= max`
    #[error("Invalid range: {message}")]
    InvalidRange { message: String },

    /// Effective partition key outside the key space of the map
    #[error("Effective partition key {key:?} is outside the key space")]
    InvalidEffectivePartitionKey { key: String },

    /// Routing snapshot does not cover a key it should cover
    #[error("Routing map for collection {collection} is inconsistent: {message}")]
    InconsistentRoutingMap { collection: String, message: String },

    /// A proposed routing update would leave gaps or overlaps
    #[error("Non-contiguous partition key range update for collection {collection}: {message}")]
    NonContiguousUpdate { collection: String, message: String },

    /// A partition key range id that the current snapshot does not know
    #[error("Partition key range {id} not found in collection {collection}")]
    PartitionKeyRangeNotFound { collection: String, id: String },

    /// Metadata source has no partition layout for the collection
    #[error("Collection not found: {collection}")]
    CollectionNotFound { collection: String },

    /// Service failure no retry policy recognised, or a terminal decision
    #[error("Service error: {0}")]
    Service(ServiceFailure),

    /// A retry policy ran out of attempts or wait budget
    #[error("Retries exhausted by {policy} after {attempts} attempts: {last}")]
    RetriesExhausted {
        policy: RetryPolicyKind,
        attempts: u32,
        last: ServiceFailure,
    },

    /// The caller cancelled while the request was waiting
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// A collaborator (metadata, topology or budget source) failed
    #[error("Metadata source error: {message}")]
    Metadata { message: String },

    /// Local I/O errors (configuration files, CLI)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for routing operations
pub type RoutingResult<T> = Result<T, RoutingError>;

impl RoutingError {
    pub fn invalid_range<S: Into<String>>(message: S) -> Self {
        RoutingError::InvalidRange {
            message: message.into(),
        }
    }

    pub fn inconsistent<C: Into<String>, S: Into<String>>(collection: C, message: S) -> Self {
        RoutingError::InconsistentRoutingMap {
            collection: collection.into(),
            message: message.into(),
        }
    }

    pub fn non_contiguous<C: Into<String>, S: Into<String>>(collection: C, message: S) -> Self {
        RoutingError::NonContiguousUpdate {
            collection: collection.into(),
            message: message.into(),
        }
    }

    pub fn metadata<S: Into<String>>(message: S) -> Self {
        RoutingError::Metadata {
            message: message.into(),
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        RoutingError::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        RoutingError::Internal {
            message: message.into(),
        }
    }

    /// The service failure behind this error, whether it failed at once or after retries
    pub fn service_failure(&self) -> Option<&ServiceFailure> {
        match self {
            RoutingError::Service(failure) => Some(failure),
            RoutingError::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    /// Structural errors point at a cache or topology bug and must not be retried blindly
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            RoutingError::InconsistentRoutingMap { .. } | RoutingError::NonContiguousUpdate { .. }
        )
    }

    /// Check if this error is recoverable (caller may try again later)
    pub fn is_recoverable(&self) -> bool {
        match self {
            RoutingError::Io(_) => true,
            RoutingError::Metadata { .. } => true,
            RoutingError::RetriesExhausted { .. } => true,
            RoutingError::Service(failure) => failure.kind().is_transient(),
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RoutingError::Config(_) => ErrorSeverity::Critical,
            RoutingError::Internal { .. } => ErrorSeverity::Critical,
            RoutingError::InconsistentRoutingMap { .. } => ErrorSeverity::Critical,
            RoutingError::NonContiguousUpdate { .. } => ErrorSeverity::Error,
            RoutingError::RetriesExhausted { .. } => ErrorSeverity::Warning,
            RoutingError::Metadata { .. } => ErrorSeverity::Warning,
            RoutingError::Cancelled { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = RoutingError::inconsistent("coll1", "no range owns key 3F");
        assert!(matches!(error, RoutingError::InconsistentRoutingMap { .. }));
        assert_eq!(
            error.to_string(),
            "Routing map for collection coll1 is inconsistent: no range owns key 3F"
        );
    }

    #[test]
    fn test_error_severity() {
        let config_error = RoutingError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let cancelled = RoutingError::cancelled("admission");
        assert_eq!(cancelled.severity(), ErrorSeverity::Info);
        assert_eq!(ErrorSeverity::Warning.to_string(), "WARNING");
    }

    #[test]
    fn test_structural_errors() {
        assert!(RoutingError::non_contiguous("c", "gap at 40").is_structural());
        assert!(RoutingError::inconsistent("c", "missing").is_structural());
        assert!(!RoutingError::metadata("timeout").is_structural());
    }

    #[test]
    fn test_service_failure_is_retained() {
        let throttled = ServiceFailure::new(429, 0, "request rate too large");
        let exhausted = RoutingError::RetriesExhausted {
            policy: RetryPolicyKind::ResourceThrottle,
            attempts: 3,
            last: throttled.clone(),
        };
        assert_eq!(exhausted.service_failure().map(|f| f.status), Some(429));

        let immediate = RoutingError::Service(throttled);
        assert_eq!(immediate.service_failure().map(|f| f.status), Some(429));
        assert!(immediate.is_recoverable());

        let bad_request = RoutingError::Service(ServiceFailure::new(400, 0, "bad"));
        assert!(!bad_request.is_recoverable());
    }
}
