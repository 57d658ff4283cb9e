//! Error types shared across the service boundaries.
//!
//! Every boundary (cache, column store, delivery) has its own error enum so
//! callers can tell an unreachable collaborator from a validation problem.
//! None of these are fatal to the process.

use std::time::Duration;

/// Errors raised by the distributed cache boundary
#[derive(Debug, Clone)]
pub enum CacheError {
    /// Cache shard or remote node could not be reached
    Unavailable(String),
    /// Cached bytes could not be encoded or decoded
    Codec(String),
    /// Per-key execution did not finish within the cache timeout
    Timeout,
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Unavailable(msg) => write!(f, "cache unavailable: {}", msg),
            CacheError::Codec(msg) => write!(f, "cache codec error: {}", msg),
            CacheError::Timeout => write!(f, "cache execution timed out"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Errors raised by the wide-column storage boundary
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Store could not be reached
    Unavailable(String),
    /// Store refused the batch
    Rejected(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
            StoreError::Rejected(msg) => write!(f, "store rejected batch: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors surfaced to the submitter of an update
#[derive(Debug, Clone)]
pub enum DeliveryError {
    /// Transport refused or dropped the message
    SendFailed(String),
    /// No delivery confirmation arrived within the ack timeout
    AckTimeout,
    /// Retry budget exhausted without a successful attempt
    RetriesExhausted { attempts: u32, elapsed: Duration },
    /// Update was rejected before sending (e.g. coordinator closed)
    Rejected(String),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::SendFailed(msg) => write!(f, "send failed: {}", msg),
            DeliveryError::AckTimeout => write!(f, "timed out waiting for delivery confirmation"),
            DeliveryError::RetriesExhausted { attempts, elapsed } => write!(
                f,
                "update not delivered after {} attempts in {}ms",
                attempts,
                elapsed.as_millis()
            ),
            DeliveryError::Rejected(msg) => write!(f, "update rejected: {}", msg),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Top-level error for service operations
#[derive(Debug, Clone)]
pub enum MetricError {
    /// Malformed input (date range, payload); never retried
    Validation(String),
    /// Delivery protocol failure
    Delivery(DeliveryError),
    /// Cache failure during a per-key apply
    Cache(CacheError),
    /// Storage failure during a per-key apply
    Store(StoreError),
    /// Shutdown gate is closed or closing
    ShuttingDown,
    /// Invalid configuration
    Config(String),
}

impl MetricError {
    /// Whether the caller may reasonably retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetricError::Delivery(_) | MetricError::Cache(_) | MetricError::Store(_)
        )
    }
}

impl std::fmt::Display for MetricError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricError::Validation(msg) => write!(f, "validation error: {}", msg),
            MetricError::Delivery(e) => write!(f, "delivery failure: {}", e),
            MetricError::Cache(e) => write!(f, "merge failure: {}", e),
            MetricError::Store(e) => write!(f, "merge failure: {}", e),
            MetricError::ShuttingDown => write!(f, "service is shutting down"),
            MetricError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for MetricError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MetricError::Delivery(e) => Some(e),
            MetricError::Cache(e) => Some(e),
            MetricError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CacheError> for MetricError {
    fn from(e: CacheError) -> Self {
        MetricError::Cache(e)
    }
}

impl From<StoreError> for MetricError {
    fn from(e: StoreError) -> Self {
        MetricError::Store(e)
    }
}

impl From<DeliveryError> for MetricError {
    fn from(e: DeliveryError) -> Self {
        MetricError::Delivery(e)
    }
}

impl From<serde_json::Error> for MetricError {
    fn from(e: serde_json::Error) -> Self {
        MetricError::Validation(format!("malformed update payload: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = MetricError::Validation("begin date can not be after end date".to_string());
        assert_eq!(
            err.to_string(),
            "validation error: begin date can not be after end date"
        );

        let err: MetricError = DeliveryError::RetriesExhausted {
            attempts: 3,
            elapsed: Duration::from_millis(1500),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "delivery failure: update not delivered after 3 attempts in 1500ms"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(MetricError::Store(StoreError::Unavailable("down".into())).is_retryable());
        assert!(MetricError::Cache(CacheError::Timeout).is_retryable());
        assert!(!MetricError::Validation("bad".into()).is_retryable());
        assert!(!MetricError::ShuttingDown.is_retryable());
    }

    #[test]
    fn test_json_error_maps_to_validation() {
        let parse: Result<u32, _> = serde_json::from_str("not json");
        let err: MetricError = parse.unwrap_err().into();
        assert!(matches!(err, MetricError::Validation(_)));
    }
}
