//! Error types for the streamfeed producer.
//!
//! Failures fall into two families that travel on different paths:
//!
//! - **Caller-side errors** ([`ProducerError`]) are returned synchronously
//!   from producer methods: validation failures, enqueue after shutdown,
//!   enqueue deadlines, invalid configuration.
//! - **Per-record outcomes** ([`FailureReason`], [`DeliveryError`]) are only
//!   ever delivered through a record's completion handle. A bad batch never
//!   surfaces as an error out of the background flush loop.
//!
//! ## Error Handling Strategy
//!
//! - **Validation**: `ValidationError`, surfaced at enqueue, never retried
//! - **Retryable**: `FailureReason::Retryable`, retried up to `max_retries`
//! - **Terminal**: `FailureReason::Terminal`, delivered immediately
//! - **Lifecycle**: `ProducerClosed`
//!
//! ## Examples
//!
//! ```ignore
//! use streamfeed_client::{DeliveryError, ProducerError, TerminalCause};
//!
//! match producer.enqueue(record).await {
//!     Ok(handle) => match handle.await {
//!         Ok(delivery) => println!("stored at {}", delivery.metadata.sequence_number),
//!         Err(DeliveryError::Terminal { cause: TerminalCause::RetriesExhausted { .. }, .. }) => {
//!             eprintln!("service kept throttling");
//!         }
//!         Err(e) => eprintln!("delivery failed: {}", e),
//!     },
//!     Err(ProducerError::Validation(e)) => eprintln!("bad record: {}", e),
//!     Err(e) => eprintln!("enqueue failed: {}", e),
//! }
//! ```

use crate::record::CorrelationId;
use std::time::Duration;
use thiserror::Error;

/// Convenience type alias for `Result<T, ProducerError>`.
pub type Result<T> = std::result::Result<T, ProducerError>;

/// A record that violates the service limits.
///
/// Returned synchronously from `enqueue`; the record never enters the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Partition key must not be empty")]
    EmptyPartitionKey,

    #[error("Partition key is {len} characters long (max: {max})")]
    PartitionKeyTooLong { len: usize, max: usize },

    #[error("Record is {size} bytes (max: {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("Explicit hash key '{0}' is not a 128-bit decimal integer")]
    InvalidExplicitHashKey(String),
}

/// Error type returned by producer operations.
///
/// None of these describe the fate of a record that was already accepted;
/// that is reported on its completion handle as a [`DeliveryError`].
#[derive(Debug, Error)]
pub enum ProducerError {
    /// Record rejected before it was queued.
    ///
    /// ## Resolution
    /// - Fix the record; resubmitting it unchanged will fail again
    #[error("Invalid record: {0}")]
    Validation(#[from] ValidationError),

    /// The producer is draining or closed.
    ///
    /// Returned to any enqueue attempted after shutdown began, including
    /// callers that were blocked waiting for queue capacity at that moment.
    #[error("Producer is closed")]
    ProducerClosed,

    /// No queue capacity freed up before the caller's deadline.
    ///
    /// The record was not enqueued. Batches already handed to the put
    /// client are unaffected.
    #[error("Enqueue timed out after {0:?}")]
    EnqueueTimeout(Duration),

    /// Invalid producer configuration.
    ///
    /// Configuration is validated once at construction; values are never
    /// clamped silently.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A completion handle was resolved twice.
    ///
    /// This is a programming error inside the producer. The first result
    /// stands; the second is rejected.
    #[error("Completion for record {0} was already resolved")]
    AlreadyCompleted(CorrelationId),

    /// Internal error that shouldn't normally occur.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a record was permanently rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminalCause {
    /// The record alone exceeds the batch byte budget; it can never be sent.
    #[error("record of {size} bytes exceeds the batch limit of {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    /// The record was retried `max_retries` times and still failed.
    #[error("gave up after {attempts} attempts: {last_cause}")]
    RetriesExhausted { attempts: u32, last_cause: String },

    /// The service reported a permanent rejection for this record.
    #[error("rejected by service ({code}): {message}")]
    Rejected { code: String, message: String },
}

/// Per-record failure tag reported by the put client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// May succeed on resubmission (throttling, transient service fault).
    #[error("retryable: {0}")]
    Retryable(String),

    /// Will never succeed on resubmission.
    #[error("terminal: {0}")]
    Terminal(TerminalCause),
}

impl FailureReason {
    /// Classify a per-record service error code.
    ///
    /// # Retryable Codes
    ///
    /// - `ProvisionedThroughputExceededException`: shard throughput exceeded
    /// - `InternalFailure`: transient service fault
    /// - `ServiceUnavailable`: service temporarily down
    /// - `ThrottlingException`: request rate exceeded
    ///
    /// Everything else is terminal.
    pub fn from_error_code(code: &str, message: &str) -> Self {
        match code {
            "ProvisionedThroughputExceededException"
            | "InternalFailure"
            | "ServiceUnavailable"
            | "ThrottlingException" => FailureReason::Retryable(format!("{}: {}", code, message)),
            _ => FailureReason::Terminal(TerminalCause::Rejected {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::Retryable(_))
    }
}

/// Final failure of a record, delivered on its completion handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("record {correlation_id} failed: {cause}")]
    Terminal {
        correlation_id: CorrelationId,
        cause: TerminalCause,
    },

    /// The producer shut down before the record reached a final outcome.
    #[error("record {correlation_id} was not delivered: producer closed")]
    ProducerClosed { correlation_id: CorrelationId },
}

impl DeliveryError {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            DeliveryError::Terminal { correlation_id, .. }
            | DeliveryError::ProducerClosed { correlation_id } => *correlation_id,
        }
    }

    /// The terminal cause, if the service (or the batcher) rejected the record.
    pub fn terminal_cause(&self) -> Option<&TerminalCause> {
        match self {
            DeliveryError::Terminal { cause, .. } => Some(cause),
            DeliveryError::ProducerClosed { .. } => None,
        }
    }
}

/// Wholesale failure of a `put_batch` call (connection reset, timeout, ...).
///
/// Every record of the batch is treated as `Retryable`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_throughput_exceeded_is_retryable() {
        let reason =
            FailureReason::from_error_code("ProvisionedThroughputExceededException", "slow down");
        assert!(reason.is_retryable());
    }

    #[test]
    fn test_classify_internal_failure_is_retryable() {
        assert!(FailureReason::from_error_code("InternalFailure", "oops").is_retryable());
    }

    #[test]
    fn test_classify_unknown_code_is_terminal() {
        let reason = FailureReason::from_error_code("KMSAccessDeniedException", "denied");
        assert_eq!(
            reason,
            FailureReason::Terminal(TerminalCause::Rejected {
                code: "KMSAccessDeniedException".to_string(),
                message: "denied".to_string(),
            })
        );
    }

    #[test]
    fn test_delivery_error_accessors() {
        let err = DeliveryError::Terminal {
            correlation_id: CorrelationId(3),
            cause: TerminalCause::RecordTooLarge { size: 10, max: 5 },
        };
        assert_eq!(err.correlation_id(), CorrelationId(3));
        assert!(matches!(
            err.terminal_cause(),
            Some(TerminalCause::RecordTooLarge { .. })
        ));

        let closed = DeliveryError::ProducerClosed {
            correlation_id: CorrelationId(4),
        };
        assert!(closed.terminal_cause().is_none());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(ProducerError::ProducerClosed.to_string(), "Producer is closed");
        assert_eq!(
            ProducerError::from(ValidationError::EmptyPartitionKey).to_string(),
            "Invalid record: Partition key must not be empty"
        );
    }
}
