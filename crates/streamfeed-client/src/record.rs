//! Records accepted by the producer.
//!
//! A [`Record`] is the unit callers hand to [`Producer::enqueue`]. It is
//! immutable once built: the producer only ever reads it, batches it, and
//! hands it (by reference) to the underlying [`PutClient`].
//!
//! ## Size Accounting
//!
//! The streaming service bills the partition key against its per-record and
//! per-request limits, so [`Record::size_bytes`] is
//! `payload.len() + partition_key.len()`. Batch byte budgets use this value.
//!
//! ## Validation
//!
//! Records are validated against [`RecordLimits`] at enqueue time, never at
//! flush time:
//!
//! - partition key must be non-empty and at most 256 characters
//! - `size_bytes()` must not exceed `max_record_bytes` (1 MiB)
//! - an explicit hash key must be a decimal integer in `[0, 2^128 - 1]`
//!
//! [`Producer::enqueue`]: crate::Producer::enqueue
//! [`PutClient`]: crate::PutClient

use crate::error::ValidationError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of producer-assigned correlation ids.
static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque token identifying a record across batches and retries.
///
/// Callers may assign their own with [`Record::with_correlation_id`];
/// otherwise [`Record::new`] draws a process-unique one. The producer never
/// looks records up by this id, so client-assigned duplicates are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    /// Draw a fresh, process-unique id.
    pub fn next() -> Self {
        CorrelationId(NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Limits imposed by the streaming service on individual records and on a
/// single put request.
///
/// Defaults are the PutRecords limits of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLimits {
    /// Maximum size of one record (payload + partition key).
    pub max_record_bytes: usize,
    /// Maximum partition key length, in characters.
    pub max_partition_key_chars: usize,
    /// Maximum number of records in one put request.
    pub max_records_per_request: usize,
    /// Maximum total size of one put request.
    pub max_request_bytes: usize,
}

impl Default for RecordLimits {
    fn default() -> Self {
        Self {
            max_record_bytes: 1024 * 1024,
            max_partition_key_chars: 256,
            max_records_per_request: 500,
            max_request_bytes: 5 * 1024 * 1024,
        }
    }
}

/// An immutable record to be produced.
///
/// # Examples
///
/// ```ignore
/// use streamfeed_client::Record;
///
/// let record = Record::new("user-42", "order created")
///     .with_explicit_hash_key("170141183460469231731687303715884105728");
/// assert_eq!(record.size_bytes(), 7 + 13);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    payload: Bytes,
    partition_key: String,
    explicit_hash_key: Option<String>,
    correlation_id: CorrelationId,
}

impl Record {
    /// Create a record with a fresh producer-assigned correlation id.
    pub fn new(partition_key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            partition_key: partition_key.into(),
            explicit_hash_key: None,
            correlation_id: CorrelationId::next(),
        }
    }

    /// Override shard routing with an explicit 128-bit hash key.
    pub fn with_explicit_hash_key(mut self, hash_key: impl Into<String>) -> Self {
        self.explicit_hash_key = Some(hash_key.into());
        self
    }

    /// Replace the correlation id with a client-assigned one.
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn explicit_hash_key(&self) -> Option<&str> {
        self.explicit_hash_key.as_deref()
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Size billed by the service: payload plus partition key bytes.
    pub fn size_bytes(&self) -> usize {
        self.payload.len() + self.partition_key.len()
    }

    /// Check the record against the service limits.
    ///
    /// # Errors
    ///
    /// The first violated limit, as a [`ValidationError`].
    pub fn validate(&self, limits: &RecordLimits) -> Result<(), ValidationError> {
        if self.partition_key.is_empty() {
            return Err(ValidationError::EmptyPartitionKey);
        }

        let key_chars = self.partition_key.chars().count();
        if key_chars > limits.max_partition_key_chars {
            return Err(ValidationError::PartitionKeyTooLong {
                len: key_chars,
                max: limits.max_partition_key_chars,
            });
        }

        let size = self.size_bytes();
        if size > limits.max_record_bytes {
            return Err(ValidationError::RecordTooLarge {
                size,
                max: limits.max_record_bytes,
            });
        }

        if let Some(hash_key) = &self.explicit_hash_key {
            validate_hash_key(hash_key)?;
        }

        Ok(())
    }
}

/// An explicit hash key is a decimal integer that fits in 128 bits.
fn validate_hash_key(hash_key: &str) -> Result<(), ValidationError> {
    let well_formed = !hash_key.is_empty()
        && hash_key.bytes().all(|b| b.is_ascii_digit())
        && hash_key.parse::<u128>().is_ok();

    if well_formed {
        Ok(())
    } else {
        Err(ValidationError::InvalidExplicitHashKey(hash_key.to_string()))
    }
}
