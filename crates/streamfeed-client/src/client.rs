//! The seam to the streaming service.
//!
//! The producer never talks to the network itself. It hands each batch to a
//! [`PutClient`], which performs one put request and reports a per-record
//! outcome. Implementations are thin adapters (an SDK client, a local
//! emulator, the in-memory [`MemoryStream`]).
//!
//! ## Outcome Contract
//!
//! - `Ok(outcomes)`: one [`PutOutcome`] per record, **in request order**.
//!   A request may partially succeed.
//! - `Err(TransportError)`: the call failed as a whole; the producer treats
//!   every record of the batch as retryable.
//!
//! [`MemoryStream`]: crate::memory::MemoryStream

use crate::error::{FailureReason, TransportError};
use crate::record::Record;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Service-assigned metadata for an accepted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Shard the record was written to.
    pub shard_id: String,
    /// Sequence number assigned within the shard.
    pub sequence_number: String,
}

/// Outcome of one record within a put request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted(RecordMetadata),
    Failed(FailureReason),
}

/// Underlying put operation of the streaming service.
///
/// # Examples
///
/// ```ignore
/// use async_trait::async_trait;
/// use streamfeed_client::{PutClient, PutOutcome, Record, RecordMetadata, TransportError};
///
/// struct Sdk(aws_sdk_kinesis::Client, String);
///
/// #[async_trait]
/// impl PutClient for Sdk {
///     async fn put_batch(&self, records: &[Record]) -> Result<Vec<PutOutcome>, TransportError> {
///         // build a PutRecords request, map each response entry to a PutOutcome
///         todo!()
///     }
/// }
/// ```
#[async_trait]
pub trait PutClient: Send + Sync + 'static {
    /// Put `records` in one request and report one outcome per record.
    async fn put_batch(&self, records: &[Record]) -> Result<Vec<PutOutcome>, TransportError>;
}

#[async_trait]
impl<C: PutClient + ?Sized> PutClient for Arc<C> {
    async fn put_batch(&self, records: &[Record]) -> Result<Vec<PutOutcome>, TransportError> {
        (**self).put_batch(records).await
    }
}

/// Line a put response up with the request it answers.
///
/// A transport failure becomes `Retryable` for every record. A response
/// shorter than the request leaves the missing tail `Retryable`; extra
/// entries are dropped.
pub(crate) fn align_outcomes(
    expected: usize,
    response: Result<Vec<PutOutcome>, TransportError>,
) -> Vec<PutOutcome> {
    match response {
        Err(e) => {
            warn!(error = %e, records = expected, "Put request failed, retrying whole batch");
            vec![PutOutcome::Failed(FailureReason::Retryable(e.to_string())); expected]
        }
        Ok(mut outcomes) => {
            if outcomes.len() != expected {
                warn!(
                    expected = expected,
                    received = outcomes.len(),
                    "Put response does not match request size"
                );
                outcomes.truncate(expected);
                outcomes.resize(
                    expected,
                    PutOutcome::Failed(FailureReason::Retryable(
                        "missing outcome in put response".to_string(),
                    )),
                );
            }
            outcomes
        }
    }
}
