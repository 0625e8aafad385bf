//! In-process stream.
//!
//! [`MemoryStream`] is a [`PutClient`] that stores records in memory on a
//! single shard. It accepts everything unless told otherwise, which makes it
//! the stand-in for the real service in tests, benchmarks and demos.
//!
//! ## Fault Injection
//!
//! - [`fail_next_calls`](MemoryStream::fail_next_calls): the next `n` calls
//!   fail as a whole with a [`TransportError`]
//! - [`set_rule`](MemoryStream::set_rule): decide per record and attempt
//!   whether it fails, and how
//! - [`set_latency`](MemoryStream::set_latency): every call sleeps first
//!
//! Attempts are counted per correlation id, starting at 1, and include calls
//! that failed wholesale.

use crate::client::{PutClient, PutOutcome, RecordMetadata};
use crate::error::{FailureReason, TransportError};
use crate::record::{CorrelationId, Record};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

/// Shard every record lands on.
pub const SHARD_ID: &str = "shardId-000000000000";

type Rule = Arc<dyn Fn(&Record, u32) -> Option<FailureReason> + Send + Sync>;

#[derive(Default)]
struct State {
    records: Vec<Record>,
    calls: Vec<Vec<CorrelationId>>,
    attempts: HashMap<CorrelationId, u32>,
    next_sequence: u64,
    fail_next_calls: usize,
    latency: Duration,
    rule: Option<Rule>,
}

/// In-memory single-shard stream.
///
/// Cheap to clone; clones share the same stream.
///
/// # Examples
///
/// ```ignore
/// let stream = MemoryStream::new();
///
/// // throttle every record on its first attempt
/// stream.set_rule(|_record, attempt| {
///     (attempt == 1).then(|| FailureReason::Retryable("throttled".into()))
/// });
///
/// let producer = Producer::start(config, stream.clone())?;
/// ```
#[derive(Clone, Default)]
pub struct MemoryStream {
    state: Arc<Mutex<State>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryStream")
            .field("records", &state.records.len())
            .field("calls", &state.calls.len())
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // a panicking rule must not wedge the stream
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `n` calls with a transport error.
    pub fn fail_next_calls(&self, n: usize) {
        self.state().fail_next_calls = n;
    }

    /// Decide the outcome of each record: `Some(reason)` fails it, `None`
    /// lets it through. The second argument is the record's attempt number.
    pub fn set_rule<F>(&self, rule: F)
    where
        F: Fn(&Record, u32) -> Option<FailureReason> + Send + Sync + 'static,
    {
        self.state().rule = Some(Arc::new(rule));
    }

    pub fn clear_rule(&self) {
        self.state().rule = None;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Records accepted so far, in acceptance order.
    pub fn accepted(&self) -> Vec<Record> {
        self.state().records.clone()
    }

    /// Correlation ids of every call, in call order.
    pub fn calls(&self) -> Vec<Vec<CorrelationId>> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    /// How many times a record was put, including failed calls.
    pub fn attempts(&self, id: CorrelationId) -> u32 {
        self.state().attempts.get(&id).copied().unwrap_or(0)
    }

    /// `put_batch` calls running right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `put_batch` calls observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PutClient for MemoryStream {
    async fn put_batch(&self, records: &[Record]) -> Result<Vec<PutOutcome>, TransportError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let (latency, attempts) = {
            let mut state = self.state();
            state
                .calls
                .push(records.iter().map(Record::correlation_id).collect());
            let attempts: Vec<u32> = records
                .iter()
                .map(|r| {
                    let n = state.attempts.entry(r.correlation_id()).or_insert(0);
                    *n += 1;
                    *n
                })
                .collect();
            (state.latency, attempts)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if state.fail_next_calls > 0 {
            state.fail_next_calls -= 1;
            trace!(records = records.len(), "Injecting transport failure");
            return Err(TransportError::new("injected transport failure"));
        }

        let rule = state.rule.clone();
        let mut outcomes = Vec::with_capacity(records.len());
        for (record, attempt) in records.iter().zip(attempts) {
            if let Some(reason) = rule.as_ref().and_then(|rule| rule(record, attempt)) {
                outcomes.push(PutOutcome::Failed(reason));
                continue;
            }
            state.next_sequence += 1;
            let sequence_number = state.next_sequence.to_string();
            state.records.push(record.clone());
            outcomes.push(PutOutcome::Accepted(RecordMetadata {
                shard_id: SHARD_ID.to_string(),
                sequence_number,
            }));
        }

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TerminalCause;

    #[tokio::test]
    async fn test_accepts_everything_by_default() {
        let stream = MemoryStream::new();
        let records = vec![Record::new("a", "1"), Record::new("b", "2")];

        let outcomes = stream.put_batch(&records).await.unwrap();

        assert_eq!(
            outcomes,
            vec![
                PutOutcome::Accepted(RecordMetadata {
                    shard_id: SHARD_ID.to_string(),
                    sequence_number: "1".to_string(),
                }),
                PutOutcome::Accepted(RecordMetadata {
                    shard_id: SHARD_ID.to_string(),
                    sequence_number: "2".to_string(),
                }),
            ]
        );
        assert_eq!(stream.accepted(), records);
        assert_eq!(stream.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_next_calls() {
        let stream = MemoryStream::new();
        let records = vec![Record::new("a", "1")];
        stream.fail_next_calls(2);

        assert!(stream.put_batch(&records).await.is_err());
        assert!(stream.put_batch(&records).await.is_err());
        assert!(stream.put_batch(&records).await.is_ok());
        assert_eq!(stream.attempts(records[0].correlation_id()), 3);
        assert_eq!(stream.accepted().len(), 1);
    }

    #[tokio::test]
    async fn test_rule_sees_attempt_numbers() {
        let stream = MemoryStream::new();
        stream.set_rule(|record, attempt| {
            if record.partition_key() == "bad" {
                Some(FailureReason::Terminal(TerminalCause::Rejected {
                    code: "ValidationException".to_string(),
                    message: "nope".to_string(),
                }))
            } else if attempt == 1 {
                Some(FailureReason::Retryable("throttled".to_string()))
            } else {
                None
            }
        });
        let records = vec![Record::new("good", "1"), Record::new("bad", "2")];

        let first = stream.put_batch(&records).await.unwrap();
        assert!(matches!(first[0], PutOutcome::Failed(FailureReason::Retryable(_))));
        assert!(matches!(first[1], PutOutcome::Failed(FailureReason::Terminal(_))));

        let second = stream.put_batch(&records[..1]).await.unwrap();
        assert!(matches!(second[0], PutOutcome::Accepted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracks_concurrency() {
        let stream = MemoryStream::new();
        stream.set_latency(Duration::from_millis(10));
        let a = vec![Record::new("a", "1")];
        let b = vec![Record::new("b", "2")];

        let (ra, rb) = tokio::join!(stream.put_batch(&a), stream.put_batch(&b));
        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(stream.max_concurrency(), 2);
    }
}
