//! Batch completion callbacks.
//!
//! A [`BatchListener`] is told about every dispatched batch once its put
//! call has returned, fresh batches and retry batches alike. It is meant for
//! metrics and telemetry. It never affects the records it is told about:
//! by the time it runs, their completion handles are already resolved.
//!
//! Listeners run on tokio's blocking pool, one call at a time in batch
//! order, fed by an unbounded channel. A listener that blocks delays only
//! later notifications, never flushes. A panicking listener is logged and
//! skipped.

use crate::client::RecordMetadata;
use crate::error::FailureReason;
use crate::record::CorrelationId;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace, Instrument, Span};

/// Whether a batch carried fresh records or retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    Fresh,
    Retry,
}

/// Aggregate outcome of one dispatched batch.
///
/// Retryable failures appear in `failed` even though the records involved
/// are retried; a later batch reports their next attempt.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Producer-local, increasing batch number.
    pub batch_id: u64,
    pub attempt_kind: AttemptKind,
    pub succeeded: Vec<(CorrelationId, RecordMetadata)>,
    pub failed: Vec<(CorrelationId, FailureReason)>,
    /// Time spent in `put_batch`.
    pub elapsed: Duration,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Observer of batch outcomes.
///
/// Closures work directly:
///
/// ```ignore
/// let producer = Producer::start_with_listener(config, client, |result: &BatchResult| {
///     tracing::info!(batch_id = result.batch_id, failed = result.failed.len(), "batch done");
/// })?;
/// ```
pub trait BatchListener: Send + Sync + 'static {
    fn on_batch_complete(&self, result: &BatchResult);
}

impl<F> BatchListener for F
where
    F: Fn(&BatchResult) + Send + Sync + 'static,
{
    fn on_batch_complete(&self, result: &BatchResult) {
        self(result)
    }
}

/// Sending side of the notifier task.
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    tx: mpsc::UnboundedSender<BatchResult>,
}

impl Notifier {
    /// Spawn the notifier task for `listener`.
    ///
    /// The task exits once every `Notifier` clone is dropped and the
    /// backlog is delivered.
    pub(crate) fn spawn(listener: Arc<dyn BatchListener>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<BatchResult>();

        let task = async move {
            while let Some(result) = rx.recv().await {
                let batch_id = result.batch_id;
                trace!(batch_id = batch_id, "Notifying batch listener");

                let listener = Arc::clone(&listener);
                let call = tokio::task::spawn_blocking(move || {
                    catch_unwind(AssertUnwindSafe(|| listener.on_batch_complete(&result)))
                        .map_err(|panic| panic_message(panic.as_ref()).to_string())
                });
                match call.await {
                    Ok(Ok(())) => {}
                    Ok(Err(panic)) => {
                        error!(batch_id = batch_id, panic = %panic, "Batch listener panicked")
                    }
                    Err(e) => error!(batch_id = batch_id, error = %e, "Batch listener task failed"),
                }
            }
        };
        let handle = tokio::spawn(task.instrument(Span::current()));

        (Self { tx }, handle)
    }

    pub(crate) fn notify(&self, result: BatchResult) {
        // receiver only goes away with the runtime
        let _ = self.tx.send(result);
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
