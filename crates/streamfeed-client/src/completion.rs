//! Single-assignment completion handles.
//!
//! Every enqueued record gets a [`CompletionHandle`] that resolves exactly
//! once with the record's final outcome. The producer keeps the matching
//! [`Completer`] alongside the record until that outcome is known.
//!
//! ## Guarantees
//!
//! - Resolving a completer twice is rejected with
//!   [`ProducerError::AlreadyCompleted`]; the first result stands.
//! - A completer dropped without being resolved resolves its handle with
//!   [`DeliveryError::ProducerClosed`], so no handle waits forever.
//! - Dropping a handle (or timing out a wait on it) does not cancel the
//!   record. It still goes through its batch; the result is discarded.

use crate::client::RecordMetadata;
use crate::error::{DeliveryError, ProducerError, Result};
use crate::record::CorrelationId;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

/// A successfully stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub correlation_id: CorrelationId,
    pub metadata: RecordMetadata,
    /// Number of puts it took, including the successful one.
    pub attempts: u32,
}

/// Final outcome of a record.
pub type DeliveryResult = std::result::Result<Delivery, DeliveryError>;

/// Create a linked completer/handle pair for one record.
pub fn completion_pair(correlation_id: CorrelationId) -> (Completer, CompletionHandle) {
    let (tx, rx) = oneshot::channel();
    (
        Completer {
            correlation_id,
            sender: Some(tx),
        },
        CompletionHandle {
            correlation_id,
            receiver: Some(rx),
        },
    )
}

/// Producer-side half: resolves the handle once.
#[derive(Debug)]
pub struct Completer {
    correlation_id: CorrelationId,
    sender: Option<oneshot::Sender<DeliveryResult>>,
}

impl Completer {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Resolve the handle.
    ///
    /// A caller that already dropped its handle is not an error.
    ///
    /// # Errors
    ///
    /// `AlreadyCompleted` if this completer was resolved before.
    pub fn complete(&mut self, result: DeliveryResult) -> Result<()> {
        let sender = self
            .sender
            .take()
            .ok_or(ProducerError::AlreadyCompleted(self.correlation_id))?;
        let _ = sender.send(result);
        Ok(())
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Err(DeliveryError::ProducerClosed {
                correlation_id: self.correlation_id,
            }));
        }
    }
}

/// Caller-side half: a future resolving to the record's [`DeliveryResult`].
///
/// # Examples
///
/// ```ignore
/// let handle = producer.enqueue(record).await?;
///
/// // block on it
/// let delivery = handle.await?;
///
/// // or attach a continuation and move on
/// producer.enqueue(other).await?.on_complete(|result| {
///     if let Err(e) = result {
///         tracing::warn!(error = %e, "record lost");
///     }
/// });
/// ```
#[derive(Debug)]
pub struct CompletionHandle {
    correlation_id: CorrelationId,
    receiver: Option<oneshot::Receiver<DeliveryResult>>,
}

impl CompletionHandle {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// A handle that is already resolved.
    pub(crate) fn resolved(correlation_id: CorrelationId, result: DeliveryResult) -> Self {
        let (mut completer, handle) = completion_pair(correlation_id);
        // a fresh completer cannot already be completed
        let _ = completer.complete(result);
        handle
    }

    /// Take the result if it is already known, without waiting.
    ///
    /// Returns `None` while the record is pending, and after the result was
    /// taken once.
    pub fn try_result(&mut self) -> Option<DeliveryResult> {
        let receiver = self.receiver.as_mut()?;
        match receiver.try_recv() {
            Ok(result) => {
                self.receiver = None;
                Some(result)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.receiver = None;
                Some(Err(self.closed()))
            }
        }
    }

    /// Wait at most `timeout` for the result.
    ///
    /// On timeout the record keeps going; the handle is consumed and its
    /// eventual result is discarded.
    pub async fn wait_timeout(self, timeout: Duration) -> Option<DeliveryResult> {
        tokio::time::timeout(timeout, self).await.ok()
    }

    /// Run `f` with the result once it is known, on a spawned task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on_complete<F>(self, f: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(DeliveryResult) + Send + 'static,
    {
        tokio::spawn(async move {
            f(self.await);
        })
    }

    fn closed(&self) -> DeliveryError {
        DeliveryError::ProducerClosed {
            correlation_id: self.correlation_id,
        }
    }
}

impl Future for CompletionHandle {
    type Output = DeliveryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Poll::Ready(Err(self.closed()));
        };
        match Pin::new(receiver).poll(cx) {
            Poll::Ready(result) => {
                self.receiver = None;
                Poll::Ready(result.unwrap_or_else(|_| Err(self.closed())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
