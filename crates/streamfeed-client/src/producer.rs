//! Producer API for sending records through a batching pipeline.
//!
//! The [`Producer`] accepts records from any number of concurrent callers,
//! packs them into batches, hands the batches to a [`PutClient`], retries
//! what the service throttles, and resolves one [`CompletionHandle`] per
//! record with its final outcome.
//!
//! ## Architecture
//!
//! ```text
//!  callers ──enqueue──→ [capacity semaphore] ──→ intake channel
//!                                                      │
//!                                                      ▼
//!                              ┌────────────────────────────────────────┐
//!                              │ flush scheduler (one task)             │
//!                              │  - queue:    VecDeque<PendingItem>     │
//!                              │  - retries:  RetryQueue<PendingItem>   │
//!                              │  - in_flight: JoinSet (≤ max batches)  │
//!                              └──────────┬─────────────────────────────┘
//!                                         │ Batcher::select
//!                                         ▼
//!                               PutClient::put_batch  (concurrent)
//!                                         │
//!                        ┌────────────────┼──────────────────┐
//!                        ▼                ▼                  ▼
//!                    Accepted         Retryable           Terminal
//!                  resolve Ok      RetryQueue / GiveUp   resolve Err
//!                                         │
//!                                         ▼
//!                              BatchListener (notifier task)
//! ```
//!
//! The scheduler task is the only owner of queued, retrying and in-flight
//! records, so there are no locks on the data path. Callers talk to it over
//! channels; statistics are atomics readable from any clone.
//!
//! ## Flush Triggers
//!
//! A batch of fresh records is dispatched when any of these holds and fewer
//! than `max_concurrent_batches` puts are in flight:
//!
//! - **Size**: the queue holds `max_batch_count` records or `max_batch_bytes`
//! - **Time**: the oldest queued record has waited `flush_interval`
//! - **Flush**: [`Producer::flush`] was called
//! - **Drain**: the producer is shutting down
//!
//! Records whose backoff elapsed are dispatched before fresh ones, in their
//! own batches, without waiting for the flush interval.
//!
//! ## Backpressure
//!
//! Every record holds one slot of a fair semaphore sized
//! `max_pending_queue_size` from enqueue until its handle resolves. Queued,
//! retrying and in-flight records together never exceed the bound; callers
//! beyond it wait in FIFO order.
//!
//! ## Ordering
//!
//! Records within one batch keep enqueue order. Batches in flight at the
//! same time complete in any order. Callers that need completion order to
//! match enqueue order must set `max_concurrent_batches` to 1 (retries can
//! still reorder a record behind later ones).
//!
//! ## Examples
//!
//! ```ignore
//! use streamfeed_client::{MemoryStream, Producer, ProducerConfig, Record};
//!
//! let producer = Producer::start(ProducerConfig::default(), MemoryStream::new())?;
//!
//! let handle = producer.enqueue(Record::new("user-42", "order created")).await?;
//! let delivery = handle.await?;
//! println!("stored at {}", delivery.metadata.sequence_number);
//!
//! producer.close().await?;
//! ```

use crate::batcher::{Batch, BatchItem, Batcher};
use crate::client::{align_outcomes, PutClient, PutOutcome};
use crate::completion::{completion_pair, Completer, CompletionHandle, Delivery, DeliveryResult};
use crate::config::ProducerConfig;
use crate::error::{
    DeliveryError, FailureReason, ProducerError, Result, TerminalCause, TransportError,
};
use crate::listener::{panic_message, AttemptKind, BatchListener, BatchResult, Notifier};
use crate::record::Record;
use crate::retry::{decide, RetryDecision, RetryQueue};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument, Span};

/// Lifecycle state of the flush scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerState {
    /// Nothing queued, retrying or in flight.
    Idle,
    /// Records are waiting for a flush trigger or for their backoff.
    Accumulating,
    /// At least one batch is in flight.
    Flushing,
    /// Shutdown requested: no new records, everything held is being sent.
    Draining,
    /// Terminal.
    Closed,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulerState::Idle,
            1 => SchedulerState::Accumulating,
            2 => SchedulerState::Flushing,
            3 => SchedulerState::Draining,
            _ => SchedulerState::Closed,
        }
    }
}

/// Point-in-time copy of the producer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerStatsSnapshot {
    /// Records accepted by `enqueue`.
    pub records_enqueued: u64,
    /// Records resolved with a [`Delivery`].
    pub records_succeeded: u64,
    /// Records resolved with a terminal failure.
    pub records_failed: u64,
    /// Put requests issued, retries included.
    pub batches_dispatched: u64,
    /// Records scheduled for another attempt.
    pub retries: u64,
    /// Put requests currently awaiting a response.
    pub in_flight_batches: u64,
    /// Records enqueued but not yet part of a batch.
    pub queue_depth: u64,
}

/// Counters and lifecycle flags shared by the handles and the scheduler.
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    closing: AtomicBool,
    queue_depth: AtomicUsize,
    in_flight_batches: AtomicUsize,
    records_enqueued: AtomicU64,
    records_succeeded: AtomicU64,
    records_failed: AtomicU64,
    batches_dispatched: AtomicU64,
    retries: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SchedulerState::Idle as u8),
            closing: AtomicBool::new(false),
            queue_depth: AtomicUsize::new(0),
            in_flight_batches: AtomicUsize::new(0),
            records_enqueued: AtomicU64::new(0),
            records_succeeded: AtomicU64::new(0),
            records_failed: AtomicU64::new(0),
            batches_dispatched: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// A record owned by the producer until its handle resolves.
#[derive(Debug)]
struct PendingItem {
    record: Record,
    enqueued_at: Instant,
    /// Puts made so far.
    attempts: u32,
    completer: Completer,
    /// Capacity slot, released when the item is dropped.
    _permit: OwnedSemaphorePermit,
}

impl BatchItem for PendingItem {
    fn size_bytes(&self) -> usize {
        self.record.size_bytes()
    }
}

impl PendingItem {
    fn resolve(mut self, result: DeliveryResult) {
        if let Err(e) = self.completer.complete(result) {
            error!(error = %e, "Record resolved twice");
        }
    }

    fn fail(self, cause: TerminalCause) {
        let correlation_id = self.record.correlation_id();
        self.resolve(Err(DeliveryError::Terminal {
            correlation_id,
            cause,
        }));
    }
}

enum Control {
    Flush(oneshot::Sender<()>),
    Shutdown,
    /// Drain deadline passed: cancel puts and drop everything held.
    Abandon,
}

/// A batch whose put call has returned.
struct Dispatched {
    batch_id: u64,
    kind: AttemptKind,
    items: Vec<PendingItem>,
    outcomes: Vec<PutOutcome>,
    elapsed: Duration,
}

struct Tasks {
    scheduler: JoinHandle<()>,
    notifier: Option<JoinHandle<()>>,
}

struct Inner {
    config: ProducerConfig,
    batcher: Batcher,
    capacity: Arc<Semaphore>,
    intake: mpsc::UnboundedSender<PendingItem>,
    control: mpsc::UnboundedSender<Control>,
    shared: Arc<Shared>,
    tasks: Mutex<Option<Tasks>>,
}

/// Buffered, batching producer.
///
/// Cheap to clone: clones share one flush scheduler. The producer shuts
/// down on [`close`](Producer::close), or drains in the background once the
/// last clone is dropped.
///
/// ## Background Tasks
///
/// [`Producer::start`] spawns the flush scheduler, and the listener notifier
/// when a listener is given. Both must run on a tokio runtime; `start` must
/// be called from within one.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Producer {
    /// Start a producer over `client`.
    ///
    /// # Errors
    ///
    /// `ConfigError` if `config` is invalid.
    pub fn start<C: PutClient>(config: ProducerConfig, client: C) -> Result<Self> {
        Self::spawn(config, Arc::new(client), None)
    }

    /// Start a producer that reports every batch outcome to `listener`.
    pub fn start_with_listener<C, L>(config: ProducerConfig, client: C, listener: L) -> Result<Self>
    where
        C: PutClient,
        L: BatchListener,
    {
        Self::spawn(config, Arc::new(client), Some(Arc::new(listener)))
    }

    /// Run `body` with a fresh producer, then close it.
    ///
    /// The producer is closed whatever `body` returns; every record it
    /// enqueued is resolved by the time this returns.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let sent = Producer::run_scoped(config, stream, |producer| async move {
    ///     for i in 0..10 {
    ///         producer.enqueue(Record::new("k", format!("event-{i}"))).await?;
    ///     }
    ///     Ok::<_, ProducerError>(10)
    /// })
    /// .await??;
    /// ```
    pub async fn run_scoped<C, F, Fut, T>(config: ProducerConfig, client: C, body: F) -> Result<T>
    where
        C: PutClient,
        F: FnOnce(Producer) -> Fut,
        Fut: Future<Output = T>,
    {
        let producer = Self::start(config, client)?;
        let output = body(producer.clone()).await;
        producer.close().await?;
        Ok(output)
    }

    fn spawn(
        config: ProducerConfig,
        client: Arc<dyn PutClient>,
        listener: Option<Arc<dyn BatchListener>>,
    ) -> Result<Self> {
        config.validate()?;

        let batcher = Batcher::new(config.max_batch_count, config.max_batch_bytes);
        let capacity = Arc::new(Semaphore::new(config.max_pending_queue_size));
        let shared = Arc::new(Shared::new());
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let (notifier, notifier_handle) = match listener {
            Some(listener) => {
                let (notifier, handle) = Notifier::spawn(listener);
                (Some(notifier), Some(handle))
            }
            None => (None, None),
        };

        let scheduler = Scheduler {
            config: config.clone(),
            batcher,
            client,
            queue: VecDeque::new(),
            queued_bytes: 0,
            retries: RetryQueue::new(),
            retry_ready: VecDeque::new(),
            in_flight: JoinSet::new(),
            intake: intake_rx,
            intake_closed: false,
            control: control_rx,
            control_closed: false,
            notifier,
            shared: Arc::clone(&shared),
            flush_waiters: Vec::new(),
            draining: false,
            next_batch_id: 1,
        };
        let scheduler_handle = tokio::spawn(scheduler.run().instrument(Span::current()));

        info!(
            max_batch_count = config.max_batch_count,
            max_batch_bytes = config.max_batch_bytes,
            max_pending = config.max_pending_queue_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            max_concurrent_batches = config.max_concurrent_batches,
            "Producer started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                batcher,
                capacity,
                intake: intake_tx,
                control: control_tx,
                shared,
                tasks: Mutex::new(Some(Tasks {
                    scheduler: scheduler_handle,
                    notifier: notifier_handle,
                })),
            }),
        })
    }

    /// Queue a record and return its completion handle.
    ///
    /// Suspends while the producer already holds `max_pending_queue_size`
    /// records. A record that can never fit in a batch is not queued: its
    /// handle comes back already resolved with
    /// [`TerminalCause::RecordTooLarge`].
    ///
    /// # Errors
    ///
    /// - `Validation` if the record violates the service limits
    /// - `ProducerClosed` if shutdown began before the record was queued
    pub async fn enqueue(&self, record: Record) -> Result<CompletionHandle> {
        if let Some(handle) = self.precheck(&record)? {
            return Ok(handle);
        }
        let permit = Arc::clone(&self.inner.capacity)
            .acquire_owned()
            .await
            .map_err(|_| ProducerError::ProducerClosed)?;
        self.submit(record, permit)
    }

    /// [`enqueue`](Producer::enqueue) with a deadline on the wait for capacity.
    ///
    /// # Errors
    ///
    /// `EnqueueTimeout` if no capacity freed up in time. The record is not
    /// queued; batches already in flight are unaffected.
    pub async fn enqueue_timeout(
        &self,
        record: Record,
        timeout: Duration,
    ) -> Result<CompletionHandle> {
        if let Some(handle) = self.precheck(&record)? {
            return Ok(handle);
        }
        let acquire = Arc::clone(&self.inner.capacity).acquire_owned();
        let permit = match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ProducerError::ProducerClosed),
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Enqueue timed out");
                return Err(ProducerError::EnqueueTimeout(timeout));
            }
        };
        self.submit(record, permit)
    }

    /// Enqueue a record and wait for its outcome.
    pub async fn send_and_wait(&self, record: Record) -> Result<DeliveryResult> {
        let handle = self.enqueue(record).await?;
        Ok(handle.await)
    }

    fn precheck(&self, record: &Record) -> Result<Option<CompletionHandle>> {
        if self.inner.shared.closing.load(Ordering::Acquire) {
            return Err(ProducerError::ProducerClosed);
        }
        record.validate(&self.inner.config.limits)?;

        let size = record.size_bytes();
        if self.inner.batcher.fits_alone(size) {
            return Ok(None);
        }

        let correlation_id = record.correlation_id();
        warn!(
            correlation_id = %correlation_id,
            size_bytes = size,
            max_batch_bytes = self.inner.batcher.max_bytes(),
            "Record exceeds batch size, rejecting"
        );
        self.inner
            .shared
            .records_failed
            .fetch_add(1, Ordering::Relaxed);
        Ok(Some(CompletionHandle::resolved(
            correlation_id,
            Err(DeliveryError::Terminal {
                correlation_id,
                cause: TerminalCause::RecordTooLarge {
                    size,
                    max: self.inner.batcher.max_bytes(),
                },
            }),
        )))
    }

    fn submit(&self, record: Record, permit: OwnedSemaphorePermit) -> Result<CompletionHandle> {
        let shared = &self.inner.shared;
        // shutdown may have begun while we waited for capacity
        if shared.closing.load(Ordering::Acquire) {
            return Err(ProducerError::ProducerClosed);
        }

        let correlation_id = record.correlation_id();
        let (completer, handle) = completion_pair(correlation_id);
        let item = PendingItem {
            record,
            enqueued_at: Instant::now(),
            attempts: 0,
            completer,
            _permit: permit,
        };

        shared.queue_depth.fetch_add(1, Ordering::AcqRel);
        if self.inner.intake.send(item).is_err() {
            shared.queue_depth.fetch_sub(1, Ordering::AcqRel);
            return Err(ProducerError::ProducerClosed);
        }
        shared.records_enqueued.fetch_add(1, Ordering::Relaxed);
        trace!(correlation_id = %correlation_id, "Record enqueued");

        Ok(handle)
    }

    /// Send everything held now and wait until it is resolved.
    ///
    /// Pending retries still honor their backoff.
    ///
    /// # Errors
    ///
    /// `ProducerClosed` if the scheduler has already exited.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .control
            .send(Control::Flush(ack_tx))
            .map_err(|_| ProducerError::ProducerClosed)?;
        ack_rx.await.map_err(|_| ProducerError::ProducerClosed)
    }

    /// Shut down gracefully.
    ///
    /// New enqueues fail with `ProducerClosed` from the moment this is
    /// called, including callers already waiting for capacity. Everything
    /// already queued is sent and every retry runs to completion before this
    /// returns. Background tasks have exited on return. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.shutdown(None).await
    }

    /// Shut down, forcing it once `timeout` has passed.
    ///
    /// Past the deadline, in-flight puts are cancelled and every unresolved
    /// handle resolves with [`DeliveryError::ProducerClosed`]. The service
    /// may still have stored records from cancelled puts.
    ///
    /// Listener notifications still pending at the deadline are dropped. A
    /// listener call already running is not interrupted, but this returns
    /// without waiting for it.
    pub async fn close_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.shutdown(Some(timeout)).await
    }

    async fn shutdown(&self, timeout: Option<Duration>) -> Result<()> {
        let mut tasks = self.inner.tasks.lock().await;
        let Some(Tasks {
            mut scheduler,
            notifier,
        }) = tasks.take()
        else {
            return Ok(());
        };

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        info!("Closing producer");
        self.inner.shared.closing.store(true, Ordering::Release);
        self.inner.capacity.close();
        // scheduler gone means it is already draining
        let _ = self.inner.control.send(Control::Shutdown);

        let joined = match deadline {
            None => (&mut scheduler).await,
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut scheduler).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        timeout_ms = timeout.unwrap_or_default().as_millis() as u64,
                        "Drain deadline passed, abandoning remaining records"
                    );
                    let _ = self.inner.control.send(Control::Abandon);
                    scheduler.await
                }
            },
        };

        if let Some(mut notifier) = notifier {
            let finished = match deadline {
                None => Some((&mut notifier).await),
                Some(deadline) => tokio::time::timeout_at(deadline, &mut notifier).await.ok(),
            };
            match finished {
                Some(Ok(())) => {}
                Some(Err(e)) => error!(error = %e, "Listener notifier failed"),
                None => {
                    warn!("Batch listener still busy at deadline, dropping pending notifications");
                    notifier.abort();
                    let _ = notifier.await;
                }
            }
        }

        joined.map_err(|e| ProducerError::Internal(format!("flush scheduler failed: {}", e)))?;
        info!("Producer closed");
        Ok(())
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.inner.shared.state.load(Ordering::Acquire))
    }

    /// Records enqueued but not yet dispatched in a batch.
    pub fn queue_depth(&self) -> usize {
        self.inner.shared.queue_depth.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.inner.config
    }

    /// Counters, read without locking; fields may be mutually stale.
    pub fn stats(&self) -> ProducerStatsSnapshot {
        let s = &self.inner.shared;
        ProducerStatsSnapshot {
            records_enqueued: s.records_enqueued.load(Ordering::Relaxed),
            records_succeeded: s.records_succeeded.load(Ordering::Relaxed),
            records_failed: s.records_failed.load(Ordering::Relaxed),
            batches_dispatched: s.batches_dispatched.load(Ordering::Relaxed),
            retries: s.retries.load(Ordering::Relaxed),
            in_flight_batches: s.in_flight_batches.load(Ordering::Relaxed) as u64,
            queue_depth: s.queue_depth.load(Ordering::Relaxed) as u64,
        }
    }
}

/// The flush scheduler: sole owner of every record the producer holds.
struct Scheduler {
    config: ProducerConfig,
    batcher: Batcher,
    client: Arc<dyn PutClient>,
    /// Fresh records in enqueue order.
    queue: VecDeque<PendingItem>,
    queued_bytes: usize,
    /// Records waiting out their backoff.
    retries: RetryQueue<PendingItem>,
    /// Records whose backoff elapsed, waiting for a free batch slot.
    retry_ready: VecDeque<PendingItem>,
    in_flight: JoinSet<Dispatched>,
    intake: mpsc::UnboundedReceiver<PendingItem>,
    intake_closed: bool,
    control: mpsc::UnboundedReceiver<Control>,
    control_closed: bool,
    notifier: Option<Notifier>,
    shared: Arc<Shared>,
    flush_waiters: Vec<oneshot::Sender<()>>,
    draining: bool,
    next_batch_id: u64,
}

impl Scheduler {
    async fn run(mut self) {
        loop {
            self.dispatch_ready();
            self.ack_flush_waiters();
            self.publish_state();

            if self.draining && self.intake_closed && self.holds_nothing() {
                break;
            }

            let wake_at = self.next_wake();
            let sleep_until = wake_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.on_batch_done(joined);
                }
                control = self.control.recv(), if !self.control_closed => match control {
                    Some(Control::Flush(ack)) => {
                        self.pull_intake();
                        self.flush_waiters.push(ack);
                    }
                    Some(Control::Shutdown) => self.begin_drain(),
                    Some(Control::Abandon) => {
                        self.abandon().await;
                        break;
                    }
                    None => {
                        self.control_closed = true;
                        self.begin_drain();
                    }
                },
                item = self.intake.recv(), if !self.intake_closed => match item {
                    Some(item) => self.accept(item),
                    None => {
                        self.intake_closed = true;
                        self.begin_drain();
                    }
                },
                _ = tokio::time::sleep_until(sleep_until), if wake_at.is_some() => {}
            }
        }

        self.shared.set_state(SchedulerState::Closed);
        for ack in self.flush_waiters.drain(..) {
            let _ = ack.send(());
        }
        debug!("Flush scheduler stopped");
    }

    fn accept(&mut self, item: PendingItem) {
        self.queued_bytes += item.size_bytes();
        self.queue.push_back(item);
    }

    /// Move everything already sent on the intake channel into the queue.
    fn pull_intake(&mut self) {
        while let Ok(item) = self.intake.try_recv() {
            self.accept(item);
        }
    }

    fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        info!(
            queued = self.queue.len(),
            retrying = self.retries.len() + self.retry_ready.len(),
            in_flight = self.in_flight.len(),
            "Draining producer"
        );
        self.draining = true;
        // buffered records are still delivered by recv
        self.intake.close();
    }

    /// Cancel every in-flight put and drop every held record, resolving
    /// each handle with `ProducerClosed`.
    async fn abandon(&mut self) {
        self.begin_drain();
        self.pull_intake();

        let in_flight = self.in_flight.len();
        // dropping the aborted puts drops their records
        self.in_flight.shutdown().await;

        let mut dropped: Vec<PendingItem> = self.queue.drain(..).collect();
        dropped.extend(self.retry_ready.drain(..));
        dropped.extend(self.retries.drain_all());
        warn!(
            in_flight_batches = in_flight,
            held_records = dropped.len(),
            "Abandoning undelivered records"
        );
        drop(dropped);

        self.queued_bytes = 0;
        self.shared.queue_depth.store(0, Ordering::Release);
        self.shared.in_flight_batches.store(0, Ordering::Relaxed);
    }

    fn holds_nothing(&self) -> bool {
        self.queue.is_empty()
            && self.retries.is_empty()
            && self.retry_ready.is_empty()
            && self.in_flight.is_empty()
    }

    fn has_free_slot(&self) -> bool {
        self.in_flight.len() < self.config.max_concurrent_batches
    }

    fn fresh_due(&self, now: Instant) -> bool {
        let Some(oldest) = self.queue.front() else {
            return false;
        };
        self.draining
            || !self.flush_waiters.is_empty()
            || self.batcher.is_full(self.queue.len(), self.queued_bytes)
            || oldest.enqueued_at + self.config.flush_interval <= now
    }

    /// Dispatch batches while a slot is free and something is due.
    fn dispatch_ready(&mut self) {
        let now = Instant::now();
        self.retry_ready.extend(self.retries.pop_ready(now, usize::MAX));

        while self.has_free_slot() {
            let (batch, oversized, kind) = if !self.retry_ready.is_empty() {
                let selection = self.batcher.select(&mut self.retry_ready);
                (selection.batch, selection.oversized, AttemptKind::Retry)
            } else if self.fresh_due(now) {
                let selection = self.batcher.select(&mut self.queue);
                let taken = selection.batch.len() + selection.oversized.len();
                self.queued_bytes -= selection.batch.total_bytes();
                self.queued_bytes -= selection
                    .oversized
                    .iter()
                    .map(|item| item.size_bytes())
                    .sum::<usize>();
                self.shared.queue_depth.fetch_sub(taken, Ordering::AcqRel);
                (selection.batch, selection.oversized, AttemptKind::Fresh)
            } else {
                break;
            };

            if batch.is_empty() && oversized.is_empty() {
                break;
            }
            for item in oversized {
                let size = item.size_bytes();
                warn!(
                    correlation_id = %item.record.correlation_id(),
                    size_bytes = size,
                    "Record exceeds batch size, rejecting"
                );
                self.shared.records_failed.fetch_add(1, Ordering::Relaxed);
                item.fail(TerminalCause::RecordTooLarge {
                    size,
                    max: self.batcher.max_bytes(),
                });
            }
            if !batch.is_empty() {
                self.dispatch(batch, kind);
            }
        }
    }

    fn dispatch(&mut self, batch: Batch<PendingItem>, kind: AttemptKind) {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let size_bytes = batch.total_bytes();
        let mut items = batch.into_items();
        for item in &mut items {
            item.attempts += 1;
        }
        let records: Vec<Record> = items.iter().map(|item| item.record.clone()).collect();

        debug!(
            batch_id = batch_id,
            record_count = records.len(),
            size_bytes = size_bytes,
            kind = ?kind,
            in_flight = self.in_flight.len() + 1,
            "Dispatching batch"
        );

        let client = Arc::clone(&self.client);
        let put = async move {
            let started = Instant::now();
            let response = match AssertUnwindSafe(client.put_batch(&records))
                .catch_unwind()
                .await
            {
                Ok(response) => response,
                Err(panic) => {
                    let panic = panic_message(panic.as_ref()).to_string();
                    error!(batch_id = batch_id, panic = %panic, "Put client panicked");
                    Err(TransportError::new(format!("put client panicked: {}", panic)))
                }
            };
            let outcomes = align_outcomes(records.len(), response);
            Dispatched {
                batch_id,
                kind,
                items,
                outcomes,
                elapsed: started.elapsed(),
            }
        };
        self.in_flight.spawn(put.instrument(Span::current()));

        self.shared.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.shared
            .in_flight_batches
            .store(self.in_flight.len(), Ordering::Relaxed);
    }

    fn on_batch_done(&mut self, joined: std::result::Result<Dispatched, JoinError>) {
        self.shared
            .in_flight_batches
            .store(self.in_flight.len(), Ordering::Relaxed);

        let dispatched = match joined {
            Ok(dispatched) => dispatched,
            Err(e) => {
                // the batch's records were dropped with the task
                error!(error = %e, "Put task failed, records resolved as closed");
                return;
            }
        };

        let Dispatched {
            batch_id,
            kind,
            items,
            outcomes,
            elapsed,
        } = dispatched;

        let mut result = BatchResult {
            batch_id,
            attempt_kind: kind,
            succeeded: Vec::new(),
            failed: Vec::new(),
            elapsed,
        };
        let mut retried = 0usize;
        let now = Instant::now();

        for (item, outcome) in items.into_iter().zip(outcomes) {
            let correlation_id = item.record.correlation_id();
            match outcome {
                PutOutcome::Accepted(metadata) => {
                    result.succeeded.push((correlation_id, metadata.clone()));
                    self.shared.records_succeeded.fetch_add(1, Ordering::Relaxed);
                    let attempts = item.attempts;
                    item.resolve(Ok(Delivery {
                        correlation_id,
                        metadata,
                        attempts,
                    }));
                }
                PutOutcome::Failed(reason) => {
                    result.failed.push((correlation_id, reason.clone()));
                    match reason {
                        FailureReason::Terminal(cause) => {
                            warn!(
                                correlation_id = %correlation_id,
                                cause = %cause,
                                "Record rejected by service"
                            );
                            self.shared.records_failed.fetch_add(1, Ordering::Relaxed);
                            item.fail(cause);
                        }
                        FailureReason::Retryable(cause) => {
                            match decide(
                                item.attempts,
                                self.config.max_retries,
                                &cause,
                                self.config.retry_backoff.as_ref(),
                            ) {
                                RetryDecision::Retry { after } => {
                                    trace!(
                                        correlation_id = %correlation_id,
                                        attempt = item.attempts,
                                        backoff_ms = after.as_millis() as u64,
                                        "Scheduling retry"
                                    );
                                    retried += 1;
                                    self.retries.schedule(item, now + after);
                                }
                                RetryDecision::GiveUp(cause) => {
                                    error!(
                                        correlation_id = %correlation_id,
                                        cause = %cause,
                                        "Giving up on record"
                                    );
                                    self.shared.records_failed.fetch_add(1, Ordering::Relaxed);
                                    item.fail(cause);
                                }
                            }
                        }
                    }
                }
            }
        }

        if retried > 0 {
            self.shared
                .retries
                .fetch_add(retried as u64, Ordering::Relaxed);
            warn!(
                batch_id = batch_id,
                retried = retried,
                "Batch partially throttled, retrying records after backoff"
            );
        }

        debug!(
            batch_id = batch_id,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch completed"
        );

        if let Some(notifier) = &self.notifier {
            notifier.notify(result);
        }
    }

    fn ack_flush_waiters(&mut self) {
        if !self.flush_waiters.is_empty() && self.holds_nothing() {
            for ack in self.flush_waiters.drain(..) {
                let _ = ack.send(());
            }
        }
    }

    /// When the loop must wake up without a message.
    fn next_wake(&self) -> Option<Instant> {
        // a finished batch wakes us anyway
        if !self.has_free_slot() {
            return None;
        }
        let linger = self
            .queue
            .front()
            .map(|oldest| oldest.enqueued_at + self.config.flush_interval);
        match (linger, self.retries.next_ready_at()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn publish_state(&self) {
        let state = if self.draining {
            SchedulerState::Draining
        } else if !self.in_flight.is_empty() {
            SchedulerState::Flushing
        } else if !self.holds_nothing() {
            SchedulerState::Accumulating
        } else {
            SchedulerState::Idle
        };
        self.shared.set_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStream;
    use crate::retry::FixedBackoff;

    fn config() -> ProducerConfig {
        ProducerConfig::builder()
            .max_batch_count(10)
            .max_batch_bytes(1024)
            .max_pending_queue_size(100)
            .flush_interval(Duration::from_millis(50))
            .retry_backoff(FixedBackoff(Duration::from_millis(10)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            SchedulerState::Idle,
            SchedulerState::Accumulating,
            SchedulerState::Flushing,
            SchedulerState::Draining,
            SchedulerState::Closed,
        ] {
            assert_eq!(SchedulerState::from_u8(state as u8), state);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_transitions() {
        let stream = MemoryStream::new();
        let producer = Producer::start(config(), stream.clone()).unwrap();
        assert_eq!(producer.state(), SchedulerState::Idle);

        let handle = producer.enqueue(Record::new("k", "v")).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(producer.state(), SchedulerState::Accumulating);
        assert_eq!(producer.queue_depth(), 1);

        // linger elapses, batch goes out
        handle.await.unwrap();
        assert_eq!(producer.queue_depth(), 0);

        producer.close().await.unwrap();
        assert_eq!(producer.state(), SchedulerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_trigger_waits_for_flush_interval() {
        let stream = MemoryStream::new();
        let producer = Producer::start(config(), stream.clone()).unwrap();

        let started = Instant::now();
        let delivery = producer
            .enqueue(Record::new("k", "v"))
            .await
            .unwrap()
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(delivery.attempts, 1);
        assert_eq!(stream.call_count(), 1);
        producer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_does_not_wait() {
        let stream = MemoryStream::new();
        let producer = Producer::start(config(), stream.clone()).unwrap();

        let started = Instant::now();
        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(producer.enqueue(Record::new("k", format!("{i}"))).await.unwrap());
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(stream.calls().len(), 1);
        assert_eq!(stream.calls()[0].len(), 10);
        producer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_sends_partial_batch_immediately() {
        let stream = MemoryStream::new();
        let producer = Producer::start(config(), stream.clone()).unwrap();

        let started = Instant::now();
        let mut handle = producer.enqueue(Record::new("k", "v")).await.unwrap();
        producer.flush().await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(matches!(handle.try_result(), Some(Ok(_))));
        producer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats() {
        let stream = MemoryStream::new();
        stream.set_rule(|record, attempt| match record.partition_key() {
            "retry" if attempt == 1 => Some(FailureReason::Retryable("throttled".into())),
            "reject" => Some(FailureReason::from_error_code("ValidationException", "bad")),
            _ => None,
        });
        let producer = Producer::start(config(), stream).unwrap();

        let ok = producer.enqueue(Record::new("ok", "1")).await.unwrap();
        let retry = producer.enqueue(Record::new("retry", "2")).await.unwrap();
        let reject = producer.enqueue(Record::new("reject", "3")).await.unwrap();
        producer.flush().await.unwrap();

        assert!(ok.await.is_ok());
        assert_eq!(retry.await.unwrap().attempts, 2);
        assert!(reject.await.is_err());

        let stats = producer.stats();
        assert_eq!(stats.records_enqueued, 3);
        assert_eq!(stats.records_succeeded, 2);
        assert_eq!(stats.records_failed, 1);
        assert_eq!(stats.batches_dispatched, 2);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.in_flight_batches, 0);
        assert_eq!(stats.queue_depth, 0);

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["records_enqueued"], 3);

        producer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let producer = Producer::start(config(), MemoryStream::new()).unwrap();
        producer.close().await.unwrap();
        producer.close().await.unwrap();
        assert!(matches!(
            producer.enqueue(Record::new("k", "v")).await,
            Err(ProducerError::ProducerClosed)
        ));
        assert!(matches!(producer.flush().await, Err(ProducerError::ProducerClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_drains_in_background() {
        let stream = MemoryStream::new();
        let producer = Producer::start(config(), stream.clone()).unwrap();
        let handle = producer.enqueue(Record::new("k", "v")).await.unwrap();
        drop(producer);

        assert!(handle.await.is_ok());
        assert_eq!(stream.accepted().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start() {
        let config = ProducerConfig {
            max_concurrent_batches: 0,
            ..ProducerConfig::default()
        };
        assert!(matches!(
            Producer::start(config, MemoryStream::new()),
            Err(ProducerError::ConfigError(_))
        ));
    }
}
