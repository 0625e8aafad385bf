//! Batch Formation for the streamfeed Producer
//!
//! This module groups pending records into batches that respect the
//! per-request limits of the put operation. It is pure logic: no clocks,
//! no locks, no I/O. The producer's flush scheduler decides *when* to call
//! [`Batcher::select`]; the batcher decides *what* goes into the batch.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  pending queue (FIFO)        │ r1 r2 r3 r4 r5 ...
//! └──────┬───────────────────────┘
//!        │  select()
//!        ▼
//! ┌──────────────────────────────┐
//! │  Batch                       │ r1 r2 r3      count <= max_count
//! │  - items: Vec<T>             │               bytes <= max_bytes
//! │  - total_bytes: usize        │
//! └──────┬───────────────────────┘
//!        │
//!        ▼
//!   PutClient::put_batch(...)
//! ```
//!
//! ## Packing Rules
//!
//! - **Greedy**: items are taken from the front while both budgets hold
//! - **Order-preserving**: a batch is a contiguous prefix of the queue; the
//!   batcher never skips an item that does not fit to grab a smaller one
//! - **Oversized**: an item whose size alone exceeds `max_bytes` is pulled
//!   out into [`Selection::oversized`] and never batched
//!
//! ## Thread Safety
//!
//! `Batcher` is immutable and `Copy`; the queue it operates on belongs to
//! the caller.

use crate::record::Record;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Anything the batcher can pack: it only needs a byte size.
pub trait BatchItem {
    fn size_bytes(&self) -> usize;
}

impl BatchItem for Record {
    fn size_bytes(&self) -> usize {
        Record::size_bytes(self)
    }
}

/// An ordered group of items within the count and byte budgets.
#[derive(Debug)]
pub struct Batch<T> {
    items: Vec<T>,
    total_bytes: usize,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            total_bytes: 0,
        }
    }
}

impl<T: BatchItem> Batch<T> {
    fn push(&mut self, item: T) {
        self.total_bytes += item.size_bytes();
        self.items.push(item);
    }
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of the item sizes.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// Result of one [`Batcher::select`] call.
#[derive(Debug)]
pub struct Selection<T> {
    /// The next batch, possibly empty.
    pub batch: Batch<T>,
    /// Items removed because they can never fit in any batch.
    pub oversized: Vec<T>,
}

/// Packs queued items into batches bounded by count and bytes.
///
/// # Examples
///
/// ```ignore
/// let batcher = Batcher::new(2, 1024);
/// let mut queue: VecDeque<Record> = records.into();
///
/// while !queue.is_empty() {
///     let selection = batcher.select(&mut queue);
///     // ... put selection.batch, fail selection.oversized ...
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batcher {
    max_count: usize,
    max_bytes: usize,
}

impl Batcher {
    /// Create a batcher.
    ///
    /// Both limits must be non-zero; `ProducerConfig` guarantees this.
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            max_count,
            max_bytes,
        }
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Whether a single item can ever be batched.
    pub fn fits_alone(&self, size_bytes: usize) -> bool {
        size_bytes <= self.max_bytes
    }

    /// Size flush trigger: enough is queued to fill a batch.
    pub fn is_full(&self, count: usize, bytes: usize) -> bool {
        count >= self.max_count || bytes >= self.max_bytes
    }

    /// Take the next batch from the front of `queue`.
    ///
    /// Items left in `queue` keep their order.
    pub fn select<T: BatchItem>(&self, queue: &mut VecDeque<T>) -> Selection<T> {
        let mut batch = Batch::default();
        let mut oversized = Vec::new();

        while let Some(front) = queue.front() {
            let size = front.size_bytes();

            if !self.fits_alone(size) {
                trace!(
                    size_bytes = size,
                    max_bytes = self.max_bytes,
                    "Removing oversized item"
                );
                if let Some(item) = queue.pop_front() {
                    oversized.push(item);
                }
                continue;
            }

            if batch.len() >= self.max_count || batch.total_bytes() + size > self.max_bytes {
                break;
            }

            if let Some(item) = queue.pop_front() {
                batch.push(item);
            }
        }

        debug!(
            record_count = batch.len(),
            size_bytes = batch.total_bytes(),
            oversized = oversized.len(),
            remaining = queue.len(),
            "Selected batch"
        );

        Selection { batch, oversized }
    }
}
