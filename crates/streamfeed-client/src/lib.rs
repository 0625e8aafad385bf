//! streamfeed Client - Buffered, Batching Stream Producer
//!
//! This crate provides a producer that accepts individual records from any
//! number of concurrent callers, packs them into size- and count-limited
//! batches for a PutRecords-style service, retries what the service
//! throttles, and reports a final outcome for every record.
//!
//! The network call itself is behind the [`PutClient`] trait; the crate ships
//! an in-memory [`MemoryStream`] implementation for tests and demos.
//!
//! # Examples
//!
//! ## Producer
//!
//! ```ignore
//! use streamfeed_client::{MemoryStream, Producer, ProducerConfig, Record};
//! use std::time::Duration;
//!
//! let config = ProducerConfig::builder()
//!     .max_batch_count(100)
//!     .flush_interval(Duration::from_millis(20))
//!     .build()?;
//!
//! let producer = Producer::start(config, MemoryStream::new())?;
//!
//! let handle = producer.enqueue(Record::new("user123", "order data")).await?;
//! match handle.await {
//!     Ok(delivery) => println!("stored in {}", delivery.metadata.shard_id),
//!     Err(e) => eprintln!("lost: {}", e),
//! }
//!
//! producer.close().await?;
//! ```
//!
//! ## Batch Listener
//!
//! ```ignore
//! use streamfeed_client::{BatchResult, Producer};
//!
//! let producer = Producer::start_with_listener(config, client, |result: &BatchResult| {
//!     tracing::info!(
//!         batch_id = result.batch_id,
//!         succeeded = result.succeeded.len(),
//!         failed = result.failed.len(),
//!         "batch complete"
//!     );
//! })?;
//! ```

pub mod batcher;
pub mod client;
pub mod completion;
pub mod config;
pub mod error;
pub mod listener;
pub mod memory;
pub mod producer;
pub mod record;
pub mod retry;

pub use batcher::{Batch, BatchItem, Batcher, Selection};
pub use client::{PutClient, PutOutcome, RecordMetadata};
pub use completion::{completion_pair, Completer, CompletionHandle, Delivery, DeliveryResult};
pub use config::{ProducerConfig, ProducerConfigBuilder};
pub use error::{
    DeliveryError, FailureReason, ProducerError, Result, TerminalCause, TransportError,
    ValidationError,
};
pub use listener::{AttemptKind, BatchListener, BatchResult};
pub use memory::MemoryStream;
pub use producer::{Producer, ProducerStatsSnapshot, SchedulerState};
pub use record::{CorrelationId, Record, RecordLimits};
pub use retry::{BackoffPolicy, ExponentialBackoff, FixedBackoff, RetryDecision, RetryQueue};
