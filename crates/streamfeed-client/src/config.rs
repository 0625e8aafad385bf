//! Producer configuration.
//!
//! A [`ProducerConfig`] is an immutable value built once, validated once,
//! and handed to [`Producer::start`](crate::Producer::start). Invalid values
//! fail construction with [`ProducerError::ConfigError`]; nothing is clamped.
//!
//! ## Configuration Fields
//!
//! - `max_batch_count`: records per put request (default: 500)
//! - `max_batch_bytes`: bytes per put request (default: 5 MiB)
//! - `max_pending_queue_size`: records held by the producer at once (default: 10,000)
//! - `flush_interval`: linger before a partial batch is sent (default: 100ms)
//! - `max_retries`: retries per record after the first put (default: 3)
//! - `retry_backoff`: delay policy between retries (default: exponential, jittered)
//! - `max_concurrent_batches`: put requests in flight at once (default: 4)
//! - `limits`: service limits records and batches are checked against
//!
//! ## Environment
//!
//! [`ProducerConfig::from_env`] overlays these variables on the defaults:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `STREAMFEED_MAX_BATCH_COUNT` | `max_batch_count` |
//! | `STREAMFEED_MAX_BATCH_BYTES` | `max_batch_bytes` |
//! | `STREAMFEED_MAX_PENDING` | `max_pending_queue_size` |
//! | `STREAMFEED_FLUSH_INTERVAL_MS` | `flush_interval` |
//! | `STREAMFEED_MAX_RETRIES` | `max_retries` |
//! | `STREAMFEED_MAX_CONCURRENT_BATCHES` | `max_concurrent_batches` |
//! | `STREAMFEED_RETRY_BACKOFF_MS` | initial exponential backoff |
//! | `STREAMFEED_RETRY_BACKOFF_MAX_MS` | maximum exponential backoff |

use crate::error::{ProducerError, Result};
use crate::record::RecordLimits;
use crate::retry::{BackoffPolicy, ExponentialBackoff};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Immutable producer configuration.
///
/// Create one with [`ProducerConfig::builder`], [`ProducerConfig::from_env`],
/// or `ProducerConfig::default()`.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Maximum number of records in one batch.
    pub max_batch_count: usize,

    /// Maximum total [`Record::size_bytes`](crate::Record::size_bytes) of one batch.
    pub max_batch_bytes: usize,

    /// Maximum number of records the producer holds at once: queued,
    /// waiting to retry, or in flight. `enqueue` suspends beyond this.
    pub max_pending_queue_size: usize,

    /// How long the oldest queued record may wait before a partial batch
    /// is flushed.
    pub flush_interval: Duration,

    /// Retries per record after its first put.
    pub max_retries: u32,

    /// Delay before each retry.
    pub retry_backoff: Arc<dyn BackoffPolicy>,

    /// Maximum number of `put_batch` calls in flight at once.
    ///
    /// Set to 1 for completion order to follow enqueue order.
    pub max_concurrent_batches: usize,

    /// Service limits.
    pub limits: RecordLimits,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        let limits = RecordLimits::default();
        Self {
            max_batch_count: limits.max_records_per_request,
            max_batch_bytes: limits.max_request_bytes,
            max_pending_queue_size: 10_000,
            flush_interval: Duration::from_millis(100),
            max_retries: 3,
            retry_backoff: Arc::new(ExponentialBackoff::default()),
            max_concurrent_batches: 4,
            limits,
        }
    }
}

impl ProducerConfig {
    pub fn builder() -> ProducerConfigBuilder {
        ProducerConfigBuilder::new()
    }

    /// Defaults overlaid with `STREAMFEED_*` environment variables.
    ///
    /// # Errors
    ///
    /// `ConfigError` if a variable does not parse or the result is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = Self::builder();

        if let Some(v) = parse_var(&lookup, "STREAMFEED_MAX_BATCH_COUNT")? {
            builder = builder.max_batch_count(v);
        }
        if let Some(v) = parse_var(&lookup, "STREAMFEED_MAX_BATCH_BYTES")? {
            builder = builder.max_batch_bytes(v);
        }
        if let Some(v) = parse_var(&lookup, "STREAMFEED_MAX_PENDING")? {
            builder = builder.max_pending_queue_size(v);
        }
        if let Some(ms) = parse_var(&lookup, "STREAMFEED_FLUSH_INTERVAL_MS")? {
            builder = builder.flush_interval(Duration::from_millis(ms));
        }
        if let Some(v) = parse_var(&lookup, "STREAMFEED_MAX_RETRIES")? {
            builder = builder.max_retries(v);
        }
        if let Some(v) = parse_var(&lookup, "STREAMFEED_MAX_CONCURRENT_BATCHES")? {
            builder = builder.max_concurrent_batches(v);
        }

        let initial = parse_var::<u64>(&lookup, "STREAMFEED_RETRY_BACKOFF_MS")?;
        let max = parse_var::<u64>(&lookup, "STREAMFEED_RETRY_BACKOFF_MAX_MS")?;
        if initial.is_some() || max.is_some() {
            let defaults = ExponentialBackoff::default();
            let initial = initial.map(Duration::from_millis).unwrap_or(defaults.initial);
            let max = max.map(Duration::from_millis).unwrap_or(defaults.max);
            if initial > max {
                return Err(ProducerError::ConfigError(format!(
                    "retry backoff {:?} exceeds its maximum {:?}",
                    initial, max
                )));
            }
            builder = builder.retry_backoff(ExponentialBackoff::new(
                initial,
                max,
                defaults.multiplier,
            ));
        }

        builder.build()
    }

    /// Check every invariant the producer relies on.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("max_batch_count", self.max_batch_count),
            ("max_batch_bytes", self.max_batch_bytes),
            ("max_pending_queue_size", self.max_pending_queue_size),
            ("max_concurrent_batches", self.max_concurrent_batches),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ProducerError::ConfigError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.flush_interval.is_zero() {
            return Err(ProducerError::ConfigError(
                "flush_interval must be greater than zero".to_string(),
            ));
        }

        if self.max_batch_count > self.limits.max_records_per_request {
            return Err(ProducerError::ConfigError(format!(
                "max_batch_count {} exceeds the service limit of {} records per request",
                self.max_batch_count, self.limits.max_records_per_request
            )));
        }

        if self.max_batch_bytes > self.limits.max_request_bytes {
            return Err(ProducerError::ConfigError(format!(
                "max_batch_bytes {} exceeds the service limit of {} bytes per request",
                self.max_batch_bytes, self.limits.max_request_bytes
            )));
        }

        // tokio's semaphore caps its permit count
        if self.max_pending_queue_size > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(ProducerError::ConfigError(format!(
                "max_pending_queue_size {} is too large",
                self.max_pending_queue_size
            )));
        }

        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ProducerError::ConfigError(format!("{}={:?} is invalid: {}", name, raw, e))
        }),
    }
}

/// Builder for [`ProducerConfig`].
///
/// # Examples
///
/// ```ignore
/// use std::time::Duration;
/// use streamfeed_client::{FixedBackoff, ProducerConfig};
///
/// let config = ProducerConfig::builder()
///     .max_batch_count(100)
///     .flush_interval(Duration::from_millis(20))
///     .max_retries(5)
///     .retry_backoff(FixedBackoff(Duration::from_millis(50)))
///     .max_concurrent_batches(1)
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_batch_count(mut self, count: usize) -> Self {
        self.config.max_batch_count = count;
        self
    }

    pub fn max_batch_bytes(mut self, bytes: usize) -> Self {
        self.config.max_batch_bytes = bytes;
        self
    }

    pub fn max_pending_queue_size(mut self, size: usize) -> Self {
        self.config.max_pending_queue_size = size;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Replace the retry delay policy.
    pub fn retry_backoff(mut self, policy: impl BackoffPolicy + 'static) -> Self {
        self.config.retry_backoff = Arc::new(policy);
        self
    }

    pub fn max_concurrent_batches(mut self, limit: usize) -> Self {
        self.config.max_concurrent_batches = limit;
        self
    }

    /// Override the service limits (for services with different quotas).
    pub fn limits(mut self, limits: RecordLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// `ConfigError` naming the first invalid field.
    pub fn build(self) -> Result<ProducerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::FixedBackoff;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ProducerConfig::default();
        assert_eq!(config.max_batch_count, 500);
        assert_eq!(config.max_batch_bytes, 5 * 1024 * 1024);
        assert_eq!(config.max_pending_queue_size, 10_000);
        assert_eq!(config.flush_interval, Duration::from_millis(100));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_concurrent_batches, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_sets_fields() {
        let config = ProducerConfig::builder()
            .max_batch_count(2)
            .max_batch_bytes(1024)
            .max_pending_queue_size(8)
            .flush_interval(Duration::from_millis(5))
            .max_retries(0)
            .retry_backoff(FixedBackoff(Duration::from_millis(7)))
            .max_concurrent_batches(1)
            .build()
            .unwrap();

        assert_eq!(config.max_batch_count, 2);
        assert_eq!(config.max_batch_bytes, 1024);
        assert_eq!(config.max_pending_queue_size, 8);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.retry_backoff.backoff(3), Duration::from_millis(7));
        assert_eq!(config.max_concurrent_batches, 1);
    }

    #[test]
    fn test_zero_values_rejected() {
        let cases = [
            ProducerConfig::builder().max_batch_count(0),
            ProducerConfig::builder().max_batch_bytes(0),
            ProducerConfig::builder().max_pending_queue_size(0),
            ProducerConfig::builder().max_concurrent_batches(0),
            ProducerConfig::builder().flush_interval(Duration::ZERO),
        ];
        for builder in cases {
            assert!(matches!(builder.build(), Err(ProducerError::ConfigError(_))));
        }
    }

    #[test]
    fn test_service_limits_not_clamped() {
        let err = ProducerConfig::builder()
            .max_batch_count(501)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_batch_count 501"));

        let err = ProducerConfig::builder()
            .max_batch_bytes(5 * 1024 * 1024 + 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, ProducerError::ConfigError(_)));
    }

    #[test]
    fn test_custom_limits() {
        let limits = RecordLimits {
            max_records_per_request: 10,
            ..RecordLimits::default()
        };
        assert!(ProducerConfig::builder()
            .limits(limits)
            .max_batch_count(10)
            .build()
            .is_ok());
        assert!(ProducerConfig::builder()
            .limits(limits)
            .build()
            .is_err());
    }

    #[test]
    fn test_from_env_overlays_defaults() {
        let config = ProducerConfig::from_lookup(lookup(&[
            ("STREAMFEED_MAX_BATCH_COUNT", "50"),
            ("STREAMFEED_FLUSH_INTERVAL_MS", "250"),
            ("STREAMFEED_MAX_RETRIES", " 7 "),
            ("STREAMFEED_MAX_CONCURRENT_BATCHES", "1"),
        ]))
        .unwrap();

        assert_eq!(config.max_batch_count, 50);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.max_concurrent_batches, 1);
        assert_eq!(config.max_pending_queue_size, 10_000);
    }

    #[test]
    fn test_from_env_backoff() {
        let config = ProducerConfig::from_lookup(lookup(&[
            ("STREAMFEED_RETRY_BACKOFF_MS", "10"),
            ("STREAMFEED_RETRY_BACKOFF_MAX_MS", "40"),
        ]))
        .unwrap();

        for retry in 0..10 {
            assert!(config.retry_backoff.backoff(retry) <= Duration::from_millis(40));
        }

        let err = ProducerConfig::from_lookup(lookup(&[
            ("STREAMFEED_RETRY_BACKOFF_MS", "100"),
            ("STREAMFEED_RETRY_BACKOFF_MAX_MS", "10"),
        ]));
        assert!(matches!(err, Err(ProducerError::ConfigError(_))));
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        let err = ProducerConfig::from_lookup(lookup(&[("STREAMFEED_MAX_PENDING", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("STREAMFEED_MAX_PENDING"));

        let err = ProducerConfig::from_lookup(lookup(&[("STREAMFEED_MAX_PENDING", "0")]));
        assert!(matches!(err, Err(ProducerError::ConfigError(_))));
    }

    #[test]
    fn test_from_env_empty_is_default() {
        let config = ProducerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.max_batch_count, 500);
    }
}
