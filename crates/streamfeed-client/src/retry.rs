//! Retry Logic with Exponential Backoff
//!
//! Records that the put client reports as `Retryable` are not pushed back
//! onto the intake queue. They wait in a separate [`RetryQueue`] until their
//! backoff elapses, then the flush scheduler batches them again with the
//! same [`Batcher`](crate::Batcher) rules and the same concurrency limit as
//! fresh records.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐
//! │  put_batch   │ Retryable outcome for record r
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │  decide(attempts, ...)       │
//! │  - attempts <= max_retries   │──→ Retry { after: backoff }
//! │  - attempts >  max_retries   │──→ GiveUp(RetriesExhausted)
//! └──────┬───────────────────────┘
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │  RetryQueue                  │ ordered by ready time
//! └──────────────────────────────┘
//!        │
//!        ├─→ Attempt 1: Immediate (fresh batch)
//!        ├─→ Attempt 2: Wait 100ms (backoff)
//!        ├─→ Attempt 3: Wait 200ms (backoff * 2)
//!        └─→ Attempt 4: Wait 400ms (backoff * 4)
//! ```
//!
//! A record is put at most `1 + max_retries` times.
//!
//! ## Jitter
//!
//! The default policy multiplies each delay by a random factor in
//! `[0.75, 1.25]` so that records throttled together do not all come back
//! at the same instant.

use crate::error::TerminalCause;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;

/// Delay before a retry.
///
/// Callers may plug in their own policy through `ProducerConfig`.
pub trait BackoffPolicy: Send + Sync + Debug {
    /// Delay before retry number `retry` (0-based: `backoff(0)` precedes the
    /// second attempt).
    fn backoff(&self, retry: u32) -> Duration;
}

/// Exponential backoff, optionally jittered.
///
/// # Backoff Calculation
///
/// ```text
/// backoff = min(initial * multiplier^retry, max)
///
/// Example with defaults (100ms initial, 2x multiplier, 30s max):
/// - Retry 0: 100ms
/// - Retry 1: 200ms
/// - Retry 2: 400ms
/// - Retry 9+: capped at 30s
/// ```
///
/// With `jitter` the result is scaled by `0.75..=1.25` and capped again.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the first retry
    pub initial: Duration,

    /// Upper bound for any delay
    pub max: Duration,

    /// Growth factor per retry
    pub multiplier: f64,

    /// Randomize delays to spread out retries
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            jitter: true,
        }
    }

    /// Same policy with deterministic delays.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    fn base_backoff(&self, retry: u32) -> Duration {
        let exponent = retry.min(i32::MAX as u32) as i32;
        let backoff_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        if !backoff_ms.is_finite() || backoff_ms >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(backoff_ms as u64)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn backoff(&self, retry: u32) -> Duration {
        let base = self.base_backoff(retry);
        if !self.jitter {
            return base;
        }
        let factor = 0.75 + rand::random::<f64>() * 0.5;
        Duration::from_millis((base.as_millis() as f64 * factor) as u64).min(self.max)
    }
}

/// Same delay before every retry.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl BackoffPolicy for FixedBackoff {
    fn backoff(&self, _retry: u32) -> Duration {
        self.0
    }
}

/// What to do with a record after a retryable failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp(TerminalCause),
}

/// Decide the fate of a record that just failed with a retryable cause.
///
/// `attempts` counts puts made so far, including the one that failed.
pub fn decide(
    attempts: u32,
    max_retries: u32,
    last_cause: &str,
    policy: &dyn BackoffPolicy,
) -> RetryDecision {
    if attempts > max_retries {
        return RetryDecision::GiveUp(TerminalCause::RetriesExhausted {
            attempts,
            last_cause: last_cause.to_string(),
        });
    }
    RetryDecision::Retry {
        after: policy.backoff(attempts.saturating_sub(1)),
    }
}

/// Records waiting out their backoff.
///
/// Separate from the intake queue so that retries never compete with
/// callers for intake capacity. Items become ready in ready-time order;
/// ties keep insertion order.
#[derive(Debug)]
pub struct RetryQueue<T> {
    entries: BTreeMap<(Instant, u64), T>,
    next_seq: u64,
}

impl<T> Default for RetryQueue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> RetryQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, item: T, ready_at: Instant) {
        self.entries.insert((ready_at, self.next_seq), item);
        self.next_seq += 1;
    }

    /// Remove up to `limit` items whose backoff has elapsed at `now`.
    pub fn pop_ready(&mut self, now: Instant, limit: usize) -> Vec<T> {
        let mut ready = Vec::new();
        while ready.len() < limit {
            match self.entries.first_key_value() {
                Some((&(ready_at, _), _)) if ready_at <= now => {
                    if let Some((_, item)) = self.entries.pop_first() {
                        ready.push(item);
                    }
                }
                _ => break,
            }
        }
        ready
    }

    /// Earliest instant at which an item becomes ready.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(ready_at, _)| *ready_at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove everything regardless of readiness (forced shutdown).
    pub fn drain_all(&mut self) -> Vec<T> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // ExponentialBackoff
    // ========================================================================

    #[test]
    fn test_backoff_default() {
        let policy = ExponentialBackoff::default();
        assert_eq!(policy.initial, Duration::from_millis(100));
        assert_eq!(policy.max, Duration::from_secs(30));
        assert_eq!(policy.multiplier, 2.0);
        assert!(policy.jitter);
    }

    #[test]
    fn test_backoff_exponential_growth() {
        let policy = ExponentialBackoff::default().without_jitter();

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1600));
    }

    #[test]
    fn test_backoff_max_cap() {
        let policy =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10), 2.0)
                .without_jitter();

        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10)); // Capped
        assert_eq!(policy.backoff(100), Duration::from_secs(10)); // Still capped
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_multiplier_one_is_constant() {
        let policy =
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(60), 1.0)
                .without_jitter();

        for retry in 0..5 {
            assert_eq!(policy.backoff(retry), Duration::from_millis(500));
        }
    }

    #[test]
    fn test_jittered_backoff_within_bounds() {
        let policy = ExponentialBackoff::default();

        for _ in 0..200 {
            let delay = policy.backoff(2); // base 400ms
            assert!(delay >= Duration::from_millis(300), "{:?}", delay);
            assert!(delay <= Duration::from_millis(500), "{:?}", delay);
        }
    }

    #[test]
    fn test_jittered_backoff_never_exceeds_max() {
        let policy = ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(500),
            2.0,
        );

        for retry in 0..20 {
            assert!(policy.backoff(retry) <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = FixedBackoff(Duration::from_millis(5));
        assert_eq!(policy.backoff(0), Duration::from_millis(5));
        assert_eq!(policy.backoff(9), Duration::from_millis(5));
    }

    // ========================================================================
    // decide
    // ========================================================================

    #[test]
    fn test_decide_retries_until_budget_spent() {
        let policy = ExponentialBackoff::default().without_jitter();

        assert_eq!(
            decide(1, 3, "throttled", &policy),
            RetryDecision::Retry {
                after: Duration::from_millis(100)
            }
        );
        assert_eq!(
            decide(3, 3, "throttled", &policy),
            RetryDecision::Retry {
                after: Duration::from_millis(400)
            }
        );
        assert_eq!(
            decide(4, 3, "throttled", &policy),
            RetryDecision::GiveUp(TerminalCause::RetriesExhausted {
                attempts: 4,
                last_cause: "throttled".to_string(),
            })
        );
    }

    #[test]
    fn test_decide_zero_retries_gives_up_immediately() {
        let policy = FixedBackoff(Duration::from_millis(1));
        assert!(matches!(
            decide(1, 0, "throttled", &policy),
            RetryDecision::GiveUp(TerminalCause::RetriesExhausted { attempts: 1, .. })
        ));
    }

    // ========================================================================
    // RetryQueue
    // ========================================================================

    #[test]
    fn test_retry_queue_ready_order() {
        let now = Instant::now();
        let mut queue = RetryQueue::new();

        queue.schedule("late", now + Duration::from_millis(20));
        queue.schedule("early", now + Duration::from_millis(10));
        queue.schedule("early-2", now + Duration::from_millis(10));

        assert_eq!(queue.next_ready_at(), Some(now + Duration::from_millis(10)));
        assert!(queue.pop_ready(now, 10).is_empty());

        let ready = queue.pop_ready(now + Duration::from_millis(15), 10);
        assert_eq!(ready, vec!["early", "early-2"]);

        let ready = queue.pop_ready(now + Duration::from_millis(20), 10);
        assert_eq!(ready, vec!["late"]);
        assert!(queue.is_empty());
        assert_eq!(queue.next_ready_at(), None);
    }

    #[test]
    fn test_retry_queue_pop_limit() {
        let now = Instant::now();
        let mut queue = RetryQueue::new();
        for i in 0..5 {
            queue.schedule(i, now);
        }

        assert_eq!(queue.pop_ready(now, 2), vec![0, 1]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_retry_queue_drain_all() {
        let now = Instant::now();
        let mut queue = RetryQueue::new();
        queue.schedule(1, now + Duration::from_secs(60));
        queue.schedule(2, now);

        let mut drained = queue.drain_all();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert!(queue.is_empty());
    }
}
