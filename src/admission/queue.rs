use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::{
    concurrency::{ConcurrencyLimiter, SlotAttempt},
    error::AdmissionError,
    stats::{QueueOutcome, QueueStats},
};
use crate::{
    config::QueueConfig,
    models::ApiKey,
    store::{Store, StoreKeys},
};

/// How a queue wait ended in the caller's favor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueuedSlot {
    /// A real slot was acquired.
    Acquired(u64),
    /// The store failed during the probe; the request proceeds without a
    /// held slot rather than amplifying a store outage into refusals.
    FailedOpen,
}

/// Bounded waiter for a concurrency slot.
///
/// A queue entry is an `INCR` on `concurrency:queue:{id}` with a TTL of the
/// wait deadline plus a buffer. Waiters poll the lease-set cardinality with
/// jittered exponential backoff, observe cancellation during the sleep, and
/// always decrement the counter, record a wait-time sample, and bump an
/// outcome counter on the way out -- whichever way they leave.
pub struct QueueWaiter {
    store: Arc<dyn Store>,
    stats: QueueStats,
    config: QueueConfig,
}

impl QueueWaiter {
    pub fn new(store: Arc<dyn Store>, stats: QueueStats, config: QueueConfig) -> Self {
        Self {
            store,
            stats,
            config,
        }
    }

    /// Queue bound for a key: the fixed size (floored at 3), or the dynamic
    /// `ceil(limit x multiplier)` term when a multiplier is set, whichever
    /// is larger.
    pub fn max_queue_size(key: &ApiKey) -> i64 {
        let fixed = i64::from(key.concurrent_request_queue_max_size.max(3));
        let multiplier = key.concurrent_request_queue_max_size_multiplier;
        if multiplier <= 0.0 {
            return fixed;
        }
        let dynamic = (f64::from(key.concurrent_limit) * multiplier).ceil() as i64;
        fixed.max(dynamic)
    }

    /// Wait for a slot under `key`, at most until the effective timeout.
    pub(crate) async fn wait_for_slot(
        &self,
        key: &ApiKey,
        limiter: &ConcurrencyLimiter,
        request_id: &str,
        lease_seconds: Option<u64>,
        timeout_override_ms: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<QueuedSlot, AdmissionError> {
        let timeout_ms = match timeout_override_ms {
            Some(ms) if ms > 0 => ms as u64,
            _ => key.queue_timeout_ms(self.config.default_timeout_ms),
        };
        let max_size = Self::max_queue_size(key);
        let counter_key = StoreKeys::queue_counter(&key.id);

        // Reject at the bound before entering. The read races with other
        // entrants; the bound is a backpressure valve, not an exact cap.
        let depth = match self.store.get_i64(&counter_key).await {
            Ok(depth) => depth,
            Err(error) => {
                tracing::warn!(key_id = %key.id, error = %error, "queue depth read failed");
                0
            }
        };
        if depth >= max_size {
            self.stats
                .record_outcome(&key.id, QueueOutcome::RejectedOverload)
                .await;
            return Err(AdmissionError::QueueFull {
                size: depth,
                max_size,
            });
        }

        if let Err(error) = self
            .store
            .incr_with_expiry(&counter_key, StoreKeys::queue_counter_ttl(timeout_ms))
            .await
        {
            tracing::warn!(key_id = %key.id, error = %error, "queue entry increment failed");
        }
        self.stats.record_outcome(&key.id, QueueOutcome::Entered).await;

        let start = Instant::now();
        let deadline = Duration::from_millis(timeout_ms);
        let mut poll = Duration::from_millis(self.config.initial_poll_ms);

        loop {
            if cancel.is_cancelled() {
                self.finish(&key.id, QueueOutcome::Cancelled, start).await;
                return Err(AdmissionError::ContextCancelled);
            }
            if start.elapsed() >= deadline {
                self.finish(&key.id, QueueOutcome::Timeout, start).await;
                return Err(AdmissionError::QueueTimeout {
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }

            match limiter.current(&key.id).await {
                Ok(current) if current < u64::from(key.concurrent_limit) => {
                    match limiter
                        .acquire(&key.id, request_id, key.concurrent_limit, lease_seconds)
                        .await
                    {
                        Ok(SlotAttempt::Acquired(cardinality)) => {
                            self.finish(&key.id, QueueOutcome::Success, start).await;
                            return Ok(QueuedSlot::Acquired(cardinality));
                        }
                        Ok(SlotAttempt::OverLimit(_)) => {
                            // Lost the race to another waiter; keep polling
                        }
                        Err(error) => {
                            tracing::warn!(
                                key_id = %key.id,
                                error = %error,
                                "store error during queued acquire; admitting without a slot"
                            );
                            self.finish(&key.id, QueueOutcome::Success, start).await;
                            return Ok(QueuedSlot::FailedOpen);
                        }
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(
                        key_id = %key.id,
                        error = %error,
                        "store error during queue probe; admitting without a slot"
                    );
                    self.finish(&key.id, QueueOutcome::Success, start).await;
                    return Ok(QueuedSlot::FailedOpen);
                }
            }

            // Jittered sleep, never past the deadline. Jitter de-synchronizes
            // waiters that entered in the same poll interval.
            let jitter = {
                let mut rng = rand::thread_rng();
                rng.gen_range(1.0 - self.config.jitter_ratio..=1.0 + self.config.jitter_ratio)
            };
            let sleep_for = poll
                .mul_f64(jitter)
                .min(deadline.saturating_sub(start.elapsed()));
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
            poll = poll
                .mul_f64(self.config.backoff_multiplier)
                .min(Duration::from_millis(self.config.max_poll_ms));
        }
    }

    /// Common exit path: leave the queue, record the wait, bump the outcome.
    async fn finish(&self, key_id: &str, outcome: QueueOutcome, start: Instant) {
        if let Err(error) = self
            .store
            .queue_decr(&StoreKeys::queue_counter(key_id))
            .await
        {
            tracing::warn!(key_id = %key_id, error = %error, "queue exit decrement failed");
        }
        self.stats
            .record_wait(key_id, start.elapsed().as_millis() as f64)
            .await;
        self.stats.record_outcome(key_id, outcome).await;
    }
}
