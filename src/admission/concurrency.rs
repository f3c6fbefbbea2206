use std::sync::Arc;

use chrono::Utc;

use crate::store::{Store, StoreKeys, StoreResult};

/// Leases shorter than this are clamped up: a lease must outlive the fastest
/// plausible upstream turnaround or slots thrash.
const MIN_LEASE_SECONDS: u64 = 30;
/// Default lease when the caller supplies none.
pub(crate) const DEFAULT_LEASE_SECONDS: u64 = 300;
/// Grace added to the key TTL past the lease deadline, covering the release
/// that never arrives when a forwarder crashes.
const CLEANUP_GRACE_SECONDS: u64 = 60;
/// Floor for the key TTL.
const MIN_TTL_MS: i64 = 60_000;

/// Outcome of a slot acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAttempt {
    /// Slot held; cardinality after the acquire.
    Acquired(u64),
    /// The acquire pushed the set past the limit and was rolled back;
    /// cardinality as observed at the acquire.
    OverLimit(u64),
}

/// Concurrency slots as lease sets.
///
/// A slot is a `(request_id, deadline)` member of `concurrency:{id}`. The
/// increment script is unconditional, so an over-limit acquire is detected by
/// comparing the returned cardinality and immediately released; the
/// compare-then-release pair keeps property "no instant exceeds the limit"
/// for every observer that reads cardinality the same way.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    store: Arc<dyn Store>,
}

impl ConcurrencyLimiter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Try to take a slot under `holder_id` (an API key or upstream account
    /// id) for `request_id`.
    pub async fn acquire(
        &self,
        holder_id: &str,
        request_id: &str,
        limit: u32,
        lease_seconds: Option<u64>,
    ) -> StoreResult<SlotAttempt> {
        let lease = effective_lease_seconds(lease_seconds);
        let ttl_ms = lease_ttl_ms(lease);
        let now_ms = Utc::now().timestamp_millis();
        let key = StoreKeys::concurrency(holder_id);

        let cardinality = self
            .store
            .lease_set_incr(
                &key,
                request_id,
                now_ms + (lease as i64) * 1000,
                ttl_ms,
                now_ms,
            )
            .await?;

        if cardinality > u64::from(limit) {
            // Undo the optimistic insert. A failure here leaves an expired-at
            // lease that the next acquire purges.
            if let Err(error) = self.store.lease_set_decr(&key, request_id, now_ms).await {
                tracing::warn!(
                    holder_id = %holder_id,
                    request_id = %request_id,
                    error = %error,
                    "failed to roll back over-limit concurrency acquire"
                );
            }
            return Ok(SlotAttempt::OverLimit(cardinality));
        }
        Ok(SlotAttempt::Acquired(cardinality))
    }

    /// Release the slot held by `request_id`. Safe to call when no slot is
    /// held.
    pub async fn release(&self, holder_id: &str, request_id: &str) -> StoreResult<u64> {
        let now_ms = Utc::now().timestamp_millis();
        self.store
            .lease_set_decr(&StoreKeys::concurrency(holder_id), request_id, now_ms)
            .await
    }

    /// Extend a held lease for a long-running stream. Returns false when the
    /// lease already expired (the slot may have been re-issued).
    pub async fn refresh(
        &self,
        holder_id: &str,
        request_id: &str,
        lease_seconds: Option<u64>,
    ) -> StoreResult<bool> {
        let lease = effective_lease_seconds(lease_seconds);
        let now_ms = Utc::now().timestamp_millis();
        self.store
            .lease_set_refresh(
                &StoreKeys::concurrency(holder_id),
                request_id,
                now_ms + (lease as i64) * 1000,
                now_ms,
                lease_ttl_ms(lease),
            )
            .await
    }

    /// Live slot count for a holder.
    pub async fn current(&self, holder_id: &str) -> StoreResult<u64> {
        let now_ms = Utc::now().timestamp_millis();
        self.store
            .lease_set_count(&StoreKeys::concurrency(holder_id), now_ms)
            .await
    }
}

fn effective_lease_seconds(lease_seconds: Option<u64>) -> u64 {
    lease_seconds
        .unwrap_or(DEFAULT_LEASE_SECONDS)
        .max(MIN_LEASE_SECONDS)
}

fn lease_ttl_ms(lease_seconds: u64) -> i64 {
    (((lease_seconds + CLEANUP_GRACE_SECONDS) * 1000) as i64).max(MIN_TTL_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter() -> ConcurrencyLimiter {
        ConcurrencyLimiter::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_lease_clamping() {
        assert_eq!(effective_lease_seconds(None), 300);
        assert_eq!(effective_lease_seconds(Some(5)), 30);
        assert_eq!(effective_lease_seconds(Some(600)), 600);
    }

    #[test]
    fn test_ttl_floor() {
        // 30s lease + 60s grace = 90s, above the floor
        assert_eq!(lease_ttl_ms(30), 90_000);
        assert_eq!(lease_ttl_ms(300), 360_000);
    }

    #[tokio::test]
    async fn test_acquire_within_limit() {
        let limiter = limiter();
        let attempt = limiter.acquire("k1", "r1", 2, None).await.unwrap();
        assert_eq!(attempt, SlotAttempt::Acquired(1));
        let attempt = limiter.acquire("k1", "r2", 2, None).await.unwrap();
        assert_eq!(attempt, SlotAttempt::Acquired(2));
        assert_eq!(limiter.current("k1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_over_limit_acquire_rolls_back() {
        let limiter = limiter();
        limiter.acquire("k1", "r1", 1, None).await.unwrap();

        let attempt = limiter.acquire("k1", "r2", 1, None).await.unwrap();
        assert_eq!(attempt, SlotAttempt::OverLimit(2));

        // The rollback leaves exactly the original holder
        assert_eq!(limiter.current("k1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_frees_slot() {
        let limiter = limiter();
        limiter.acquire("k1", "r1", 1, None).await.unwrap();
        limiter.release("k1", "r1").await.unwrap();
        assert_eq!(limiter.current("k1").await.unwrap(), 0);

        let attempt = limiter.acquire("k1", "r2", 1, None).await.unwrap();
        assert_eq!(attempt, SlotAttempt::Acquired(1));
    }

    #[tokio::test]
    async fn test_release_without_slot_is_noop() {
        let limiter = limiter();
        assert_eq!(limiter.release("k1", "ghost").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refresh_only_live_leases() {
        let limiter = limiter();
        limiter.acquire("k1", "r1", 1, None).await.unwrap();
        assert!(limiter.refresh("k1", "r1", None).await.unwrap());
        assert!(!limiter.refresh("k1", "never-acquired", None).await.unwrap());
    }
}
