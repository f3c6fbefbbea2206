use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;

use super::error::StoreResult;

/// One write in a pipelined counter fan-out.
///
/// A usage event expands into a few dozen of these; the Redis backend issues
/// them as a single pipeline so an observer on a single-shard store never
/// sees a partially applied event.
#[derive(Debug, Clone)]
pub enum CounterOp {
    /// HINCRBY on a hash field.
    HashIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    /// HINCRBYFLOAT on a hash field.
    HashIncrByFloat {
        key: String,
        field: String,
        delta: f64,
    },
    /// INCRBYFLOAT on a plain scalar.
    IncrByFloat { key: String, delta: f64 },
    /// EXPIRE on a key. Zero duration is a no-op.
    Expire { key: String, ttl: Duration },
}

/// Outcome of a user-message lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserMessageAcquire {
    /// Lock taken; the caller may forward its conversation turn.
    Acquired,
    /// Lock free but the minimum gap since the previous holder has not
    /// elapsed yet.
    Cooldown { remaining_ms: i64 },
    /// Another request currently holds the lock.
    Occupied,
}

/// Coordination surface over a Redis-compatible store.
///
/// Every cross-process atomic step (lease sets, token locks, queue counters,
/// the user-message pair) is a single server-side script; plain reads and
/// pipelined counter writes round it out. Implementations must treat `now_ms`
/// arguments as the authoritative clock and never consult the server's own
/// time, so behavior is identical across sharded deployments.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Plain values
    // ─────────────────────────────────────────────────────────────────────────

    /// Get raw bytes. Missing key returns `None`.
    async fn get_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Set raw bytes. Zero TTL means no expiry.
    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Atomic set-if-not-exists. Returns true if the value was written.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// Delete a key (any type).
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Set or refresh a TTL. Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Counters
    // ─────────────────────────────────────────────────────────────────────────

    /// INCR + EXPIRE, atomically. Returns the new value.
    ///
    /// Used for rate-limit window buckets and queue entry. Callers never
    /// retry a failed increment: a retry after an applied-but-unacked INCR
    /// would double-charge the window.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    /// DECR, deleting the key when it reaches zero. Never returns a negative
    /// value.
    async fn queue_decr(&self, key: &str) -> StoreResult<i64>;

    /// Read an integer counter. Missing or unparseable values read as 0.
    async fn get_i64(&self, key: &str) -> StoreResult<i64>;

    /// INCRBYFLOAT with an optional TTL set on first write. Returns the new
    /// value.
    async fn incr_by_float(&self, key: &str, delta: f64, ttl: Duration) -> StoreResult<f64>;

    /// Read a float scalar. Missing or unparseable values read as 0.0.
    async fn get_f64(&self, key: &str) -> StoreResult<f64>;

    // ─────────────────────────────────────────────────────────────────────────
    // Hashes
    // ─────────────────────────────────────────────────────────────────────────

    /// HGETALL. Missing key returns an empty map.
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// HSET of every field, then EXPIRE when `ttl` is non-zero.
    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> StoreResult<()>;

    /// HGET a single field.
    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// HSET a single field.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// HDEL a single field.
    async fn hash_del(&self, key: &str, field: &str) -> StoreResult<()>;

    /// HDEL `old_field` and HSET `new_field = value` in one transaction.
    /// Used to move a secondary-index entry when the indexed value changes.
    async fn hash_swap_field(
        &self,
        key: &str,
        old_field: &str,
        new_field: &str,
        value: &str,
    ) -> StoreResult<()>;

    /// Set `fields` on a hash iff `guard_field` is currently absent, empty,
    /// `"false"` or `"0"`. Returns true when the write happened.
    ///
    /// This is the single-writer step behind activation-on-first-use.
    async fn hash_set_if_falsy(
        &self,
        key: &str,
        guard_field: &str,
        fields: &[(String, String)],
    ) -> StoreResult<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Lease sets
    // ─────────────────────────────────────────────────────────────────────────

    /// Purge members with deadline ≤ `now_ms`, add `(member, expire_at_ms)`,
    /// refresh the key TTL when `ttl_ms > 0`, and return the new cardinality.
    /// Unconditional: the caller compares the returned cardinality against
    /// its limit and releases on overshoot.
    async fn lease_set_incr(
        &self,
        key: &str,
        member: &str,
        expire_at_ms: i64,
        ttl_ms: i64,
        now_ms: i64,
    ) -> StoreResult<u64>;

    /// Remove `member`, purge expired members, delete the key when it
    /// empties, and return the new cardinality.
    async fn lease_set_decr(&self, key: &str, member: &str, now_ms: i64) -> StoreResult<u64>;

    /// Re-score `member` if it is still present, refreshing the key TTL.
    /// Returns false (without re-inserting) when the lease already expired.
    async fn lease_set_refresh(
        &self,
        key: &str,
        member: &str,
        expire_at_ms: i64,
        now_ms: i64,
        ttl_ms: i64,
    ) -> StoreResult<bool>;

    /// Count members with deadline > `now_ms`. Read-only: expired members
    /// are skipped, not removed.
    async fn lease_set_count(&self, key: &str, now_ms: i64) -> StoreResult<u64>;

    // ─────────────────────────────────────────────────────────────────────────
    // Token locks
    // ─────────────────────────────────────────────────────────────────────────

    /// DEL iff the current value equals `token`. Returns true when deleted.
    async fn compare_and_delete(&self, key: &str, token: &str) -> StoreResult<bool>;

    /// PEXPIRE iff the current value equals `token`. Returns true when applied.
    async fn compare_and_expire(&self, key: &str, token: &str, ttl_ms: i64) -> StoreResult<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // User-message serialization lock
    // ─────────────────────────────────────────────────────────────────────────

    /// Try to take the per-account user-message lock. The lock is granted
    /// only when it is free and at least `min_gap_ms` has elapsed since the
    /// previous holder released (per the `last_key` marker).
    async fn user_message_acquire(
        &self,
        lock_key: &str,
        last_key: &str,
        request_id: &str,
        lock_ttl_ms: i64,
        min_gap_ms: i64,
        now_ms: i64,
    ) -> StoreResult<UserMessageAcquire>;

    /// Release the lock if `request_id` still holds it, stamping the
    /// last-completed marker. Returns false when the lock was not held by
    /// this request (expired or stolen).
    async fn user_message_release(
        &self,
        lock_key: &str,
        last_key: &str,
        request_id: &str,
        now_ms: i64,
    ) -> StoreResult<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Capped lists
    // ─────────────────────────────────────────────────────────────────────────

    /// LPUSH + LTRIM to `cap` + EXPIRE, pipelined. Used for wait-time
    /// sample ring buffers.
    async fn list_push_capped(
        &self,
        key: &str,
        value: f64,
        cap: usize,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Full list contents as floats. Unparseable entries are skipped.
    async fn list_values(&self, key: &str) -> StoreResult<Vec<f64>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Scans and batches
    // ─────────────────────────────────────────────────────────────────────────

    /// All keys with the given prefix. Backed by cursor SCAN; not supported
    /// across cluster shards.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Apply a counter fan-out as one pipeline.
    async fn apply_counters(&self, ops: &[CounterOp]) -> StoreResult<()>;

    /// Liveness probe.
    async fn ping(&self) -> StoreResult<()>;
}

// Helper extension trait for JSON records
pub trait StoreExt: Store {
    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        use super::error::StoreError;
        match self.get_bytes(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set_json<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> StoreResult<()> {
        use super::error::StoreError;
        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.set_bytes(key, &bytes, ttl).await
    }
}

// Blanket implementation for all Store types
impl<T: Store + ?Sized> StoreExt for T {}
