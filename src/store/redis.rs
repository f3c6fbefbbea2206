use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use redis::{
    Cmd, ConnectionInfo, IntoConnectionInfo, Pipeline, RedisFuture, Value,
    aio::{ConnectionLike, MultiplexedConnection},
    cluster::ClusterClient,
    cluster_async::ClusterConnection,
};

use super::{
    error::{StoreError, StoreResult},
    traits::{CounterOp, Store, UserMessageAcquire},
};
use crate::config::RedisStoreConfig;

/// A live connection to either a single node or a cluster.
///
/// Delegating `ConnectionLike` to whichever variant is inside lets every
/// command, script and pipeline below run against one `&mut ConnHandle`
/// without caring which topology it talks to.
enum ConnHandle {
    Single(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl ConnectionLike for ConnHandle {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            ConnHandle::Single(conn) => conn.req_packed_command(cmd),
            ConnHandle::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        pipeline: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            ConnHandle::Single(conn) => conn.req_packed_commands(pipeline, offset, count),
            ConnHandle::Cluster(conn) => conn.req_packed_commands(pipeline, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            ConnHandle::Single(conn) => conn.get_db(),
            ConnHandle::Cluster(conn) => conn.get_db(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lua Scripts
// ─────────────────────────────────────────────────────────────────────────────
//
// Every cross-process atomic step is one of these scripts. They take `now`
// from ARGV rather than calling TIME so that results are identical regardless
// of which shard or replica executes them.

/// Lease-set increment: purge expired members, add the new lease, refresh the
/// key TTL, return the cardinality.
///
/// Unconditional by design: the caller compares the returned cardinality
/// against its limit and releases on overshoot.
const LEASE_SET_INCR_SCRIPT: &str = r#"
local key = KEYS[1]
local member = ARGV[1]
local expire_at = tonumber(ARGV[2])
local ttl_ms = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now)
redis.call('ZADD', key, expire_at, member)
if ttl_ms > 0 then
    redis.call('PEXPIRE', key, ttl_ms)
end
return redis.call('ZCARD', key)
"#;

/// Lease-set decrement: remove the member, purge expired members, delete the
/// key when it empties, return the cardinality.
const LEASE_SET_DECR_SCRIPT: &str = r#"
local key = KEYS[1]
local member = ARGV[1]
local now = tonumber(ARGV[2])

redis.call('ZREM', key, member)
redis.call('ZREMRANGEBYSCORE', key, '-inf', now)
local card = redis.call('ZCARD', key)
if card <= 0 then
    redis.call('DEL', key)
    return 0
end
return card
"#;

/// Lease-set refresh: re-score the member if it is still present. Never
/// re-inserts an expired lease -- the slot may already have been handed to
/// another request.
const LEASE_SET_REFRESH_SCRIPT: &str = r#"
local key = KEYS[1]
local member = ARGV[1]
local expire_at = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now)
if redis.call('ZSCORE', key, member) then
    redis.call('ZADD', key, expire_at, member)
    if ttl_ms > 0 then
        redis.call('PEXPIRE', key, ttl_ms)
    end
    return 1
end
return 0
"#;

/// DEL iff the current value equals the caller's token.
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// PEXPIRE iff the current value equals the caller's token.
const COMPARE_AND_EXPIRE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[2]))
end
return 0
"#;

/// User-message lock acquire.
/// Returns {1, 0} on success, {0, remaining_gap_ms} when the minimum gap
/// since the previous holder has not elapsed, {0, -1} when occupied.
const USER_MESSAGE_ACQUIRE_SCRIPT: &str = r#"
local lock_key = KEYS[1]
local last_key = KEYS[2]
local request_id = ARGV[1]
local lock_ttl_ms = tonumber(ARGV[2])
local min_gap_ms = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

if redis.call('EXISTS', lock_key) == 1 then
    return {0, -1}
end
local last = redis.call('GET', last_key)
if last then
    local elapsed = now - tonumber(last)
    if elapsed < min_gap_ms then
        return {0, min_gap_ms - elapsed}
    end
end
redis.call('SET', lock_key, request_id, 'NX', 'PX', lock_ttl_ms)
return {1, 0}
"#;

/// User-message lock release. Stamps the last-completed marker (60 s expiry)
/// before deleting the lock so the next acquire observes the gap.
const USER_MESSAGE_RELEASE_SCRIPT: &str = r#"
local lock_key = KEYS[1]
local last_key = KEYS[2]
local request_id = ARGV[1]
local now = ARGV[2]

if redis.call('GET', lock_key) == request_id then
    redis.call('SET', last_key, now, 'EX', 60)
    redis.call('DEL', lock_key)
    return 1
end
return 0
"#;

/// INCR + EXPIRE in one step. Used for rate-limit window buckets and queue
/// entry counters; both key shapes are safe to re-expire on every hit.
const INCR_WITH_EXPIRY_SCRIPT: &str = r#"
local v = redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
return v
"#;

/// INCRBYFLOAT that stamps a TTL only on a fresh key. Later spend must not
/// stretch the cost window it lands in.
const FLOAT_INCR_FRESH_TTL_SCRIPT: &str = r#"
local v = redis.call('INCRBYFLOAT', KEYS[1], ARGV[1])
if tonumber(ARGV[2]) > 0 and redis.call('TTL', KEYS[1]) < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return v
"#;

/// Queue counter decrement. Deletes the key at zero and never reports a
/// negative depth.
const QUEUE_DECR_SCRIPT: &str = r#"
local v = redis.call('DECR', KEYS[1])
if v <= 0 then
    redis.call('DEL', KEYS[1])
    return 0
end
return v
"#;

/// Guarded hash write: apply the field updates only while the guard field is
/// still falsy. The single-writer step behind activation-on-first-use.
const HASH_SET_IF_FALSY_SCRIPT: &str = r#"
local key = KEYS[1]
local guard = ARGV[1]

local current = redis.call('HGET', key, guard)
if current and current ~= 'false' and current ~= '0' and current ~= '' then
    return 0
end
for i = 2, #ARGV, 2 do
    redis.call('HSET', key, ARGV[i], ARGV[i + 1])
end
return 1
"#;

/// The configured client: one node, or a cluster.
enum RedisBackend {
    Single(redis::Client),
    Cluster(ClusterClient),
}

pub struct RedisStore {
    backend: RedisBackend,
}

impl RedisStore {
    pub async fn from_config(config: &RedisStoreConfig) -> StoreResult<Self> {
        let backend = if let Some(cluster_config) = &config.cluster {
            // Cluster URLs are comma-separated host:port pairs, with or
            // without the redis:// scheme on each
            let nodes: Vec<ConnectionInfo> = config
                .url
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| {
                    let node_url = if s.starts_with("redis://") || s.starts_with("rediss://") {
                        s.to_string()
                    } else {
                        format!("redis://{}", s)
                    };
                    node_url.into_connection_info()
                })
                .collect::<Result<Vec<_>, _>>()?;

            if nodes.is_empty() {
                return Err(StoreError::Redis(redis::RedisError::from((
                    redis::ErrorKind::InvalidClientConfig,
                    "No cluster nodes specified in URL",
                ))));
            }

            let mut builder = redis::cluster::ClusterClientBuilder::new(nodes);
            if cluster_config.read_from_replicas {
                builder = builder.read_from_replicas();
            }
            builder = builder.retries(cluster_config.retries);
            builder = builder
                .connection_timeout(Duration::from_secs(cluster_config.connection_timeout_secs));
            builder =
                builder.response_timeout(Duration::from_secs(cluster_config.response_timeout_secs));

            RedisBackend::Cluster(builder.build()?)
        } else {
            RedisBackend::Single(redis::Client::open(config.url.as_str())?)
        };

        Ok(Self { backend })
    }

    async fn connect(&self) -> StoreResult<ConnHandle> {
        match &self.backend {
            RedisBackend::Single(client) => Ok(ConnHandle::Single(
                client.get_multiplexed_async_connection().await?,
            )),
            RedisBackend::Cluster(client) => {
                Ok(ConnHandle::Cluster(client.get_async_connection().await?))
            }
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.connect().await?;
        let data: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(data)
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connect().await?;
        if ttl.as_secs() > 0 {
            let _: () = redis::cmd("SETEX")
                .arg(key)
                .arg(ttl.as_secs())
                .arg(value)
                .query_async(&mut conn)
                .await?;
        } else {
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connect().await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if ttl.as_secs() > 0 {
            cmd.arg("EX").arg(ttl.as_secs());
        }
        // SET ... NX answers OK when written, nil when the key already exists
        let written: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(written.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connect().await?;
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connect().await?;
        let applied: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.connect().await?;
        let value: i64 = redis::Script::new(INCR_WITH_EXPIRY_SCRIPT)
            .key(key)
            .arg(ttl.as_secs() as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn queue_decr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connect().await?;
        let value: i64 = redis::Script::new(QUEUE_DECR_SCRIPT)
            .key(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn get_i64(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connect().await?;
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        // Counters are ASCII decimal; garbage reads as 0
        Ok(raw.and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    async fn incr_by_float(&self, key: &str, delta: f64, ttl: Duration) -> StoreResult<f64> {
        let mut conn = self.connect().await?;
        if ttl.as_secs() > 0 {
            let value: f64 = redis::Script::new(FLOAT_INCR_FRESH_TTL_SCRIPT)
                .key(key)
                .arg(delta)
                .arg(ttl.as_secs() as i64)
                .invoke_async(&mut conn)
                .await?;
            Ok(value)
        } else {
            let value: f64 = redis::cmd("INCRBYFLOAT")
                .arg(key)
                .arg(delta)
                .query_async(&mut conn)
                .await?;
            Ok(value)
        }
    }

    async fn get_f64(&self, key: &str) -> StoreResult<f64> {
        let mut conn = self.connect().await?;
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(raw.and_then(|s| s.parse().ok()).unwrap_or(0.0))
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.connect().await?;
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(map)
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect().await?;

        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _: i64 = cmd.query_async(&mut conn).await?;

        if ttl.as_secs() > 0 {
            let _: () = redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl.as_secs())
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connect().await?;
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.connect().await?;
        let _: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hash_del(&self, key: &str, field: &str) -> StoreResult<()> {
        let mut conn = self.connect().await?;
        let _: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hash_swap_field(
        &self,
        key: &str,
        old_field: &str,
        new_field: &str,
        value: &str,
    ) -> StoreResult<()> {
        let mut conn = self.connect().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HDEL")
            .arg(key)
            .arg(old_field)
            .ignore()
            .cmd("HSET")
            .arg(key)
            .arg(new_field)
            .arg(value)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn hash_set_if_falsy(
        &self,
        key: &str,
        guard_field: &str,
        fields: &[(String, String)],
    ) -> StoreResult<bool> {
        let mut conn = self.connect().await?;
        let script = redis::Script::new(HASH_SET_IF_FALSY_SCRIPT);
        let mut invocation = script.key(key);
        invocation.arg(guard_field);
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    async fn lease_set_incr(
        &self,
        key: &str,
        member: &str,
        expire_at_ms: i64,
        ttl_ms: i64,
        now_ms: i64,
    ) -> StoreResult<u64> {
        let mut conn = self.connect().await?;
        let card: i64 = redis::Script::new(LEASE_SET_INCR_SCRIPT)
            .key(key)
            .arg(member)
            .arg(expire_at_ms)
            .arg(ttl_ms)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(card.max(0) as u64)
    }

    async fn lease_set_decr(&self, key: &str, member: &str, now_ms: i64) -> StoreResult<u64> {
        let mut conn = self.connect().await?;
        let card: i64 = redis::Script::new(LEASE_SET_DECR_SCRIPT)
            .key(key)
            .arg(member)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(card.max(0) as u64)
    }

    async fn lease_set_refresh(
        &self,
        key: &str,
        member: &str,
        expire_at_ms: i64,
        now_ms: i64,
        ttl_ms: i64,
    ) -> StoreResult<bool> {
        let mut conn = self.connect().await?;
        let refreshed: i64 = redis::Script::new(LEASE_SET_REFRESH_SCRIPT)
            .key(key)
            .arg(member)
            .arg(expire_at_ms)
            .arg(now_ms)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    async fn lease_set_count(&self, key: &str, now_ms: i64) -> StoreResult<u64> {
        let mut conn = self.connect().await?;
        // Members scored <= now are already free; count only live leases.
        let count: i64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(format!("({}", now_ms))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> StoreResult<bool> {
        let mut conn = self.connect().await?;
        let deleted: i64 = redis::Script::new(COMPARE_AND_DELETE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(&self, key: &str, token: &str, ttl_ms: i64) -> StoreResult<bool> {
        let mut conn = self.connect().await?;
        let applied: i64 = redis::Script::new(COMPARE_AND_EXPIRE_SCRIPT)
            .key(key)
            .arg(token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn user_message_acquire(
        &self,
        lock_key: &str,
        last_key: &str,
        request_id: &str,
        lock_ttl_ms: i64,
        min_gap_ms: i64,
        now_ms: i64,
    ) -> StoreResult<UserMessageAcquire> {
        let mut conn = self.connect().await?;
        let result: Vec<i64> = redis::Script::new(USER_MESSAGE_ACQUIRE_SCRIPT)
            .key(lock_key)
            .key(last_key)
            .arg(request_id)
            .arg(lock_ttl_ms)
            .arg(min_gap_ms)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;

        let acquired = result.first().copied().unwrap_or(0) == 1;
        let remaining = result.get(1).copied().unwrap_or(-1);
        Ok(match (acquired, remaining) {
            (true, _) => UserMessageAcquire::Acquired,
            (false, -1) => UserMessageAcquire::Occupied,
            (false, remaining_ms) => UserMessageAcquire::Cooldown {
                remaining_ms: remaining_ms.max(0),
            },
        })
    }

    async fn user_message_release(
        &self,
        lock_key: &str,
        last_key: &str,
        request_id: &str,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let mut conn = self.connect().await?;
        let released: i64 = redis::Script::new(USER_MESSAGE_RELEASE_SCRIPT)
            .key(lock_key)
            .key(last_key)
            .arg(request_id)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn list_push_capped(
        &self,
        key: &str,
        value: f64,
        cap: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut conn = self.connect().await?;
        let mut pipe = redis::pipe();
        pipe.cmd("LPUSH").arg(key).arg(value).ignore();
        pipe.cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(cap.saturating_sub(1) as i64)
            .ignore();
        if ttl.as_secs() > 0 {
            pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs()).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn list_values(&self, key: &str) -> StoreResult<Vec<f64>> {
        let mut conn = self.connect().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(raw.iter().filter_map(|s| s.parse().ok()).collect())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connect().await?;
        let pattern = format!("{}*", prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn apply_counters(&self, ops: &[CounterOp]) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect().await?;

        let mut pipe = redis::pipe();
        for op in ops {
            match op {
                CounterOp::HashIncrBy { key, field, delta } => {
                    pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta).ignore();
                }
                CounterOp::HashIncrByFloat { key, field, delta } => {
                    pipe.cmd("HINCRBYFLOAT")
                        .arg(key)
                        .arg(field)
                        .arg(*delta)
                        .ignore();
                }
                CounterOp::IncrByFloat { key, delta } => {
                    pipe.cmd("INCRBYFLOAT").arg(key).arg(*delta).ignore();
                }
                CounterOp::Expire { key, ttl } => {
                    if ttl.as_secs() > 0 {
                        pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs()).ignore();
                    }
                }
            }
        }

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connect().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
