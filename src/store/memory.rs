use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{
    error::StoreResult,
    traits::{CounterOp, Store, UserMessageAcquire},
};

/// A stored value with optional wall-clock expiry.
struct ValueEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data,
            expires_at: expiry(ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

struct HashEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl HashEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

struct CounterEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

struct FloatEntry {
    value: f64,
    expires_at: Option<Instant>,
}

impl FloatEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

struct ListEntry {
    items: VecDeque<f64>,
    expires_at: Option<Instant>,
}

impl ListEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

fn expiry(ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Some(Instant::now() + ttl)
    }
}

fn is_falsy(value: Option<&String>) -> bool {
    match value {
        None => true,
        Some(v) => v.is_empty() || v == "false" || v == "0",
    }
}

/// In-memory store implementation using DashMap for concurrent access.
///
/// # Multi-Node Deployments
///
/// **WARNING**: This store is NOT suitable for multi-node deployments.
/// Admission state (rate windows, leases, queue counters) is per-process, so
/// limits are enforced per node rather than globally. Use the Redis store in
/// production; this backend exists for single-node setups and for the test
/// suite.
///
/// Lease sets keep the member-to-deadline map under the entry lock, so each
/// operation observes the same one-key atomicity the Lua scripts provide.
/// The user-message pair spans two keys and is serialized by a dedicated
/// mutex instead.
#[derive(Default)]
pub struct MemoryStore {
    values: DashMap<String, ValueEntry>,
    hashes: DashMap<String, HashEntry>,
    counters: DashMap<String, CounterEntry>,
    floats: DashMap<String, FloatEntry>,
    lease_sets: DashMap<String, BTreeMap<String, i64>>,
    lists: DashMap<String, ListEntry>,
    user_message_mutex: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(entry) = self.values.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.values.remove(key);
                return None;
            }
            return Some(entry.data.clone());
        }
        None
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.live_value(key))
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.values
            .insert(key.to_string(), ValueEntry::new(value.to_vec(), ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        use dashmap::mapref::entry::Entry;
        match self.values.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_expired() {
                    e.insert(ValueEntry::new(value.to_vec(), ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(e) => {
                e.insert(ValueEntry::new(value.to_vec(), ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.values.remove(key);
        self.hashes.remove(key);
        self.counters.remove(key);
        self.floats.remove(key);
        self.lease_sets.remove(key);
        self.lists.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        if let Some(mut entry) = self.values.get_mut(key) {
            entry.expires_at = expiry(ttl);
            return Ok(true);
        }
        if let Some(mut entry) = self.hashes.get_mut(key) {
            entry.expires_at = expiry(ttl);
            return Ok(true);
        }
        if let Some(mut entry) = self.counters.get_mut(key) {
            entry.expires_at = expiry(ttl);
            return Ok(true);
        }
        if let Some(mut entry) = self.floats.get_mut(key) {
            entry.expires_at = expiry(ttl);
            return Ok(true);
        }
        if let Some(mut entry) = self.lists.get_mut(key) {
            entry.expires_at = expiry(ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        use dashmap::mapref::entry::Entry;
        match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_expired() {
                    e.insert(CounterEntry {
                        value: 1,
                        expires_at: expiry(ttl),
                    });
                    Ok(1)
                } else {
                    let entry = e.get_mut();
                    entry.value += 1;
                    entry.expires_at = expiry(ttl);
                    Ok(entry.value)
                }
            }
            Entry::Vacant(e) => {
                e.insert(CounterEntry {
                    value: 1,
                    expires_at: expiry(ttl),
                });
                Ok(1)
            }
        }
    }

    async fn queue_decr(&self, key: &str) -> StoreResult<i64> {
        use dashmap::mapref::entry::Entry;
        match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let next = if e.get().is_expired() {
                    -1
                } else {
                    e.get().value - 1
                };
                if next <= 0 {
                    e.remove();
                    Ok(0)
                } else {
                    e.get_mut().value = next;
                    Ok(next)
                }
            }
            Entry::Vacant(_) => Ok(0),
        }
    }

    async fn get_i64(&self, key: &str) -> StoreResult<i64> {
        if let Some(entry) = self.counters.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.counters.remove(key);
                return Ok(0);
            }
            return Ok(entry.value);
        }
        Ok(0)
    }

    async fn incr_by_float(&self, key: &str, delta: f64, ttl: Duration) -> StoreResult<f64> {
        use dashmap::mapref::entry::Entry;
        match self.floats.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_expired() {
                    e.insert(FloatEntry {
                        value: delta,
                        expires_at: expiry(ttl),
                    });
                    Ok(delta)
                } else {
                    let entry = e.get_mut();
                    entry.value += delta;
                    Ok(entry.value)
                }
            }
            Entry::Vacant(e) => {
                e.insert(FloatEntry {
                    value: delta,
                    expires_at: expiry(ttl),
                });
                Ok(delta)
            }
        }
    }

    async fn get_f64(&self, key: &str) -> StoreResult<f64> {
        if let Some(entry) = self.floats.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.floats.remove(key);
                return Ok(0.0);
            }
            return Ok(entry.value);
        }
        Ok(0.0)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        if let Some(entry) = self.hashes.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.hashes.remove(key);
                return Ok(HashMap::new());
            }
            return Ok(entry.fields.clone());
        }
        Ok(HashMap::new())
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> StoreResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.hashes.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                if entry.is_expired() {
                    entry.fields.clear();
                    entry.expires_at = None;
                }
                for (field, value) in fields {
                    entry.fields.insert(field.clone(), value.clone());
                }
                if !ttl.is_zero() {
                    entry.expires_at = expiry(ttl);
                }
            }
            Entry::Vacant(e) => {
                let mut map = HashMap::new();
                for (field, value) in fields {
                    map.insert(field.clone(), value.clone());
                }
                e.insert(HashEntry {
                    fields: map,
                    expires_at: expiry(ttl),
                });
            }
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        if let Some(entry) = self.hashes.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.hashes.remove(key);
                return Ok(None);
            }
            return Ok(entry.fields.get(field).cloned());
        }
        Ok(None)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.hash_set_all(key, &[(field.to_string(), value.to_string())], Duration::ZERO)
            .await
    }

    async fn hash_del(&self, key: &str, field: &str) -> StoreResult<()> {
        if let Some(mut entry) = self.hashes.get_mut(key) {
            entry.fields.remove(field);
        }
        Ok(())
    }

    async fn hash_swap_field(
        &self,
        key: &str,
        old_field: &str,
        new_field: &str,
        value: &str,
    ) -> StoreResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.hashes.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                entry.fields.remove(old_field);
                entry.fields.insert(new_field.to_string(), value.to_string());
            }
            Entry::Vacant(e) => {
                let mut map = HashMap::new();
                map.insert(new_field.to_string(), value.to_string());
                e.insert(HashEntry {
                    fields: map,
                    expires_at: None,
                });
            }
        }
        Ok(())
    }

    async fn hash_set_if_falsy(
        &self,
        key: &str,
        guard_field: &str,
        fields: &[(String, String)],
    ) -> StoreResult<bool> {
        use dashmap::mapref::entry::Entry;
        match self.hashes.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                if entry.is_expired() {
                    entry.fields.clear();
                    entry.expires_at = None;
                }
                if !is_falsy(entry.fields.get(guard_field)) {
                    return Ok(false);
                }
                for (field, value) in fields {
                    entry.fields.insert(field.clone(), value.clone());
                }
                Ok(true)
            }
            Entry::Vacant(e) => {
                let mut map = HashMap::new();
                for (field, value) in fields {
                    map.insert(field.clone(), value.clone());
                }
                e.insert(HashEntry {
                    fields: map,
                    expires_at: None,
                });
                Ok(true)
            }
        }
    }

    async fn lease_set_incr(
        &self,
        key: &str,
        member: &str,
        expire_at_ms: i64,
        _ttl_ms: i64,
        now_ms: i64,
    ) -> StoreResult<u64> {
        let mut set = self.lease_sets.entry(key.to_string()).or_default();
        set.retain(|_, deadline| *deadline > now_ms);
        set.insert(member.to_string(), expire_at_ms);
        Ok(set.len() as u64)
    }

    async fn lease_set_decr(&self, key: &str, member: &str, now_ms: i64) -> StoreResult<u64> {
        use dashmap::mapref::entry::Entry;
        match self.lease_sets.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let set = e.get_mut();
                set.remove(member);
                set.retain(|_, deadline| *deadline > now_ms);
                if set.is_empty() {
                    e.remove();
                    Ok(0)
                } else {
                    Ok(e.get().len() as u64)
                }
            }
            Entry::Vacant(_) => Ok(0),
        }
    }

    async fn lease_set_refresh(
        &self,
        key: &str,
        member: &str,
        expire_at_ms: i64,
        now_ms: i64,
        _ttl_ms: i64,
    ) -> StoreResult<bool> {
        if let Some(mut set) = self.lease_sets.get_mut(key) {
            set.retain(|_, deadline| *deadline > now_ms);
            if set.contains_key(member) {
                set.insert(member.to_string(), expire_at_ms);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn lease_set_count(&self, key: &str, now_ms: i64) -> StoreResult<u64> {
        if let Some(set) = self.lease_sets.get(key) {
            return Ok(set.values().filter(|deadline| **deadline > now_ms).count() as u64);
        }
        Ok(0)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> StoreResult<bool> {
        use dashmap::mapref::entry::Entry;
        match self.values.entry(key.to_string()) {
            Entry::Occupied(e) => {
                if !e.get().is_expired() && e.get().data == token.as_bytes() {
                    e.remove();
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn compare_and_expire(&self, key: &str, token: &str, ttl_ms: i64) -> StoreResult<bool> {
        if let Some(mut entry) = self.values.get_mut(key)
            && !entry.is_expired()
            && entry.data == token.as_bytes()
        {
            entry.expires_at = Some(Instant::now() + Duration::from_millis(ttl_ms.max(0) as u64));
            return Ok(true);
        }
        Ok(false)
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
        // The pair spans two keys; serialize the whole check-then-set.
        let _guard = self.user_message_mutex.lock().expect("mutex poisoned");

        if self.live_value(lock_key).is_some() {
            return Ok(UserMessageAcquire::Occupied);
        }
        if let Some(last) = self.live_value(last_key)
            && let Ok(last_ms) = String::from_utf8_lossy(&last).parse::<i64>()
        {
            let elapsed = now_ms - last_ms;
            if elapsed < min_gap_ms {
                return Ok(UserMessageAcquire::Cooldown {
                    remaining_ms: min_gap_ms - elapsed,
                });
            }
        }
        self.values.insert(
            lock_key.to_string(),
            ValueEntry::new(
                request_id.as_bytes().to_vec(),
                Duration::from_millis(lock_ttl_ms.max(0) as u64),
            ),
        );
        Ok(UserMessageAcquire::Acquired)
    }

    async fn user_message_release(
        &self,
        lock_key: &str,
        last_key: &str,
        request_id: &str,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let _guard = self.user_message_mutex.lock().expect("mutex poisoned");

        match self.live_value(lock_key) {
            Some(holder) if holder == request_id.as_bytes() => {
                self.values.insert(
                    last_key.to_string(),
                    ValueEntry::new(now_ms.to_string().into_bytes(), Duration::from_secs(60)),
                );
                self.values.remove(lock_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_push_capped(
        &self,
        key: &str,
        value: f64,
        cap: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.lists.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_expired() {
                    e.get_mut().items.clear();
                }
                let entry = e.get_mut();
                entry.items.push_front(value);
                entry.items.truncate(cap);
                entry.expires_at = expiry(ttl);
            }
            Entry::Vacant(e) => {
                let mut items = VecDeque::new();
                items.push_front(value);
                e.insert(ListEntry {
                    items,
                    expires_at: expiry(ttl),
                });
            }
        }
        Ok(())
    }

    async fn list_values(&self, key: &str) -> StoreResult<Vec<f64>> {
        if let Some(entry) = self.lists.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.lists.remove(key);
                return Ok(Vec::new());
            }
            return Ok(entry.items.iter().copied().collect());
        }
        Ok(Vec::new())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = Vec::new();
        for entry in self.values.iter() {
            if entry.key().starts_with(prefix) && !entry.is_expired() {
                keys.push(entry.key().clone());
            }
        }
        for entry in self.hashes.iter() {
            if entry.key().starts_with(prefix) && !entry.is_expired() {
                keys.push(entry.key().clone());
            }
        }
        Ok(keys)
    }

    async fn apply_counters(&self, ops: &[CounterOp]) -> StoreResult<()> {
        for op in ops {
            match op {
                CounterOp::HashIncrBy { key, field, delta } => {
                    let mut entry =
                        self.hashes
                            .entry(key.clone())
                            .or_insert_with(|| HashEntry {
                                fields: HashMap::new(),
                                expires_at: None,
                            });
                    if entry.is_expired() {
                        entry.fields.clear();
                        entry.expires_at = None;
                    }
                    let slot = entry.fields.entry(field.clone()).or_insert_with(|| "0".into());
                    let current: i64 = slot.parse().unwrap_or(0);
                    *slot = (current + delta).to_string();
                }
                CounterOp::HashIncrByFloat { key, field, delta } => {
                    let mut entry =
                        self.hashes
                            .entry(key.clone())
                            .or_insert_with(|| HashEntry {
                                fields: HashMap::new(),
                                expires_at: None,
                            });
                    if entry.is_expired() {
                        entry.fields.clear();
                        entry.expires_at = None;
                    }
                    let slot = entry.fields.entry(field.clone()).or_insert_with(|| "0".into());
                    let current: f64 = slot.parse().unwrap_or(0.0);
                    *slot = (current + delta).to_string();
                }
                CounterOp::IncrByFloat { key, delta } => {
                    self.incr_by_float(key, *delta, Duration::ZERO).await?;
                }
                CounterOp::Expire { key, ttl } => {
                    if !ttl.is_zero() {
                        self.expire(key, *ttl).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
