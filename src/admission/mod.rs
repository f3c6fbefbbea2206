//! The admission engine.
//!
//! Every incoming request passes a fixed gate sequence before it may be
//! scheduled upstream: key format -> existence -> activation state ->
//! expiry -> permission -> client allow-list -> model blacklist -> rate
//! windows -> cost gates -> concurrency. Earlier failures short-circuit.
//!
//! Failure bias: a flaky store must not turn into a full outage. Read gates
//! fail open (admit and log); only the existence lookup itself surfaces a
//! store error to the caller. Write paths log and continue.

mod concurrency;
mod error;
mod queue;
mod stats;
mod user_message;

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

pub use concurrency::{ConcurrencyLimiter, SlotAttempt};
pub use error::AdmissionError;
pub use queue::QueueWaiter;
pub use stats::{QueueOutcome, QueueStats, QueueStatsSnapshot, WaitTimeSummary, percentile};
pub use user_message::UserMessageSerializer;

use self::queue::QueuedSlot;
use crate::{
    accounts::ApiKeyStore,
    config::AdmissionConfig,
    models::{ApiKey, Permission, hash_raw_key, is_opus_model, next_midnight,
        next_monday_midnight, time_buckets},
    observability::metrics,
    store::{Store, StoreKeys},
};

/// Request-count window granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    PerMinute,
    PerHour,
}

impl RateWindow {
    pub fn window_name(&self) -> &'static str {
        match self {
            RateWindow::PerMinute => "minute",
            RateWindow::PerHour => "hour",
        }
    }

    pub fn secs(&self) -> i64 {
        match self {
            RateWindow::PerMinute => 60,
            RateWindow::PerHour => 3600,
        }
    }
}

impl fmt::Display for RateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.window_name())
    }
}

/// What the transport layer knows about a request at admission time.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    /// Provider permission the request needs, when the route implies one.
    pub required_permission: Option<Permission>,
    /// Client identifier matched against the key's allow-list.
    pub client_type: Option<String>,
    /// Requested model, for the blacklist and the weekly Opus gate.
    pub model: Option<String>,
    /// Session fingerprint, passed through to the scheduler for stickiness.
    pub session_hash: Option<String>,
    /// Concurrency lease override in seconds; clamped to at least 30.
    pub concurrency_lease_seconds: Option<u64>,
    /// Queue wait deadline override; non-positive values are ignored.
    pub queue_timeout_override_ms: Option<i64>,
    /// Set by free-tier read-only endpoints to bypass the cost gates.
    pub skip_cost_gates: bool,
}

/// A granted admission. When `holds_concurrency_slot` is set the caller owns
/// a lease under its request id and must release it when the request
/// finishes.
#[derive(Debug, Clone)]
pub struct Admission {
    pub api_key: ApiKey,
    pub holds_concurrency_slot: bool,
}

/// The admission engine. Stateless besides its store handle: any number of
/// control-plane instances can run the same gates against the same store.
pub struct AdmissionEngine {
    store: Arc<dyn Store>,
    api_keys: ApiKeyStore,
    limiter: ConcurrencyLimiter,
    queue: QueueWaiter,
    stats: QueueStats,
    config: AdmissionConfig,
}

impl AdmissionEngine {
    pub fn new(store: Arc<dyn Store>, config: AdmissionConfig) -> Self {
        let stats = QueueStats::new(Arc::clone(&store), &config.queue);
        Self {
            api_keys: ApiKeyStore::new(Arc::clone(&store)),
            limiter: ConcurrencyLimiter::new(Arc::clone(&store)),
            queue: QueueWaiter::new(Arc::clone(&store), stats.clone(), config.queue.clone()),
            stats,
            store,
            config,
        }
    }

    /// Run the full gate sequence for one request.
    pub async fn admit(
        &self,
        raw_key: &str,
        request_id: &str,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Admission, AdmissionError> {
        let result = self.admit_inner(raw_key, request_id, descriptor, cancel).await;
        match &result {
            Ok(_) => metrics::record_admission("granted"),
            Err(error) => metrics::record_admission(error.kind()),
        }
        result
    }

    async fn admit_inner(
        &self,
        raw_key: &str,
        request_id: &str,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Admission, AdmissionError> {
        let now = Utc::now();

        // 1. Format
        if !raw_key.starts_with(&self.config.api_key_prefix) {
            return Err(AdmissionError::InvalidFormat);
        }

        // 2. Existence. The only gate where a store failure surfaces: with
        // no key record there is nothing to fail open with.
        let hashed = hash_raw_key(raw_key);
        let mut api_key = self
            .api_keys
            .find_by_hash(&hashed)
            .await?
            .ok_or(AdmissionError::NotFound)?;

        // 3. Activation state
        if !api_key.is_active {
            return Err(AdmissionError::Inactive);
        }
        if api_key.is_deleted {
            return Err(AdmissionError::Deleted);
        }

        // 4. Activation-mode first use. Best-effort single-writer update;
        // losing the race or failing the write never denies admission.
        if api_key.needs_activation() {
            let expires_at = api_key.activation_expiry(now);
            match self.api_keys.activate(&api_key.id, now, expires_at).await {
                Ok(true) => {
                    api_key.is_activated = true;
                    api_key.activated_at = Some(now);
                    api_key.expires_at = Some(expires_at);
                    tracing::info!(key_id = %api_key.id, expires_at = %expires_at, "API key activated on first use");
                }
                Ok(false) => {
                    tracing::debug!(key_id = %api_key.id, "another writer activated this key first");
                }
                Err(error) => {
                    tracing::warn!(key_id = %api_key.id, error = %error, "activation write failed");
                }
            }
        }

        // 5. Expiry
        if let Some(expired_at) = api_key.expires_at.filter(|at| *at <= now) {
            return Err(AdmissionError::Expired { expired_at });
        }

        // 6. Permission
        if let Some(required) = descriptor.required_permission
            && !api_key.has_permission(required)
        {
            return Err(AdmissionError::PermissionDenied { required });
        }

        // 7. Client allow-list
        if let Some(client) = descriptor.client_type.as_deref()
            && !api_key.client_allowed(client)
        {
            return Err(AdmissionError::ClientNotAllowed {
                client: client.to_string(),
            });
        }

        // 8. Model blacklist
        if let Some(model) = descriptor.model.as_deref()
            && api_key.model_blacklisted(model)
        {
            return Err(AdmissionError::ModelBlacklisted {
                model: model.to_string(),
            });
        }

        // 9. Rate windows
        if api_key.rate_limit_per_min > 0 {
            self.check_rate_window(&api_key, RateWindow::PerMinute, api_key.rate_limit_per_min, now)
                .await?;
        }
        if api_key.rate_limit_per_hour > 0 {
            self.check_rate_window(&api_key, RateWindow::PerHour, api_key.rate_limit_per_hour, now)
                .await?;
        }

        // 10. Cost gates
        if !descriptor.skip_cost_gates {
            self.check_cost_gates(&api_key, descriptor.model.as_deref(), now)
                .await?;
        }

        // 11. Concurrency
        let mut holds_concurrency_slot = false;
        let lease_seconds = descriptor
            .concurrency_lease_seconds
            .or(Some(self.config.default_lease_seconds));
        if api_key.concurrent_limit > 0 {
            match self
                .limiter
                .acquire(
                    &api_key.id,
                    request_id,
                    api_key.concurrent_limit,
                    lease_seconds,
                )
                .await
            {
                Ok(SlotAttempt::Acquired(_)) => holds_concurrency_slot = true,
                Ok(SlotAttempt::OverLimit(current)) => {
                    if api_key.concurrent_request_queue_enabled {
                        match self
                            .queue
                            .wait_for_slot(
                                &api_key,
                                &self.limiter,
                                request_id,
                                lease_seconds,
                                descriptor.queue_timeout_override_ms,
                                cancel,
                            )
                            .await?
                        {
                            QueuedSlot::Acquired(_) => holds_concurrency_slot = true,
                            QueuedSlot::FailedOpen => holds_concurrency_slot = false,
                        }
                    } else {
                        return Err(AdmissionError::ConcurrencyExceeded {
                            limit: api_key.concurrent_limit,
                            current,
                        });
                    }
                }
                Err(error) => {
                    // Fail open rather than amplifying a store outage
                    tracing::warn!(
                        key_id = %api_key.id,
                        error = %error,
                        "concurrency acquire failed; admitting without a slot"
                    );
                }
            }

            // A cancelled admit must not leak the slot it just took
            if cancel.is_cancelled() {
                if holds_concurrency_slot {
                    self.release_slot(&api_key.id, request_id).await;
                }
                return Err(AdmissionError::ContextCancelled);
            }
        }

        Ok(Admission {
            api_key,
            holds_concurrency_slot,
        })
    }

    /// Release the concurrency slot held by `request_id`. Never fails the
    /// caller: errors are logged and the lease expires on its own.
    pub async fn release_slot(&self, key_id: &str, request_id: &str) {
        if let Err(error) = self.limiter.release(key_id, request_id).await {
            tracing::warn!(
                key_id = %key_id,
                request_id = %request_id,
                error = %error,
                "failed to release concurrency slot; lease will expire"
            );
        }
    }

    /// Extend a held lease for a long-running stream. Returns false when the
    /// lease already lapsed.
    pub async fn refresh_lease(
        &self,
        key_id: &str,
        request_id: &str,
        lease_seconds: Option<u64>,
    ) -> bool {
        match self.limiter.refresh(key_id, request_id, lease_seconds).await {
            Ok(refreshed) => refreshed,
            Err(error) => {
                tracing::warn!(key_id = %key_id, error = %error, "lease refresh failed");
                false
            }
        }
    }

    /// Note a waiter whose client socket went away; the transport layer
    /// calls this instead of the cancelled path when it can tell the
    /// difference.
    pub async fn record_socket_changed(&self, key_id: &str) {
        self.stats
            .record_outcome(key_id, QueueOutcome::SocketChanged)
            .await;
    }

    /// Queue statistics surface (snapshots, percentiles, health).
    pub fn queue_stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Store liveness + queue health under one 5 s deadline.
    pub async fn is_healthy(&self) -> bool {
        let ping = tokio::time::timeout(Duration::from_secs(5), self.store.ping()).await;
        match ping {
            Ok(Ok(())) => {
                self.stats
                    .is_healthy(self.config.queue.default_timeout_ms)
                    .await
            }
            _ => false,
        }
    }

    async fn check_rate_window(
        &self,
        api_key: &ApiKey,
        window: RateWindow,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<(), AdmissionError> {
        let now_s = now.timestamp();
        let bucket = now_s.div_euclid(window.secs());
        let key = StoreKeys::rate_limit_window(&api_key.id, window.window_name(), bucket);

        // Never retried: a second INCR after a lost ack would double-charge
        // the bucket.
        match self
            .store
            .incr_with_expiry(&key, Duration::from_secs(window.secs() as u64))
            .await
        {
            Ok(count) if count > i64::from(limit) => {
                let window_end = (bucket + 1) * window.secs();
                Err(AdmissionError::RateLimited {
                    window,
                    limit,
                    current: count,
                    reset_at: DateTime::from_timestamp(window_end, 0).unwrap_or(now),
                    retry_after: Duration::from_secs((window_end - now_s).max(0) as u64),
                })
            }
            Ok(_) => Ok(()),
            Err(error) => {
                tracing::warn!(
                    key_id = %api_key.id,
                    window = window.window_name(),
                    error = %error,
                    "rate window increment failed; gate fails open"
                );
                Ok(())
            }
        }
    }

    /// Cost gates, in order: daily, total, weekly Opus, window. An active
    /// fuel pack suppresses all but the weekly Opus gate.
    async fn check_cost_gates(
        &self,
        api_key: &ApiKey,
        model: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AdmissionError> {
        let tz = self.config.timezone_offset_hours;
        let fueled = api_key.has_active_fuel_pack(now.timestamp_millis());
        let buckets = time_buckets(now, tz);

        if api_key.daily_cost_limit > 0.0 && !fueled {
            let current = self
                .read_cost_hash(&StoreKeys::cost_daily(&api_key.id, &buckets.date), "daily")
                .await;
            if current >= api_key.daily_cost_limit {
                return Err(AdmissionError::CostLimitDaily {
                    limit: api_key.daily_cost_limit,
                    current,
                    reset_at: next_midnight(now, tz),
                });
            }
        }

        if api_key.total_cost_limit > 0.0 && !fueled {
            let current = self
                .read_cost_hash(&StoreKeys::cost_total(&api_key.id), "total")
                .await;
            if current >= api_key.total_cost_limit {
                return Err(AdmissionError::CostLimitTotal {
                    limit: api_key.total_cost_limit,
                    current,
                });
            }
        }

        if api_key.weekly_opus_cost_limit > 0.0 && model.is_some_and(is_opus_model) {
            let current = self
                .read_cost_scalar(
                    &StoreKeys::cost_weekly_opus(&api_key.id, &buckets.week_monday),
                    "weekly_opus",
                )
                .await;
            if current >= api_key.weekly_opus_cost_limit {
                return Err(AdmissionError::CostLimitWeeklyOpus {
                    limit: api_key.weekly_opus_cost_limit,
                    current,
                    reset_at: next_monday_midnight(now, tz),
                });
            }
        }

        if api_key.rate_limit_window_minutes > 0 && api_key.rate_limit_cost > 0.0 && !fueled {
            let current = self
                .read_cost_scalar(&StoreKeys::rate_limit_cost(&api_key.id), "window")
                .await;
            if current >= api_key.rate_limit_cost {
                return Err(AdmissionError::CostLimitWindow {
                    limit: api_key.rate_limit_cost,
                    current,
                    retry_after: Duration::from_secs(
                        u64::from(api_key.rate_limit_window_minutes) * 60,
                    ),
                });
            }
        }

        Ok(())
    }

    /// Read the `total` field of a cost hash. Read failures fail open as
    /// zero, loudly.
    async fn read_cost_hash(&self, key: &str, gate: &str) -> f64 {
        match self.store.hash_get(key, "total").await {
            Ok(value) => value.and_then(|v| v.parse().ok()).unwrap_or(0.0),
            Err(error) => {
                tracing::warn!(gate = gate, key = key, error = %error, "cost read failed; gate fails open");
                0.0
            }
        }
    }

    /// Read a scalar cost counter with the same fail-open bias.
    async fn read_cost_scalar(&self, key: &str, gate: &str) -> f64 {
        match self.store.get_f64(key).await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(gate = gate, key = key, error = %error, "cost read failed; gate fails open");
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn engine() -> AdmissionEngine {
        AdmissionEngine::new(Arc::new(MemoryStore::new()), AdmissionConfig::default())
    }

    #[tokio::test]
    async fn test_format_gate_rejects_foreign_prefixes() {
        let engine = engine();
        let error = engine
            .admit(
                "sk-not-ours",
                "r1",
                &RequestDescriptor::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(error.kind(), "invalid_format");
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_found() {
        let engine = engine();
        let error = engine
            .admit(
                "cr_unknown",
                "r1",
                &RequestDescriptor::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(error.kind(), "not_found");
        assert_eq!(error.status_hint().as_u16(), 401);
    }

    #[test]
    fn test_rate_window_shapes() {
        assert_eq!(RateWindow::PerMinute.secs(), 60);
        assert_eq!(RateWindow::PerHour.secs(), 3600);
        assert_eq!(RateWindow::PerMinute.window_name(), "minute");
        assert_eq!(RateWindow::PerHour.window_name(), "hour");
    }
}
