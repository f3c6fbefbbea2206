use std::{sync::Arc, time::Duration};

use crate::{
    config::QueueConfig,
    store::{CounterOp, Store, StoreKeys, StoreResult, ttl},
};

/// Per-key sample ring size.
const PER_KEY_SAMPLE_CAP: usize = 500;
/// Global sample ring size.
const GLOBAL_SAMPLE_CAP: usize = 2000;
/// Deadline applied to health probes that carry none of their own.
const HEALTH_PROBE_DEADLINE: Duration = Duration::from_secs(5);

/// Queue outcome counters kept per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Entered,
    Success,
    Timeout,
    Cancelled,
    /// The client's socket went away while the request waited.
    SocketChanged,
    /// Rejected before entry because the queue was at its bound.
    RejectedOverload,
}

impl QueueOutcome {
    pub fn field(&self) -> &'static str {
        match self {
            QueueOutcome::Entered => "entered",
            QueueOutcome::Success => "success",
            QueueOutcome::Timeout => "timeout",
            QueueOutcome::Cancelled => "cancelled",
            QueueOutcome::SocketChanged => "socket_changed",
            QueueOutcome::RejectedOverload => "rejected_overload",
        }
    }
}

/// Counter snapshot for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub entered: i64,
    pub success: i64,
    pub timeout: i64,
    pub cancelled: i64,
    pub socket_changed: i64,
    pub rejected_overload: i64,
}

/// Percentile summary over one sample ring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaitTimeSummary {
    pub count: usize,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
}

/// Queue statistics: outcome counters and wait-time sample rings.
///
/// Samples are capped lists (500 per key, 2000 global); percentiles are
/// computed caller-side by sorting and interpolating, so they drift with
/// ring turnover rather than being exact. Samples are not scoped to the
/// wait window that produced them, so a trend view blends windows.
#[derive(Clone)]
pub struct QueueStats {
    store: Arc<dyn Store>,
    health_threshold: f64,
}

impl QueueStats {
    pub fn new(store: Arc<dyn Store>, config: &QueueConfig) -> Self {
        Self {
            store,
            health_threshold: config.health_threshold,
        }
    }

    /// Bump an outcome counter. Accounting-path writes never fail the
    /// request; errors are logged and dropped.
    pub async fn record_outcome(&self, key_id: &str, outcome: QueueOutcome) {
        let key = StoreKeys::queue_stats(key_id);
        let ops = [
            CounterOp::HashIncrBy {
                key: key.clone(),
                field: outcome.field().to_string(),
                delta: 1,
            },
            CounterOp::Expire {
                key,
                ttl: ttl::QUEUE_STATS,
            },
        ];
        if let Err(error) = self.store.apply_counters(&ops).await {
            tracing::warn!(
                key_id = %key_id,
                outcome = outcome.field(),
                error = %error,
                "failed to record queue outcome"
            );
        }
        crate::observability::metrics::record_queue_outcome(outcome.field());
    }

    /// Push a wait-time sample into the per-key and global rings.
    pub async fn record_wait(&self, key_id: &str, wait_ms: f64) {
        let per_key = self
            .store
            .list_push_capped(
                &StoreKeys::queue_wait_times(key_id),
                wait_ms,
                PER_KEY_SAMPLE_CAP,
                ttl::QUEUE_WAIT_TIMES,
            )
            .await;
        let global = self
            .store
            .list_push_capped(
                StoreKeys::QUEUE_WAIT_TIMES_GLOBAL,
                wait_ms,
                GLOBAL_SAMPLE_CAP,
                ttl::QUEUE_WAIT_TIMES,
            )
            .await;
        if let Err(error) = per_key.and(global) {
            tracing::warn!(key_id = %key_id, error = %error, "failed to record wait-time sample");
        }
        crate::observability::metrics::record_queue_wait(wait_ms / 1000.0);
    }

    /// Counter snapshot for one key.
    pub async fn snapshot(&self, key_id: &str) -> StoreResult<QueueStatsSnapshot> {
        let fields = self
            .store
            .hash_get_all(&StoreKeys::queue_stats(key_id))
            .await?;
        let read = |name: &str| -> i64 {
            fields.get(name).and_then(|v| v.parse().ok()).unwrap_or(0)
        };
        Ok(QueueStatsSnapshot {
            entered: read("entered"),
            success: read("success"),
            timeout: read("timeout"),
            cancelled: read("cancelled"),
            socket_changed: read("socket_changed"),
            rejected_overload: read("rejected_overload"),
        })
    }

    /// Wait-time percentiles for one key, or globally when `key_id` is None.
    pub async fn wait_time_summary(&self, key_id: Option<&str>) -> StoreResult<WaitTimeSummary> {
        let key = match key_id {
            Some(id) => StoreKeys::queue_wait_times(id),
            None => StoreKeys::QUEUE_WAIT_TIMES_GLOBAL.to_string(),
        };
        let mut samples = self.store.list_values(&key).await?;
        if samples.is_empty() {
            return Ok(WaitTimeSummary::default());
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Ok(WaitTimeSummary {
            count: samples.len(),
            p50_ms: percentile(&samples, 50.0),
            p90_ms: percentile(&samples, 90.0),
            p99_ms: percentile(&samples, 99.0),
        })
    }

    /// Health predicate: the queue is healthy while the global p90 wait
    /// stays under `threshold x timeout`. Probed under a 5 s deadline; a
    /// probe that cannot answer in time reports unhealthy.
    pub async fn is_healthy(&self, timeout_ms: u64) -> bool {
        let probe = self.wait_time_summary(None);
        match tokio::time::timeout(HEALTH_PROBE_DEADLINE, probe).await {
            Ok(Ok(summary)) => summary.p90_ms < self.health_threshold * timeout_ms as f64,
            Ok(Err(error)) => {
                tracing::warn!(error = %error, "queue health probe failed");
                false
            }
            Err(_) => {
                tracing::warn!("queue health probe timed out");
                false
            }
        }
    }
}

/// Linear-interpolated percentile over sorted samples, at
/// `(p/100) * (n - 1)`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}
