//! Post-response usage and cost accounting.
//!
//! One upstream response fans out into a few dozen counter increments:
//! per-key totals and time buckets, per-model variants, per-account mirrors,
//! a system-wide per-minute view, and the money counters the cost gates
//! read. All writes for one event go out as a single pipeline, so observers
//! on a single-shard store never see a partially applied event.
//!
//! Accounting is fire-and-forget: a failed pipeline loses at most one
//! event's counters and is logged, never propagated to the caller.

use std::{sync::Arc, time::Duration};

use chrono::Utc;

use crate::{
    config::AccountingConfig,
    models::{CostBreakdown, TimeBuckets, UsageRecord, is_opus_model, normalize_model_name,
        time_buckets},
    observability::metrics,
    store::{CounterOp, Store, StoreKeys, ttl},
};

/// Usage accountant. Cheap to clone; holds only the store handle and the
/// bucketing configuration.
#[derive(Clone)]
pub struct UsageAccountant {
    store: Arc<dyn Store>,
    timezone_offset_hours: i32,
    metrics_window: Duration,
}

impl UsageAccountant {
    pub fn new(store: Arc<dyn Store>, timezone_offset_hours: i32, config: &AccountingConfig) -> Self {
        Self {
            store,
            timezone_offset_hours,
            metrics_window: Duration::from_secs(config.metrics_window_secs),
        }
    }

    /// Record one completed request. `window_cost_minutes` is the key's
    /// rolling cost window, when one is configured; it feeds the
    /// `rate_limit:cost:{id}` scalar the window gate reads.
    pub async fn record(
        &self,
        usage: &UsageRecord,
        cost: &CostBreakdown,
        window_cost_minutes: Option<u32>,
    ) {
        let buckets = time_buckets(Utc::now(), self.timezone_offset_hours);
        let ops = self.counter_ops(usage, cost, &buckets);

        if let Err(error) = self.store.apply_counters(&ops).await {
            tracing::warn!(
                key_id = %usage.key_id,
                model = %usage.model,
                error = %error,
                "usage accounting pipeline failed; event dropped"
            );
            metrics::record_accounting_failure();
        }

        // The window-cost scalar keeps its TTL from the first write of the
        // window, so it goes through the TTL-preserving increment rather
        // than the pipeline.
        if let Some(minutes) = window_cost_minutes.filter(|m| *m > 0)
            && cost.total > 0.0
            && let Err(error) = self
                .store
                .incr_by_float(
                    &StoreKeys::rate_limit_cost(&usage.key_id),
                    cost.total,
                    Duration::from_secs(u64::from(minutes) * 60),
                )
                .await
        {
            tracing::warn!(
                key_id = %usage.key_id,
                error = %error,
                "window cost increment failed"
            );
            metrics::record_accounting_failure();
        }
    }

    /// The full fan-out for one event. Pure, so tests can assert the exact
    /// key/field set.
    fn counter_ops(
        &self,
        usage: &UsageRecord,
        cost: &CostBreakdown,
        buckets: &TimeBuckets,
    ) -> Vec<CounterOp> {
        let key_id = &usage.key_id;
        let model = normalize_model_name(&usage.model);
        let mut ops = Vec::with_capacity(96);

        // Per-key all-time hash, `total`-prefixed fields
        push_usage(&mut ops, StoreKeys::usage_total(key_id), usage, true);

        // Per-key time buckets
        for (key, bucket_ttl) in [
            (
                StoreKeys::usage_daily(key_id, &buckets.date),
                ttl::USAGE_DAILY,
            ),
            (
                StoreKeys::usage_monthly(key_id, &buckets.month),
                ttl::USAGE_MONTHLY,
            ),
            (
                StoreKeys::usage_hourly(key_id, &buckets.hour),
                ttl::USAGE_HOURLY,
            ),
        ] {
            push_usage(&mut ops, key.clone(), usage, false);
            ops.push(CounterOp::Expire {
                key,
                ttl: bucket_ttl,
            });
        }

        // Per-model buckets, per-key and system-wide
        for id in [key_id.as_str(), "system"] {
            for (kind, bucket, bucket_ttl) in [
                ("daily", buckets.date.as_str(), ttl::USAGE_DAILY),
                ("monthly", buckets.month.as_str(), ttl::USAGE_MONTHLY),
                ("hourly", buckets.hour.as_str(), ttl::USAGE_HOURLY),
            ] {
                let key = StoreKeys::usage_model(id, kind, &model, bucket);
                push_usage(&mut ops, key.clone(), usage, false);
                ops.push(CounterOp::Expire {
                    key,
                    ttl: bucket_ttl,
                });
            }
        }

        // Per-account mirror
        if let Some(account_id) = usage.account_id.as_deref() {
            push_usage(&mut ops, StoreKeys::account_usage_total(account_id), usage, true);
            for (kind, bucket, bucket_ttl) in [
                ("daily", buckets.date.as_str(), ttl::USAGE_DAILY),
                ("monthly", buckets.month.as_str(), ttl::USAGE_MONTHLY),
                ("hourly", buckets.hour.as_str(), ttl::USAGE_HOURLY),
            ] {
                let key = StoreKeys::account_usage(kind, account_id, bucket);
                push_usage(&mut ops, key.clone(), usage, false);
                // Hourly account hashes carry per-model fields so the
                // session-window view can sum the last N hours by model
                if kind == "hourly" {
                    for (metric, delta) in [
                        ("inputTokens", usage.input_tokens),
                        ("outputTokens", usage.output_tokens),
                        ("allTokens", usage.all_tokens()),
                        ("requests", 1),
                    ] {
                        ops.push(CounterOp::HashIncrBy {
                            key: key.clone(),
                            field: format!("model:{}:{}", model, metric),
                            delta,
                        });
                    }
                }
                ops.push(CounterOp::Expire {
                    key,
                    ttl: bucket_ttl,
                });
            }
        }

        // System per-minute view
        let minute_key = StoreKeys::system_metrics_minute(buckets.minute);
        for (field, delta) in [
            ("requests", 1),
            ("totalTokens", usage.total_tokens()),
            ("inputTokens", usage.input_tokens),
            ("outputTokens", usage.output_tokens),
            ("cacheCreateTokens", usage.cache_create_tokens),
            ("cacheReadTokens", usage.cache_read_tokens),
        ] {
            ops.push(CounterOp::HashIncrBy {
                key: minute_key.clone(),
                field: field.to_string(),
                delta,
            });
        }
        ops.push(CounterOp::Expire {
            key: minute_key,
            ttl: self.metrics_window * 2,
        });

        // Money counters
        if cost.total > 0.0 {
            for (key, bucket_ttl) in [
                (
                    StoreKeys::cost_daily(key_id, &buckets.date),
                    Some(ttl::USAGE_DAILY),
                ),
                (
                    StoreKeys::cost_monthly(key_id, &buckets.month),
                    Some(ttl::USAGE_MONTHLY),
                ),
                (StoreKeys::cost_total(key_id), None),
            ] {
                for (field, delta) in [
                    ("total", cost.total),
                    ("input", cost.input),
                    ("output", cost.output),
                    ("cacheCreate", cost.cache_create),
                    ("cacheRead", cost.cache_read),
                ] {
                    ops.push(CounterOp::HashIncrByFloat {
                        key: key.clone(),
                        field: field.to_string(),
                        delta,
                    });
                }
                if let Some(bucket_ttl) = bucket_ttl {
                    ops.push(CounterOp::Expire {
                        key,
                        ttl: bucket_ttl,
                    });
                }
            }

            if is_opus_model(&usage.model) {
                let key = StoreKeys::cost_weekly_opus(key_id, &buckets.week_monday);
                ops.push(CounterOp::IncrByFloat {
                    key: key.clone(),
                    delta: cost.total,
                });
                ops.push(CounterOp::Expire {
                    key,
                    ttl: ttl::COST_WEEKLY_OPUS,
                });
            }
        }

        ops
    }
}

/// Append the token counters for one hash. The all-time hashes use
/// `total`-prefixed field names; bucketed hashes use the bare names.
fn push_usage(ops: &mut Vec<CounterOp>, key: String, usage: &UsageRecord, prefixed: bool) {
    let field = |bare: &str, prefixed_name: &str| -> String {
        if prefixed {
            prefixed_name.to_string()
        } else {
            bare.to_string()
        }
    };

    let mut counters = vec![
        (field("tokens", "totalTokens"), usage.total_tokens()),
        (field("inputTokens", "totalInputTokens"), usage.input_tokens),
        (
            field("outputTokens", "totalOutputTokens"),
            usage.output_tokens,
        ),
        (
            field("cacheCreateTokens", "totalCacheCreateTokens"),
            usage.cache_create_tokens,
        ),
        (
            field("cacheReadTokens", "totalCacheReadTokens"),
            usage.cache_read_tokens,
        ),
        (field("allTokens", "totalAllTokens"), usage.all_tokens()),
        (
            field("ephemeral5mTokens", "totalEphemeral5mTokens"),
            usage.ephemeral_5m_tokens,
        ),
        (
            field("ephemeral1hTokens", "totalEphemeral1hTokens"),
            usage.ephemeral_1h_tokens,
        ),
        (field("requests", "totalRequests"), 1),
    ];
    if usage.is_long_context {
        counters.push((
            field("longContextInputTokens", "totalLongContextInputTokens"),
            usage.input_tokens,
        ));
        counters.push((
            field("longContextOutputTokens", "totalLongContextOutputTokens"),
            usage.output_tokens,
        ));
        counters.push((field("longContextRequests", "totalLongContextRequests"), 1));
    }

    for (field, delta) in counters {
        ops.push(CounterOp::HashIncrBy {
            key: key.clone(),
            field,
            delta,
        });
    }
}
