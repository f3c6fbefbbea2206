//! End-to-end admission scenarios: the full gate sequence against the
//! in-memory store, including the queue waiter and the scheduler behaviors
//! the deployed relay fleet depends on.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::{
    accounts::{AccountStore, ApiKeyStore},
    admission::{AdmissionEngine, AdmissionError, RequestDescriptor},
    config::{AdmissionConfig, ControlPlaneConfig, SchedulerConfig},
    models::{
        Account, ActivationUnit, ApiKey, BaseAccount, ClaudeAccount, ExpirationMode,
        ProviderCategory, SubscriptionLevel, hash_raw_key, time_buckets,
    },
    scheduler::{AccountRepository, ScheduleError, Scheduler, SelectOptions},
    store::{CounterOp, MemoryStore, Store, StoreKeys},
};

struct Harness {
    store: Arc<MemoryStore>,
    engine: AdmissionEngine,
    api_keys: ApiKeyStore,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
    Harness {
        engine: AdmissionEngine::new(Arc::clone(&dyn_store), AdmissionConfig::default()),
        api_keys: ApiKeyStore::new(dyn_store),
        store,
    }
}

impl Harness {
    async fn seed_key(&self, raw_key: &str, mut key: ApiKey) -> ApiKey {
        key.hashed_key = hash_raw_key(raw_key);
        self.api_keys.save(&key).await.unwrap();
        key
    }

    async fn admit(
        &self,
        raw_key: &str,
        request_id: &str,
        descriptor: &RequestDescriptor,
    ) -> Result<crate::admission::Admission, AdmissionError> {
        self.engine
            .admit(raw_key, request_id, descriptor, &CancellationToken::new())
            .await
    }
}

fn claude_scheduler(store: &Arc<MemoryStore>, repo: &Arc<AccountStore>) -> Scheduler {
    Scheduler::new(
        ProviderCategory::Claude,
        Arc::clone(repo) as Arc<dyn AccountRepository>,
        Arc::clone(store) as Arc<dyn Store>,
        SchedulerConfig::default(),
    )
}

fn pro_claude_account(id: &str, priority: Option<i32>) -> Account {
    Account::Claude(ClaudeAccount {
        base: BaseAccount {
            priority,
            ..BaseAccount::new(id, id)
        },
        subscription_level: Some(SubscriptionLevel::Pro),
        refresh_token: Some("rt".into()),
        access_token: Some("at".into()),
        token_expiry: None,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// S1: activation on first use
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_activation_on_first_use() {
    let harness = harness();
    harness
        .seed_key(
            "cr_k1",
            ApiKey {
                id: "k1".into(),
                expiration_mode: ExpirationMode::Activation,
                activation_days: 7,
                activation_unit: ActivationUnit::Days,
                is_activated: false,
                is_active: true,
                ..Default::default()
            },
        )
        .await;

    let before = Utc::now();
    let admission = harness
        .admit("cr_k1", "r1", &RequestDescriptor::default())
        .await
        .unwrap();
    let after = Utc::now();

    assert!(admission.api_key.is_activated);

    // The stored record now carries the activation and a seven-day expiry
    let stored = harness.api_keys.get("k1").await.unwrap().unwrap();
    assert!(stored.is_activated);
    let expires_at = stored.expires_at.unwrap();
    assert!(expires_at >= before + chrono::Duration::days(7));
    assert!(expires_at <= after + chrono::Duration::days(7));

    // A second admit does not re-activate (expiry is stable)
    harness
        .admit("cr_k1", "r2", &RequestDescriptor::default())
        .await
        .unwrap();
    let stored_again = harness.api_keys.get("k1").await.unwrap().unwrap();
    assert_eq!(stored_again.expires_at, stored.expires_at);
}

#[tokio::test]
async fn test_expired_key_is_denied() {
    let harness = harness();
    harness
        .seed_key(
            "cr_old",
            ApiKey {
                id: "old".into(),
                expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
                ..Default::default()
            },
        )
        .await;

    let error = harness
        .admit("cr_old", "r1", &RequestDescriptor::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "expired");
}

// ─────────────────────────────────────────────────────────────────────────────
// S2: rate limit boundary (and property 4, window idempotence)
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rate_limit_boundary() {
    let harness = harness();
    harness
        .seed_key(
            "cr_rate",
            ApiKey {
                id: "rate".into(),
                rate_limit_per_min: 3,
                ..Default::default()
            },
        )
        .await;

    for i in 0..3 {
        harness
            .admit("cr_rate", &format!("r{}", i), &RequestDescriptor::default())
            .await
            .unwrap_or_else(|e| panic!("admit {} should pass, got {}", i, e));
    }

    let error = harness
        .admit("cr_rate", "r3", &RequestDescriptor::default())
        .await
        .unwrap_err();
    match &error {
        AdmissionError::RateLimited {
            limit,
            current,
            retry_after,
            ..
        } => {
            assert_eq!(*limit, 3);
            assert_eq!(*current, 4);
            assert!(*retry_after <= Duration::from_secs(60));
        }
        other => panic!("expected rate_limited, got {:?}", other),
    }
    assert_eq!(error.status_hint().as_u16(), 429);
}

// ─────────────────────────────────────────────────────────────────────────────
// S3: concurrency plus queue
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrency_queue_one_slot_three_waiters() {
    let harness = harness();
    let key = harness
        .seed_key(
            "cr_q",
            ApiKey {
                id: "q".into(),
                concurrent_limit: 1,
                concurrent_request_queue_enabled: true,
                concurrent_request_queue_max_size: 3,
                concurrent_request_queue_timeout_ms: 2_000,
                ..Default::default()
            },
        )
        .await;

    // One holder in flight
    let holder = harness
        .admit("cr_q", "holder", &RequestDescriptor::default())
        .await
        .unwrap();
    assert!(holder.holds_concurrency_slot);

    // Three concurrent admits enter the queue
    let engine = Arc::new(harness.engine);
    let waiters: Vec<_> = (0..3)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .admit(
                        "cr_q",
                        &format!("waiter-{}", i),
                        &RequestDescriptor::default(),
                        &CancellationToken::new(),
                    )
                    .await
            })
        })
        .collect();

    // Free the slot after 500 ms
    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.release_slot(&key.id, "holder").await;

    let results: Vec<_> = futures::future::join_all(waiters)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let successes = results.iter().filter(|r| r.is_ok()).count();
    let timeouts = results
        .iter()
        .filter(|r| matches!(r, Err(AdmissionError::QueueTimeout { .. })))
        .count();
    assert_eq!(successes, 1, "exactly one waiter gets the freed slot");
    assert_eq!(timeouts, 2, "the others time out legibly");

    // The queue counter drained to zero
    assert_eq!(
        harness
            .store
            .get_i64(&StoreKeys::queue_counter("q"))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_queue_disabled_rejects_immediately() {
    let harness = harness();
    harness
        .seed_key(
            "cr_noq",
            ApiKey {
                id: "noq".into(),
                concurrent_limit: 1,
                ..Default::default()
            },
        )
        .await;

    harness
        .admit("cr_noq", "r1", &RequestDescriptor::default())
        .await
        .unwrap();
    let error = harness
        .admit("cr_noq", "r2", &RequestDescriptor::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "concurrency_exceeded");
}

/// Property 3: when every waiter can get a slot within the deadline, all of
/// them succeed.
#[tokio::test]
async fn test_queue_drains_when_holders_release() {
    let harness = harness();
    harness
        .seed_key(
            "cr_drain",
            ApiKey {
                id: "drain".into(),
                concurrent_limit: 1,
                concurrent_request_queue_enabled: true,
                concurrent_request_queue_max_size: 3,
                concurrent_request_queue_timeout_ms: 5_000,
                ..Default::default()
            },
        )
        .await;

    let engine = Arc::new(harness.engine);

    let first = engine
        .admit(
            "cr_drain",
            "first",
            &RequestDescriptor::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(first.holds_concurrency_slot);

    let waiters: Vec<_> = (0..3)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let request_id = format!("drain-{}", i);
                let admission = engine
                    .admit(
                        "cr_drain",
                        &request_id,
                        &RequestDescriptor::default(),
                        &CancellationToken::new(),
                    )
                    .await?;
                // Hold briefly, then release so the next waiter can run
                tokio::time::sleep(Duration::from_millis(50)).await;
                engine.release_slot(&admission.api_key.id, &request_id).await;
                Ok::<_, AdmissionError>(())
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.release_slot("drain", "first").await;

    let results: Vec<_> = futures::future::join_all(waiters)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert!(
        results.iter().all(|r| r.is_ok()),
        "all waiters drain within the deadline: {:?}",
        results
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Property 1: the concurrency cap holds under concurrent admits
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrency_cap_under_contention() {
    let harness = harness();
    harness
        .seed_key(
            "cr_cap",
            ApiKey {
                id: "cap".into(),
                concurrent_limit: 3,
                ..Default::default()
            },
        )
        .await;

    let engine = Arc::new(harness.engine);
    let attempts: Vec<_> = (0..30)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .admit(
                        "cr_cap",
                        &format!("c{}", i),
                        &RequestDescriptor::default(),
                        &CancellationToken::new(),
                    )
                    .await
            })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let granted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(granted, 3, "exactly the cap is admitted");

    // Property 2 fallout: over-limit acquires rolled back, cardinality == cap
    let now_ms = Utc::now().timestamp_millis();
    assert_eq!(
        harness
            .store
            .lease_set_count(&StoreKeys::concurrency("cap"), now_ms)
            .await
            .unwrap(),
        3
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// S4: Opus under Pro, at the scheduler
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_opus_selection_under_pro_subscription() {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(AccountStore::new(Arc::clone(&store) as Arc<dyn Store>));
    repo.put(&pro_claude_account("pro1", None)).await.unwrap();
    let scheduler = claude_scheduler(&store, &repo);

    let select = |model: &str| SelectOptions {
        model: Some(model.to_string()),
        ..Default::default()
    };

    let selection = scheduler
        .select(&select("claude-opus-4-20250514"))
        .await
        .unwrap();
    assert_eq!(selection.account_id, "pro1");

    let error = scheduler
        .select(&select("claude-opus-4-20240610"))
        .await
        .unwrap_err();
    assert!(matches!(error, ScheduleError::NotAvailable { .. }));

    let selection = scheduler
        .select(&select("claude-opus-4-5-20250923"))
        .await
        .unwrap();
    assert_eq!(selection.account_id, "pro1");
}

// ─────────────────────────────────────────────────────────────────────────────
// S5: sticky session across overload
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sticky_session_replaced_on_overload() {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(AccountStore::new(Arc::clone(&store) as Arc<dyn Store>));
    // a1 outranks a2, so the first selection binds a1
    repo.put(&pro_claude_account("a1", Some(10))).await.unwrap();
    repo.put(&pro_claude_account("a2", None)).await.unwrap();
    let scheduler = claude_scheduler(&store, &repo);

    let opts = SelectOptions {
        session_hash: Some("H".into()),
        ..Default::default()
    };
    let bound = scheduler.select(&opts).await.unwrap();
    assert_eq!(bound.account_id, "a1");

    scheduler
        .mark_overloaded(crate::models::AccountType::Claude, "a1", Duration::from_secs(30))
        .await
        .unwrap();

    // The overloaded binding is bypassed and REPLACED by the fallback
    let fallback = scheduler.select(&opts).await.unwrap();
    assert_eq!(fallback.account_id, "a2");
    assert!(!fallback.from_session);

    let rebound = scheduler.select(&opts).await.unwrap();
    assert_eq!(rebound.account_id, "a2");
    assert!(rebound.from_session);
}

/// Property 7: the overload mask holds for its duration and wears off.
#[tokio::test]
async fn test_overload_mask_duration() {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(AccountStore::new(Arc::clone(&store) as Arc<dyn Store>));
    repo.put(&pro_claude_account("only", None)).await.unwrap();
    let scheduler = claude_scheduler(&store, &repo);

    scheduler
        .mark_overloaded(
            crate::models::AccountType::Claude,
            "only",
            Duration::from_millis(200),
        )
        .await
        .unwrap();

    let error = scheduler.select(&SelectOptions::default()).await.unwrap_err();
    assert!(matches!(error, ScheduleError::NotAvailable { .. }));

    // Past overloaded_until the account returns to rotation
    tokio::time::sleep(Duration::from_millis(300)).await;
    let selection = scheduler.select(&SelectOptions::default()).await.unwrap();
    assert_eq!(selection.account_id, "only");
}

// ─────────────────────────────────────────────────────────────────────────────
// S6: fuel pack bypasses the daily gate (but never the weekly Opus gate)
// ─────────────────────────────────────────────────────────────────────────────

async fn seed_daily_cost(store: &Arc<MemoryStore>, key_id: &str, amount: f64) {
    let date = time_buckets(Utc::now(), 8).date;
    store
        .apply_counters(&[CounterOp::HashIncrByFloat {
            key: StoreKeys::cost_daily(key_id, &date),
            field: "total".into(),
            delta: amount,
        }])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_fuel_pack_bypasses_daily_gate() {
    let harness = harness();
    let now_ms = Utc::now().timestamp_millis();
    harness
        .seed_key(
            "cr_fuel",
            ApiKey {
                id: "fuel".into(),
                daily_cost_limit: 1.0,
                fuel_balance: 5.0,
                fuel_next_expires_at_ms: now_ms + 3_600_000,
                ..Default::default()
            },
        )
        .await;
    seed_daily_cost(&harness.store, "fuel", 1.5).await;

    // Over the daily limit, but the fuel pack suppresses the gate
    harness
        .admit("cr_fuel", "r1", &RequestDescriptor::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_expired_fuel_pack_restores_daily_gate() {
    let harness = harness();
    let now_ms = Utc::now().timestamp_millis();
    harness
        .seed_key(
            "cr_dry",
            ApiKey {
                id: "dry".into(),
                daily_cost_limit: 1.0,
                fuel_balance: 5.0,
                fuel_next_expires_at_ms: now_ms - 1,
                ..Default::default()
            },
        )
        .await;
    seed_daily_cost(&harness.store, "dry", 1.5).await;

    let error = harness
        .admit("cr_dry", "r1", &RequestDescriptor::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "cost_limit_daily");
}

#[tokio::test]
async fn test_fuel_pack_never_bypasses_weekly_opus_gate() {
    let harness = harness();
    let now_ms = Utc::now().timestamp_millis();
    harness
        .seed_key(
            "cr_opus",
            ApiKey {
                id: "opus".into(),
                weekly_opus_cost_limit: 1.0,
                fuel_balance: 5.0,
                fuel_next_expires_at_ms: now_ms + 3_600_000,
                ..Default::default()
            },
        )
        .await;

    // Seed the weekly Opus scalar over its limit
    let monday = time_buckets(Utc::now(), 8).week_monday;
    harness
        .store
        .incr_by_float(
            &StoreKeys::cost_weekly_opus("opus", &monday),
            2.0,
            Duration::ZERO,
        )
        .await
        .unwrap();

    let descriptor = RequestDescriptor {
        model: Some("claude-opus-4-20250514".into()),
        ..Default::default()
    };
    let error = harness.admit("cr_opus", "r1", &descriptor).await.unwrap_err();
    assert_eq!(error.kind(), "cost_limit_weekly_opus");

    // A non-Opus model sails past the weekly gate
    let sonnet = RequestDescriptor {
        model: Some("claude-3-5-sonnet-20241022".into()),
        ..Default::default()
    };
    harness.admit("cr_opus", "r2", &sonnet).await.unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Remaining gate coverage
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_permission_client_and_blacklist_gates() {
    let harness = harness();
    harness
        .seed_key(
            "cr_gated",
            ApiKey {
                id: "gated".into(),
                permissions: vec![crate::models::Permission::Claude],
                allowed_clients: vec!["claude-cli*".into()],
                model_blacklist: vec!["opus".into()],
                ..Default::default()
            },
        )
        .await;

    // Wrong permission
    let error = harness
        .admit(
            "cr_gated",
            "r1",
            &RequestDescriptor {
                required_permission: Some(crate::models::Permission::Gemini),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "permission_denied");

    // Client not on the allow-list
    let error = harness
        .admit(
            "cr_gated",
            "r2",
            &RequestDescriptor {
                client_type: Some("curl/8.0".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "client_not_allowed");

    // Blacklisted model (substring match)
    let error = harness
        .admit(
            "cr_gated",
            "r3",
            &RequestDescriptor {
                client_type: Some("claude-cli/1.0".into()),
                model: Some("claude-opus-4-20250514".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "model_blacklisted");

    // Everything aligned
    harness
        .admit(
            "cr_gated",
            "r4",
            &RequestDescriptor {
                required_permission: Some(crate::models::Permission::Claude),
                client_type: Some("claude-cli/1.0".into()),
                model: Some("claude-3-5-sonnet-20241022".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_inactive_and_deleted_keys() {
    let harness = harness();
    harness
        .seed_key(
            "cr_off",
            ApiKey {
                id: "off".into(),
                is_active: false,
                ..Default::default()
            },
        )
        .await;
    harness
        .seed_key(
            "cr_gone",
            ApiKey {
                id: "gone".into(),
                is_deleted: true,
                ..Default::default()
            },
        )
        .await;

    assert_eq!(
        harness
            .admit("cr_off", "r1", &RequestDescriptor::default())
            .await
            .unwrap_err()
            .kind(),
        "inactive"
    );
    assert_eq!(
        harness
            .admit("cr_gone", "r1", &RequestDescriptor::default())
            .await
            .unwrap_err()
            .kind(),
        "deleted"
    );
}

#[tokio::test]
async fn test_cancelled_admit_releases_slot() {
    let harness = harness();
    harness
        .seed_key(
            "cr_cancel",
            ApiKey {
                id: "cancel".into(),
                concurrent_limit: 1,
                ..Default::default()
            },
        )
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = harness
        .engine
        .admit("cr_cancel", "r1", &RequestDescriptor::default(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "context_cancelled");

    // The slot it briefly took was released on the way out
    let now_ms = Utc::now().timestamp_millis();
    assert_eq!(
        harness
            .store
            .lease_set_count(&StoreKeys::concurrency("cancel"), now_ms)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_full_config_validates() {
    ControlPlaneConfig::default().validate().unwrap();
}
