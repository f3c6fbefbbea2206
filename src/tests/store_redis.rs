//! Redis script tests against a containerized instance.
//!
//! These exercise the Lua side of the coordination primitives: the
//! in-memory backend mirrors their semantics, but only a real Redis proves
//! the scripts themselves. Requires a working Docker daemon, like the rest
//! of the testcontainers suite.

use std::time::Duration;

use testcontainers_modules::{
    redis::Redis,
    testcontainers::{ContainerAsync, runners::AsyncRunner},
};

use crate::{
    config::RedisStoreConfig,
    store::{RedisStore, Store, UserMessageAcquire},
};

/// Start a Redis container and connect a store to it. The container lives
/// as long as the returned handle is held.
async fn redis_store() -> (RedisStore, ContainerAsync<Redis>) {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start Redis container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get port");

    let config = RedisStoreConfig {
        url: format!("redis://{}:{}", host, port),
        ..Default::default()
    };
    let store = RedisStore::from_config(&config)
        .await
        .expect("Failed to connect to Redis container");
    (store, container)
}

#[tokio::test]
async fn test_ping() {
    let (store, _container) = redis_store().await;
    store.ping().await.unwrap();
}

#[tokio::test]
async fn test_lease_set_scripts() {
    let (store, _container) = redis_store().await;
    let now = 1_000_000i64;

    // Increment purges expired members and returns cardinality
    assert_eq!(
        store
            .lease_set_incr("concurrency:t1", "r1", now + 10_000, 60_000, now)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .lease_set_incr("concurrency:t1", "r2", now + 10_000, 60_000, now)
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        store.lease_set_count("concurrency:t1", now).await.unwrap(),
        2
    );

    // An expired member does not count and is purged by the next write
    let later = now + 20_000;
    assert_eq!(
        store.lease_set_count("concurrency:t1", later).await.unwrap(),
        0
    );
    assert_eq!(
        store
            .lease_set_incr("concurrency:t1", "r3", later + 10_000, 60_000, later)
            .await
            .unwrap(),
        1
    );

    // Decrement removes the member and deletes the empty key
    assert_eq!(
        store
            .lease_set_decr("concurrency:t1", "r3", later)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        store.get_bytes("concurrency:t1").await.unwrap(),
        None,
        "empty lease set is deleted"
    );
}

#[tokio::test]
async fn test_lease_refresh_does_not_resurrect() {
    let (store, _container) = redis_store().await;
    let now = 1_000_000i64;

    store
        .lease_set_incr("concurrency:t2", "r1", now + 1_000, 60_000, now)
        .await
        .unwrap();
    assert!(
        store
            .lease_set_refresh("concurrency:t2", "r1", now + 30_000, now, 60_000)
            .await
            .unwrap()
    );

    let later = now + 60_000;
    assert!(
        !store
            .lease_set_refresh("concurrency:t2", "r1", later + 30_000, later, 60_000)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_incr_with_expiry_and_queue_decr() {
    let (store, _container) = redis_store().await;

    assert_eq!(
        store
            .incr_with_expiry("rate_limit:t:minute:1", Duration::from_secs(60))
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .incr_with_expiry("rate_limit:t:minute:1", Duration::from_secs(60))
            .await
            .unwrap(),
        2
    );

    store
        .incr_with_expiry("concurrency:queue:t", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(store.queue_decr("concurrency:queue:t").await.unwrap(), 0);
    // Draining below zero clamps and deletes
    assert_eq!(store.queue_decr("concurrency:queue:t").await.unwrap(), 0);
}

#[tokio::test]
async fn test_token_compare_scripts() {
    let (store, _container) = redis_store().await;

    store
        .set_bytes("lock:t", b"token-a", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(!store.compare_and_delete("lock:t", "token-b").await.unwrap());
    assert!(
        store
            .compare_and_expire("lock:t", "token-a", 120_000)
            .await
            .unwrap()
    );
    assert!(store.compare_and_delete("lock:t", "token-a").await.unwrap());
    assert_eq!(store.get_bytes("lock:t").await.unwrap(), None);
}

#[tokio::test]
async fn test_user_message_lock_scripts() {
    let (store, _container) = redis_store().await;
    let now = 1_000_000i64;
    let lock = "user_msg_queue_lock:a1";
    let last = "user_msg_queue_last:a1";

    assert_eq!(
        store
            .user_message_acquire(lock, last, "r1", 60_000, 2_000, now)
            .await
            .unwrap(),
        UserMessageAcquire::Acquired
    );
    assert_eq!(
        store
            .user_message_acquire(lock, last, "r2", 60_000, 2_000, now)
            .await
            .unwrap(),
        UserMessageAcquire::Occupied
    );

    assert!(!store.user_message_release(lock, last, "r2", now).await.unwrap());
    assert!(store.user_message_release(lock, last, "r1", now).await.unwrap());

    // Gap enforced from the release stamp
    assert_eq!(
        store
            .user_message_acquire(lock, last, "r3", 60_000, 2_000, now + 500)
            .await
            .unwrap(),
        UserMessageAcquire::Cooldown { remaining_ms: 1_500 }
    );
    assert_eq!(
        store
            .user_message_acquire(lock, last, "r3", 60_000, 2_000, now + 2_500)
            .await
            .unwrap(),
        UserMessageAcquire::Acquired
    );
}

#[tokio::test]
async fn test_hash_set_if_falsy_script() {
    let (store, _container) = redis_store().await;

    let fields = vec![
        ("isActivated".to_string(), "true".to_string()),
        ("expiresAt".to_string(), "2025-06-01T00:00:00Z".to_string()),
    ];
    assert!(
        store
            .hash_set_if_falsy("apikey:t1", "isActivated", &fields)
            .await
            .unwrap()
    );
    assert!(
        !store
            .hash_set_if_falsy("apikey:t1", "isActivated", &fields)
            .await
            .unwrap()
    );

    // An explicit "false" guard still counts as falsy
    store.hash_set("apikey:t2", "isActivated", "false").await.unwrap();
    assert!(
        store
            .hash_set_if_falsy("apikey:t2", "isActivated", &fields)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_counter_pipeline_and_lists() {
    let (store, _container) = redis_store().await;
    use crate::store::CounterOp;

    let ops = vec![
        CounterOp::HashIncrBy {
            key: "usage:t1".into(),
            field: "totalRequests".into(),
            delta: 1,
        },
        CounterOp::HashIncrByFloat {
            key: "usage:cost:daily:t1:2025-01-01".into(),
            field: "total".into(),
            delta: 0.25,
        },
        CounterOp::IncrByFloat {
            key: "rate_limit:cost:t1".into(),
            delta: 0.25,
        },
        CounterOp::Expire {
            key: "usage:t1".into(),
            ttl: Duration::from_secs(3600),
        },
    ];
    store.apply_counters(&ops).await.unwrap();
    store.apply_counters(&ops).await.unwrap();

    let usage = store.hash_get_all("usage:t1").await.unwrap();
    assert_eq!(usage.get("totalRequests").unwrap(), "2");
    assert_eq!(store.get_f64("rate_limit:cost:t1").await.unwrap(), 0.5);

    for i in 0..10 {
        store
            .list_push_capped("concurrency:queue:wait_times:t1", f64::from(i), 5, Duration::from_secs(60))
            .await
            .unwrap();
    }
    let values = store
        .list_values("concurrency:queue:wait_times:t1")
        .await
        .unwrap();
    assert_eq!(values.len(), 5);
    assert_eq!(values[0], 9.0);
}
