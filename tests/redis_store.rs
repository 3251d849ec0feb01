//! Runs the Redis store and its Lua scripts against a live server.
//!
//! Ignored by default. Run with
//! `REDIS_URL=redis://localhost:6379/15 cargo test --test redis_store -- --ignored`.

use shapr::config::RedisConfig;
use shapr::store::{Connector, RedisConnector, Store};
use std::sync::Arc;
use std::time::Duration;

async fn live_store() -> Option<Arc<dyn Store>> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL not set; skipping");
        return None;
    };

    let config = RedisConfig {
        url,
        ..RedisConfig::default()
    };
    Some(
        RedisConnector::new(config)
            .connect()
            .await
            .expect("connect to REDIS_URL"),
    )
}

fn unique(prefix: &str) -> String {
    format!("shapr_test:{}:{}", prefix, uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "needs a live Redis at REDIS_URL"]
async fn sliding_window_allows_five_then_denies() {
    let Some(store) = live_store().await else {
        return;
    };
    let key = unique("window");
    let window = Duration::from_secs(60);

    for expected in (0..5).rev() {
        let admission = store.admit_sliding_window(&key, 5, window).await.unwrap();
        assert!(admission.allowed);
        assert_eq!(admission.remaining, expected);
    }

    let denied = store.admit_sliding_window(&key, 5, window).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);

    // Denials are not recorded
    assert_eq!(store.window_occupancy(&key, window).await.unwrap(), 5);

    store.delete(&key).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs a live Redis at REDIS_URL"]
async fn concurrent_admissions_never_exceed_limit() {
    let Some(store) = live_store().await else {
        return;
    };
    let key = Arc::new(unique("concurrent"));

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let store = Arc::clone(&store);
            let key = Arc::clone(&key);
            tokio::spawn(async move {
                store
                    .admit_sliding_window(&key, 15, Duration::from_secs(60))
                    .await
                    .unwrap()
                    .allowed
            })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 15);

    store.delete(&key).await.unwrap();
}

#[tokio::test]
#[ignore = "needs a live Redis at REDIS_URL"]
async fn counter_ttl_is_set_only_on_first_increment() {
    let Some(store) = live_store().await else {
        return;
    };
    let key = unique("quota");

    assert_eq!(
        store
            .incr_with_initial_ttl(&key, Duration::from_secs(300))
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .incr_with_initial_ttl(&key, Duration::from_secs(86_400))
            .await
            .unwrap(),
        2
    );
    assert_eq!(store.get_counter(&key).await.unwrap(), 2);

    let ttl = store.ttl(&key).await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(300));

    store.delete(&key).await.unwrap();
}

#[tokio::test]
#[ignore = "needs a live Redis at REDIS_URL"]
async fn pattern_delete_only_touches_matching_keys() {
    let Some(store) = live_store().await else {
        return;
    };
    let prefix = unique("cache");
    let ttl = Duration::from_secs(60);

    store.set_ex(&format!("{}:a:1", prefix), "1", ttl).await.unwrap();
    store.set_ex(&format!("{}:a:2", prefix), "2", ttl).await.unwrap();
    store.set_ex(&format!("{}:b:1", prefix), "3", ttl).await.unwrap();

    let removed = store
        .delete_matching(&format!("{}:a:*", prefix))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(
        store.get(&format!("{}:b:1", prefix)).await.unwrap().as_deref(),
        Some("3")
    );

    store.delete(&format!("{}:b:1", prefix)).await.unwrap();
}
