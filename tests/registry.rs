//! Concurrency properties of the artifact registry.

mod common;

use common::{register_model, start_test_stack, test_queue_config};
use inferflow_core::error::Error;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_at_most_one_load_per_key() {
    let stack = start_test_stack(test_queue_config()).await;
    register_model(&stack, "plantnet", "1.0", "classify", b"weights-a")
        .await
        .unwrap();
    // Widen the race window: every concurrent get arrives while the first
    // load is still in flight.
    stack
        .backend
        .set_load_delay_for("plantnet", Duration::from_millis(100));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..32 {
        let registry = Arc::clone(&stack.registry);
        tasks.spawn(async move { registry.get("plantnet", "1.0", "classify").await });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
    }

    assert_eq!(stack.backend.load_count(), 1);
    assert_eq!(stack.registry.stats().cached, 1);
}

#[tokio::test]
async fn test_distinct_keys_load_concurrently() {
    let stack = start_test_stack(test_queue_config()).await;
    register_model(&stack, "slowmodel", "1.0", "classify", b"weights-slow")
        .await
        .unwrap();
    register_model(&stack, "fastmodel", "1.0", "classify", b"weights-fast")
        .await
        .unwrap();
    stack
        .backend
        .set_load_delay_for("slowmodel", Duration::from_millis(500));

    let registry = Arc::clone(&stack.registry);
    let slow = tokio::spawn(async move { registry.get("slowmodel", "1.0", "classify").await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The fast key must not wait behind the slow key's load.
    let started = tokio::time::Instant::now();
    stack.registry.get("fastmodel", "1.0", "classify").await.unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "distinct keys blocked on each other"
    );

    slow.await.unwrap().unwrap();
    assert_eq!(stack.backend.load_count(), 2);
}

#[tokio::test]
async fn test_load_failure_is_not_cached() {
    let stack = start_test_stack(test_queue_config()).await;
    register_model(&stack, "plantnet", "1.0", "classify", b"weights-a")
        .await
        .unwrap();

    stack.backend.fail_next_load();
    let err = stack
        .registry
        .get("plantnet", "1.0", "classify")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LoadFailure(_)));
    assert_eq!(stack.registry.stats().cached, 0);

    // The failure was not remembered; the retry loads fresh.
    stack.registry.get("plantnet", "1.0", "classify").await.unwrap();
    assert_eq!(stack.backend.load_count(), 2);
}

#[tokio::test]
async fn test_unsupported_task_is_rejected() {
    let stack = start_test_stack(test_queue_config()).await;
    register_model(&stack, "plantnet", "1.0", "classify", b"weights-a")
        .await
        .unwrap();

    let err = stack
        .registry
        .get("plantnet", "1.0", "detect")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedTask { .. }));
    assert_eq!(stack.backend.load_count(), 0);
}

#[tokio::test]
async fn test_missing_model_is_not_found() {
    let stack = start_test_stack(test_queue_config()).await;
    let err = stack
        .registry
        .get("ghost", "9.9", "detect")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_invalidate_drops_handles_and_forces_reload() {
    let stack = start_test_stack(test_queue_config()).await;
    register_model(&stack, "plantnet", "1.0", "classify", b"weights-a")
        .await
        .unwrap();

    stack.registry.get("plantnet", "1.0", "classify").await.unwrap();
    assert_eq!(stack.registry.stats().cached, 1);

    let dropped = stack.registry.invalidate("plantnet", "1.0").await;
    assert_eq!(dropped, 1);
    assert_eq!(stack.registry.stats().cached, 0);

    stack.registry.get("plantnet", "1.0", "classify").await.unwrap();
    assert_eq!(stack.backend.load_count(), 2);
}

#[tokio::test]
async fn test_invalidate_does_not_race_in_flight_load() {
    let stack = start_test_stack(test_queue_config()).await;
    register_model(&stack, "plantnet", "1.0", "classify", b"weights-a")
        .await
        .unwrap();
    stack
        .backend
        .set_load_delay_for("plantnet", Duration::from_millis(300));

    let registry = Arc::clone(&stack.registry);
    let loader = tokio::spawn(async move { registry.get("plantnet", "1.0", "classify").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Invalidation waits for the key lock, so it is ordered strictly after
    // the in-flight load; neither side deadlocks.
    let registry = Arc::clone(&stack.registry);
    let invalidator = tokio::spawn(async move { registry.invalidate("plantnet", "1.0").await });

    let loaded = tokio::time::timeout(Duration::from_secs(5), loader)
        .await
        .expect("load deadlocked")
        .unwrap();
    loaded.unwrap();
    tokio::time::timeout(Duration::from_secs(5), invalidator)
        .await
        .expect("invalidate deadlocked")
        .unwrap();

    // The handle loaded before the invalidation is gone; the next get
    // reloads from current metadata.
    stack.registry.get("plantnet", "1.0", "classify").await.unwrap();
    assert_eq!(stack.backend.load_count(), 2);
}

#[tokio::test]
async fn test_warm_up_preloads_catalog() {
    let stack = start_test_stack(test_queue_config()).await;
    register_model(&stack, "plantnet", "1.0", "classify", b"weights-a")
        .await
        .unwrap();
    register_model(&stack, "birdnet", "2.0", "detect", b"weights-b")
        .await
        .unwrap();

    let loaded = stack.registry.warm_up().await;
    assert_eq!(loaded, 2);
    assert_eq!(stack.registry.stats().cached, 2);

    // Requests after warm-up are cache hits.
    stack.registry.get("plantnet", "1.0", "classify").await.unwrap();
    assert_eq!(stack.backend.load_count(), 2);
    assert_eq!(stack.registry.stats().hits, 1);
}
