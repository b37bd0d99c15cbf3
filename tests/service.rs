//! End-to-end facade behavior: registration dedup, result TTL, catalog
//! admin operations.

mod common;

use common::{register_model, start_test_stack, test_queue_config, wait_for_terminal};
use inferflow_core::error::Error;
use inferflow_core::jobs::JobStatus;
use std::time::Duration;

#[tokio::test]
async fn test_identical_artifact_is_rejected_as_duplicate() {
    let stack = start_test_stack(test_queue_config()).await;

    register_model(&stack, "plantnet", "1.0", "classify", b"weights-a")
        .await
        .unwrap();

    // Same bytes under a different version label: rejected.
    let err = register_model(&stack, "plantnet", "1.1", "classify", b"weights-a")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateArtifact(_)));

    // Same bytes under a different model name: still rejected.
    let err = register_model(&stack, "othernet", "1.0", "classify", b"weights-a")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateArtifact(_)));

    // Different bytes go through.
    register_model(&stack, "plantnet", "1.1", "classify", b"weights-b")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_registration_writes_artifact_and_metadata() {
    let stack = start_test_stack(test_queue_config()).await;

    let record = register_model(&stack, "plantnet", "1.0", "classify", b"weights-a")
        .await
        .unwrap();
    assert_eq!(record.model_kind, "plantnet");
    assert_eq!(record.artifact_size, 9);
    assert!(record.task_types.contains("classify"));
    assert!(record.artifact_path.exists());

    let catalog = stack.catalog.list_versions().await.unwrap();
    assert_eq!(catalog["plantnet"].len(), 1);
}

#[tokio::test]
async fn test_expired_result_reports_not_found() {
    let mut config = test_queue_config();
    config.result_ttl = Duration::from_secs(1);
    let stack = start_test_stack(config).await;
    register_model(&stack, "plantnet", "1.0", "classify", b"weights-a")
        .await
        .unwrap();

    let job_id = stack
        .service
        .submit("plantnet", "1.0", "classify", b"image".to_vec())
        .await
        .unwrap();
    let outcome = wait_for_terminal(&stack, "classify", &job_id, Duration::from_secs(5)).await;
    assert_eq!(outcome.status, JobStatus::Success);
    assert!(outcome.predictions.is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;

    // The job succeeded, but its cached result is gone: the caller gets
    // NotFound, never stale or empty success data.
    let err = stack.service.query("classify", &job_id).await.unwrap_err();
    match err {
        Error::NotFound(reason) => assert!(reason.contains("result expired")),
        other => panic!("expected NotFound, got {other}"),
    }
}

#[tokio::test]
async fn test_query_unknown_job_is_not_found() {
    let stack = start_test_stack(test_queue_config()).await;
    let err = stack
        .service
        .query("classify", "never-submitted")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_version_cascades() {
    let stack = start_test_stack(test_queue_config()).await;
    let record = register_model(&stack, "plantnet", "1.0", "classify", b"weights-a")
        .await
        .unwrap();

    // Load a handle so the delete has something to invalidate.
    stack.registry.get("plantnet", "1.0", "classify").await.unwrap();

    let deleted = stack.catalog.delete_version("plantnet", "1.0").await.unwrap();
    assert!(deleted.model_removed);
    assert!(!record.artifact_path.exists());
    assert_eq!(stack.registry.stats().cached, 0);
    assert!(stack.catalog.list_versions().await.unwrap().is_empty());

    let err = stack.catalog.get_version("plantnet", "1.0").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_parameter_update_invalidates_cached_handle() {
    let stack = start_test_stack(test_queue_config()).await;
    register_model(&stack, "plantnet", "1.0", "classify", b"weights-a")
        .await
        .unwrap();

    stack.registry.get("plantnet", "1.0", "classify").await.unwrap();
    assert_eq!(stack.backend.load_count(), 1);

    stack
        .catalog
        .update_load_parameters("plantnet", "1.0", &serde_json::json!({"device": "cuda:0"}))
        .await
        .unwrap();

    // The stale handle was dropped; the next get reloads with the new
    // parameters visible in the metadata.
    stack.registry.get("plantnet", "1.0", "classify").await.unwrap();
    assert_eq!(stack.backend.load_count(), 2);

    let record = stack.catalog.get_version("plantnet", "1.0").await.unwrap();
    assert_eq!(record.load_parameters["device"], "cuda:0");
}

#[tokio::test]
async fn test_reregistering_version_replaces_artifact() {
    let stack = start_test_stack(test_queue_config()).await;
    let first = register_model(&stack, "plantnet", "1.0", "classify", b"weights-a")
        .await
        .unwrap();

    stack.registry.get("plantnet", "1.0", "classify").await.unwrap();

    let second = register_model(&stack, "plantnet", "1.0", "classify", b"weights-b")
        .await
        .unwrap();
    assert_eq!(first.version_id, second.version_id);
    assert_ne!(first.artifact_hash, second.artifact_hash);

    // Replacement invalidated the cached handle.
    stack.registry.get("plantnet", "1.0", "classify").await.unwrap();
    assert_eq!(stack.backend.load_count(), 2);

    let catalog = stack.catalog.list_versions().await.unwrap();
    assert_eq!(catalog["plantnet"].len(), 1);
}

#[tokio::test]
async fn test_unrecognized_artifact_extension_is_rejected() {
    let stack = start_test_stack(test_queue_config()).await;
    let err = stack
        .catalog
        .register_version(inferflow_core::service::RegisterRequest {
            name: "plantnet".to_string(),
            version_label: "1.0".to_string(),
            task_name: "classify".to_string(),
            filename: "weights.tar.gz".to_string(),
            artifact: b"weights-a".to_vec(),
            load_parameters: serde_json::json!({}),
            description: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LoadFailure(_)));
}
