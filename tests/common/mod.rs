//! Common test utilities: an in-memory stack with a scripted backend.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use inferflow_core::error::{Error, Result};
use inferflow_core::inference::{
    ArtifactHandle, CancelSignal, InferenceBackend, InferenceEngine, LoadSpec, Predictions,
};
use inferflow_core::jobs::{WorkQueue, WorkQueueConfig};
use inferflow_core::metadata::{DuckDbMetadataStore, MetadataStore, VersionRecord};
use inferflow_core::registry::ArtifactRegistry;
use inferflow_core::results::MemoryResultCache;
use inferflow_core::service::{InferenceService, JobOutcome, ModelCatalog, RegisterRequest};

/// Scripted inference backend. Counts loads, and can be told to delay or
/// fail them, so the cache-concurrency properties are observable.
#[derive(Default)]
pub struct MockBackend {
    loads: AtomicUsize,
    fail_next_load: AtomicBool,
    /// Loads whose artifact path contains the key sleep for the value.
    slow_loads: Mutex<HashMap<String, Duration>>,
    infer_delay: Mutex<Option<Duration>>,
    ignore_cancel: AtomicBool,
    saw_cancel: Arc<AtomicBool>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total `load` invocations, failed ones included.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn fail_next_load(&self) {
        self.fail_next_load.store(true, Ordering::SeqCst);
    }

    pub fn set_load_delay_for(&self, path_fragment: &str, delay: Duration) {
        self.slow_loads
            .lock()
            .unwrap()
            .insert(path_fragment.to_string(), delay);
    }

    pub fn set_infer_delay(&self, delay: Duration) {
        *self.infer_delay.lock().unwrap() = Some(delay);
    }

    /// Make engines sleep through the soft-cancel signal, so only the hard
    /// limit can stop them.
    pub fn ignore_cancellation(&self) {
        self.ignore_cancel.store(true, Ordering::SeqCst);
    }

    pub fn saw_cancellation(&self) -> bool {
        self.saw_cancel.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn load(&self, spec: &LoadSpec) -> Result<ArtifactHandle> {
        self.loads.fetch_add(1, Ordering::SeqCst);

        let path = spec.artifact_path.to_string_lossy().to_string();
        let delay = self
            .slow_loads
            .lock()
            .unwrap()
            .iter()
            .find(|(fragment, _)| path.contains(fragment.as_str()))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_next_load.swap(false, Ordering::SeqCst) {
            return Err(Error::LoadFailure("injected load failure".to_string()));
        }

        Ok(ArtifactHandle::new(
            spec.format,
            Box::new(MockEngine {
                delay: *self.infer_delay.lock().unwrap(),
                ignore_cancel: self.ignore_cancel.load(Ordering::SeqCst),
                saw_cancel: Arc::clone(&self.saw_cancel),
            }),
        ))
    }
}

struct MockEngine {
    delay: Option<Duration>,
    ignore_cancel: bool,
    saw_cancel: Arc<AtomicBool>,
}

#[async_trait]
impl InferenceEngine for MockEngine {
    async fn infer(&self, _payload: &[u8], cancel: &CancelSignal) -> Result<Predictions> {
        if let Some(delay) = self.delay {
            let step = Duration::from_millis(10);
            let mut waited = Duration::ZERO;
            while waited < delay {
                tokio::time::sleep(step).await;
                waited += step;
                if cancel.is_cancelled() {
                    self.saw_cancel.store(true, Ordering::SeqCst);
                    if !self.ignore_cancel {
                        return Err(Error::InferenceFailure(
                            "cancelled after soft time limit".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(serde_json::json!([{"label": "rose", "confidence": 0.91}]))
    }
}

/// Fully wired in-memory stack.
pub struct TestStack {
    pub catalog: ModelCatalog,
    pub service: InferenceService,
    pub registry: Arc<ArtifactRegistry>,
    pub backend: Arc<MockBackend>,
    pub store: Arc<DuckDbMetadataStore>,
    pub queue: Arc<WorkQueue>,
    pub data_dir: TempDir,
}

/// Queue configuration suited to tests: few workers, defaults elsewhere.
pub fn test_queue_config() -> WorkQueueConfig {
    WorkQueueConfig {
        workers_per_queue: 2,
        ..WorkQueueConfig::default()
    }
}

pub async fn start_test_stack(queue_config: WorkQueueConfig) -> TestStack {
    let data_dir = tempfile::tempdir().unwrap();

    let store = Arc::new(DuckDbMetadataStore::open_in_memory().unwrap());
    store.init().await.unwrap();

    let backend = Arc::new(MockBackend::new());
    let registry = Arc::new(ArtifactRegistry::new(store.clone(), backend.clone()));
    let results = Arc::new(MemoryResultCache::new(Duration::from_secs(3600)));
    let queue = Arc::new(WorkQueue::new(
        queue_config,
        Arc::clone(&registry),
        results.clone(),
    ));

    let catalog = ModelCatalog::new(store.clone(), data_dir.path().join("artifacts"))
        .with_registry(Arc::clone(&registry));
    let service = InferenceService::new(queue.clone(), results);

    TestStack {
        catalog,
        service,
        registry,
        backend,
        store,
        queue,
        data_dir,
    }
}

/// Register a version under a fixed `.pt` file name.
pub async fn register_model(
    stack: &TestStack,
    name: &str,
    version: &str,
    task: &str,
    artifact: &[u8],
) -> Result<VersionRecord> {
    stack
        .catalog
        .register_version(RegisterRequest {
            name: name.to_string(),
            version_label: version.to_string(),
            task_name: task.to_string(),
            filename: "weights.pt".to_string(),
            artifact: artifact.to_vec(),
            load_parameters: serde_json::json!({}),
            description: None,
        })
        .await
}

/// Poll a job until it reaches a terminal status.
pub async fn wait_for_terminal(
    stack: &TestStack,
    task: &str,
    job_id: &str,
    timeout: Duration,
) -> JobOutcome {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let outcome = stack
            .service
            .query(task, job_id)
            .await
            .unwrap_or_else(|e| panic!("query for job {job_id} failed: {e}"));
        if outcome.status.is_terminal() {
            return outcome;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} did not reach a terminal state"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
