//! In-memory registry of loaded artifact handles.
//!
//! Maps a `model:version:task` key to a loaded [`ArtifactHandle`], loading
//! lazily on first use. A per-key async mutex guarantees at most one load
//! per key while keeping distinct keys fully concurrent; the lock objects
//! themselves are created under the concurrent map's shard lock so two
//! racing callers can never end up with different locks for the same key.
//!
//! Load failures are returned to the caller and never cached, so a `get`
//! retried after the underlying problem is fixed succeeds without a
//! process restart.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::inference::{ArtifactFormat, ArtifactHandle, InferenceBackend, LoadSpec};
use crate::metadata::MetadataStore;

fn cache_key(model: &str, version: &str, task: &str) -> String {
    format!("{model}:{version}:{task}")
}

/// Usage counters for the registry.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Handles currently resident.
    pub cached: usize,
    /// Requests answered from the cache.
    pub hits: u64,
    /// Backend loads performed.
    pub loads: u64,
}

pub struct ArtifactRegistry {
    store: Arc<dyn MetadataStore>,
    backend: Arc<dyn InferenceBackend>,
    handles: DashMap<String, Arc<ArtifactHandle>>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    hits: AtomicU64,
    loads: AtomicU64,
}

impl ArtifactRegistry {
    pub fn new(store: Arc<dyn MetadataStore>, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            store,
            backend,
            handles: DashMap::new(),
            key_locks: DashMap::new(),
            hits: AtomicU64::new(0),
            loads: AtomicU64::new(0),
        }
    }

    /// Lock for one cache key, created lazily. The `entry` call holds the
    /// map's shard lock, so concurrent callers for an unseen key all
    /// observe the same mutex.
    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Get the loaded handle for `(model, version, task)`, loading it on
    /// first use.
    pub async fn get(
        &self,
        model: &str,
        version: &str,
        task: &str,
    ) -> Result<Arc<ArtifactHandle>> {
        let key = cache_key(model, version, task);

        // check - lock - check
        if let Some(handle) = self.handles.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(handle.value()));
        }

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        if let Some(handle) = self.handles.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(handle.value()));
        }

        let record = self.store.get_version(model, version).await?;
        if !record.task_types.contains(task) {
            return Err(Error::UnsupportedTask {
                model: model.to_string(),
                version: version.to_string(),
                task: task.to_string(),
            });
        }
        if tokio::fs::metadata(&record.artifact_path).await.is_err() {
            return Err(Error::LoadFailure(format!(
                "artifact file missing: {}",
                record.artifact_path.display()
            )));
        }

        let spec = LoadSpec {
            format: ArtifactFormat::from_path(&record.artifact_path)?,
            artifact_path: record.artifact_path,
            load_parameters: record.load_parameters,
        };
        let handle = Arc::new(self.backend.load(&spec).await?);

        self.handles.insert(key.clone(), Arc::clone(&handle));
        self.loads.fetch_add(1, Ordering::Relaxed);
        debug!(%key, format = ?handle.format(), "loaded artifact");
        Ok(handle)
    }

    /// Drop every cached handle under `(model, version)`, whatever its task.
    ///
    /// Takes each per-key lock, so an in-flight load for the same key
    /// completes (or fails) before its handle is discarded; the two
    /// operations are linearized at the key lock.
    pub async fn invalidate(&self, model: &str, version: &str) -> usize {
        let prefix = format!("{model}:{version}:");
        let keys: Vec<String> = self
            .key_locks
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.starts_with(&prefix))
            .collect();

        let mut dropped = 0;
        for key in keys {
            let lock = self.key_lock(&key);
            let _guard = lock.lock().await;
            if self.handles.remove(&key).is_some() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            info!(model, version, dropped, "invalidated cached artifact handles");
        }
        dropped
    }

    /// Preload a handle for every `(version, task)` pair in the catalog.
    ///
    /// Failures are logged and skipped; a model that cannot load at startup
    /// stays loadable lazily once the problem is fixed.
    pub async fn warm_up(&self) -> usize {
        let catalog = match self.store.list_versions().await {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!("warm-up skipped, listing failed: {e}");
                return 0;
            }
        };

        let mut loaded = 0;
        for (name, versions) in catalog {
            for summary in versions {
                for task in &summary.task_types {
                    match self.get(&name, &summary.version_label, task).await {
                        Ok(_) => loaded += 1,
                        Err(e) => warn!(
                            model = %name,
                            version = %summary.version_label,
                            %task,
                            "warm-up load failed: {e}"
                        ),
                    }
                }
            }
        }
        info!(loaded, "artifact warm-up complete");
        loaded
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            cached: self.handles.len(),
            hits: self.hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
        }
    }
}
