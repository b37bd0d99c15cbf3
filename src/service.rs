//! Service facades consumed by the HTTP layer and the CLI.
//!
//! [`ModelCatalog`] is the registration/admin surface over the metadata
//! store and the artifact directory; [`InferenceService`] is the job
//! surface over the queue and the result cache. Both are constructed
//! explicitly at process start and injected where needed.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::inference::ArtifactFormat;
use crate::jobs::{JobId, JobQueue, JobRequest, JobStatus};
use crate::metadata::{
    DeletedVersion, MetadataStore, NewVersion, VersionRecord, VersionSummary,
};
use crate::registry::ArtifactRegistry;
use crate::results::ResultCache;

/// One version upload, as handed over by the HTTP layer or the CLI.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub name: String,
    pub version_label: String,
    pub task_name: String,
    /// Original upload file name; its extension selects the artifact format.
    pub filename: String,
    pub artifact: Vec<u8>,
    pub load_parameters: serde_json::Value,
    pub description: Option<String>,
}

/// Registration and admin operations over the model catalog.
pub struct ModelCatalog {
    store: Arc<dyn MetadataStore>,
    artifact_root: PathBuf,
    registry: Option<Arc<ArtifactRegistry>>,
}

impl ModelCatalog {
    pub fn new(store: Arc<dyn MetadataStore>, artifact_root: PathBuf) -> Self {
        Self {
            store,
            artifact_root,
            registry: None,
        }
    }

    /// Attach a live artifact registry so catalog mutations invalidate
    /// cached handles. The CLI runs without one.
    pub fn with_registry(mut self, registry: Arc<ArtifactRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register a model version.
    ///
    /// The content digest is computed in a single pass over the upload
    /// before anything is written, so a half-written artifact can never be
    /// the hashed one. Byte-identical uploads are rejected whatever name
    /// or version they claim.
    pub async fn register_version(&self, request: RegisterRequest) -> Result<VersionRecord> {
        let filename = Path::new(&request.filename)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::LoadFailure(format!("invalid artifact file name '{}'", request.filename))
            })?
            .to_string();
        ArtifactFormat::from_path(Path::new(&filename))?;

        let mut hasher = Sha256::new();
        hasher.update(&request.artifact);
        let artifact_hash = hex::encode(hasher.finalize());

        if let Some(existing) = self.store.get_version_by_hash(&artifact_hash).await? {
            return Err(Error::DuplicateArtifact(format!(
                "identical artifact already registered as {}:{}",
                existing.name, existing.version_label
            )));
        }

        let artifact_dir = self.artifact_root.join(&request.name);
        tokio::fs::create_dir_all(&artifact_dir).await?;
        let artifact_path = artifact_dir.join(format!("{}_{}", request.version_label, filename));
        tokio::fs::write(&artifact_path, &request.artifact).await?;

        let record = self
            .store
            .add_version(NewVersion {
                name: request.name.clone(),
                version_label: request.version_label.clone(),
                task_name: request.task_name,
                artifact_path: artifact_path.clone(),
                artifact_size: request.artifact.len() as u64,
                artifact_hash,
                load_parameters: request.load_parameters,
                description: request.description,
            })
            .await;

        let record = match record {
            Ok(record) => record,
            Err(e) => {
                // The metadata row is authoritative; without it the file is
                // an orphan.
                if let Err(unlink) = tokio::fs::remove_file(&artifact_path).await {
                    warn!("could not remove orphaned artifact {}: {unlink}", artifact_path.display());
                }
                return Err(e);
            }
        };

        // Re-registering an existing (model, version) replaces its artifact;
        // a stale handle must not outlive that.
        self.invalidate(&request.name, &request.version_label).await;
        Ok(record)
    }

    pub async fn list_versions(
        &self,
    ) -> Result<std::collections::BTreeMap<String, Vec<VersionSummary>>> {
        self.store.list_versions().await
    }

    pub async fn get_version(&self, name: &str, version_label: &str) -> Result<VersionRecord> {
        self.store.get_version(name, version_label).await
    }

    /// Delete a version, drop its cached handles, and unlink its artifact.
    pub async fn delete_version(
        &self,
        name: &str,
        version_label: &str,
    ) -> Result<DeletedVersion> {
        let record = self.store.get_version(name, version_label).await?;
        let deleted = self.store.delete_version(record.version_id).await?;

        self.invalidate(name, version_label).await;
        if let Err(e) = tokio::fs::remove_file(&deleted.artifact_path).await {
            warn!(
                "could not remove artifact {}: {e}",
                deleted.artifact_path.display()
            );
        }
        info!(model = %name, version = %version_label, "version deleted");
        Ok(deleted)
    }

    /// Replace a version's load parameters and drop its cached handles so
    /// the next load picks them up.
    pub async fn update_load_parameters(
        &self,
        name: &str,
        version_label: &str,
        load_parameters: &serde_json::Value,
    ) -> Result<()> {
        let record = self.store.get_version(name, version_label).await?;
        self.store
            .update_load_parameters(record.version_id, load_parameters)
            .await?;
        self.invalidate(name, version_label).await;
        Ok(())
    }

    async fn invalidate(&self, name: &str, version_label: &str) {
        if let Some(registry) = &self.registry {
            registry.invalidate(name, version_label).await;
        }
    }
}

/// Terminal or in-flight outcome of one job poll.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predictions: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Job submission and polling surface.
pub struct InferenceService {
    queue: Arc<dyn JobQueue>,
    results: Arc<dyn ResultCache>,
}

impl InferenceService {
    pub fn new(queue: Arc<dyn JobQueue>, results: Arc<dyn ResultCache>) -> Self {
        Self { queue, results }
    }

    /// Enqueue one inference job; returns its id immediately.
    pub async fn submit(
        &self,
        model_name: &str,
        version_label: &str,
        task_name: &str,
        payload: Vec<u8>,
    ) -> Result<JobId> {
        self.queue
            .submit(JobRequest {
                model_name: model_name.to_string(),
                version_label: version_label.to_string(),
                task_name: task_name.to_string(),
                payload,
            })
            .await
    }

    /// Current status of a job, with predictions once successful.
    ///
    /// Unknown ids are `NotFound`; a successful job whose cached result has
    /// expired is `NotFound("result expired")`, never stale or empty data.
    pub async fn query(&self, task_name: &str, job_id: &str) -> Result<JobOutcome> {
        let state = self
            .queue
            .state(job_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;

        let status = JobStatus::from_native(&state.native);
        match status {
            JobStatus::Success => {
                let key = format!("{task_name}:{job_id}");
                match self.results.get(&key).await {
                    Some(predictions) => Ok(JobOutcome {
                        job_id: job_id.to_string(),
                        status,
                        predictions: Some(predictions),
                        error: None,
                    }),
                    None => Err(Error::NotFound("result expired".to_string())),
                }
            }
            JobStatus::Failure => Ok(JobOutcome {
                job_id: job_id.to_string(),
                status,
                predictions: None,
                error: state.error.or_else(|| Some("job failed".to_string())),
            }),
            JobStatus::Pending | JobStatus::Processing => Ok(JobOutcome {
                job_id: job_id.to_string(),
                status,
                predictions: None,
                error: None,
            }),
        }
    }
}
