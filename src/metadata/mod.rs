//! Durable catalog of models, versions, tasks, and their associations.
//!
//! The metadata store is the single source of truth for which artifacts
//! exist, where they live on disk, and which inference tasks each version
//! supports. It is read concurrently by request threads and by the artifact
//! registry; multi-row writes happen inside one transaction.

pub mod duckdb;

pub use duckdb::DuckDbMetadataStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::error::Result;

/// A fully joined model version: model row, version row, and the set of
/// task names the version is associated with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub model_id: i64,
    pub name: String,
    pub model_kind: String,
    pub description: Option<String>,
    pub version_id: i64,
    pub version_label: String,
    pub artifact_path: PathBuf,
    pub artifact_size: u64,
    pub artifact_hash: String,
    pub load_parameters: serde_json::Value,
    pub task_types: BTreeSet<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One row of the catalog listing, grouped by model name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version_id: i64,
    pub version_label: String,
    pub artifact_size: u64,
    pub task_types: BTreeSet<String>,
    pub created_at: i64,
}

/// Input for [`MetadataStore::add_version`].
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub name: String,
    pub version_label: String,
    pub task_name: String,
    pub artifact_path: PathBuf,
    pub artifact_size: u64,
    pub artifact_hash: String,
    pub load_parameters: serde_json::Value,
    pub description: Option<String>,
}

/// What a successful delete removed, so the caller can invalidate cached
/// handles and unlink the artifact file.
#[derive(Debug, Clone)]
pub struct DeletedVersion {
    pub model_name: String,
    pub version_label: String,
    pub artifact_path: PathBuf,
    /// True when this was the model's last version and the model row was
    /// deleted with it.
    pub model_removed: bool,
}

/// Catalog operations.
///
/// Implementations catch their backend's raw errors, log them with context,
/// and surface only typed outcomes.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create tables if needed and seed the default task types.
    async fn init(&self) -> Result<()>;

    /// Upsert the model row, insert or replace the version row, look up or
    /// create the task row, and associate them, all in one transaction.
    async fn add_version(&self, version: NewVersion) -> Result<VersionRecord>;

    /// Fetch one version with its aggregated task set.
    async fn get_version(&self, name: &str, version_label: &str) -> Result<VersionRecord>;

    /// Look up a version by artifact content digest. Used only for
    /// upload-time deduplication; absence is the expected case.
    async fn get_version_by_hash(&self, artifact_hash: &str) -> Result<Option<VersionRecord>>;

    /// Every version of every model, grouped by model name.
    async fn list_versions(&self) -> Result<BTreeMap<String, Vec<VersionSummary>>>;

    /// Remove the version, its task associations, and the owning model row
    /// when no versions remain.
    async fn delete_version(&self, version_id: i64) -> Result<DeletedVersion>;

    /// Replace a version's load parameters. Callers must invalidate any
    /// cached artifact handles afterwards.
    async fn update_load_parameters(
        &self,
        version_id: i64,
        load_parameters: &serde_json::Value,
    ) -> Result<()>;
}

/// Family tag derived from the model name prefix, e.g. `yolo11_plant`
/// and `yolo8_bird` both map to `yolo11`/`yolo8`'s shared prefix rule.
pub fn model_kind_of(name: &str) -> String {
    name.split(['_', '-'])
        .next()
        .unwrap_or(name)
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_kind_from_prefix() {
        assert_eq!(model_kind_of("yolo_plant"), "yolo");
        assert_eq!(model_kind_of("ResNet-classifier"), "resnet");
        assert_eq!(model_kind_of("plain"), "plain");
    }
}
