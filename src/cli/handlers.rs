use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use super::commands::{DeleteCommand, RegisterCommand};
use crate::config::ServiceConfig;
use crate::metadata::{DuckDbMetadataStore, MetadataStore};
use crate::service::{ModelCatalog, RegisterRequest};

async fn open_catalog(config: &ServiceConfig) -> Result<ModelCatalog> {
    let store = Arc::new(
        DuckDbMetadataStore::open(config.storage.database_path())
            .context("opening metadata database")?,
    );
    store.init().await?;
    Ok(ModelCatalog::new(store, config.storage.artifact_root()))
}

pub async fn handle_register(config: &ServiceConfig, cmd: RegisterCommand) -> Result<()> {
    let catalog = open_catalog(config).await?;

    let artifact = tokio::fs::read(&cmd.file)
        .await
        .with_context(|| format!("reading artifact {}", cmd.file.display()))?;
    let filename = cmd
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .context("artifact path has no file name")?
        .to_string();
    let load_parameters = match &cmd.params {
        Some(raw) => serde_json::from_str(raw).context("--params must be a JSON object")?,
        None => serde_json::json!({}),
    };

    let record = catalog
        .register_version(RegisterRequest {
            name: cmd.name,
            version_label: cmd.version,
            task_name: cmd.task,
            filename,
            artifact,
            load_parameters,
            description: cmd.description,
        })
        .await?;

    info!(
        model = %record.name,
        version = %record.version_label,
        hash = %record.artifact_hash,
        "version registered"
    );
    println!(
        "registered {}:{} ({} bytes, sha256 {})",
        record.name, record.version_label, record.artifact_size, record.artifact_hash
    );
    Ok(())
}

pub async fn handle_list(config: &ServiceConfig) -> Result<()> {
    let catalog = open_catalog(config).await?;
    let versions = catalog.list_versions().await?;

    if versions.is_empty() {
        println!("no models registered");
        return Ok(());
    }
    for (name, versions) in versions {
        println!("{name}");
        for summary in versions {
            let tasks: Vec<&str> = summary.task_types.iter().map(String::as_str).collect();
            println!(
                "  {}  [{}]  {} bytes",
                summary.version_label,
                tasks.join(", "),
                summary.artifact_size
            );
        }
    }
    Ok(())
}

pub async fn handle_delete(config: &ServiceConfig, cmd: DeleteCommand) -> Result<()> {
    let catalog = open_catalog(config).await?;
    let deleted = catalog.delete_version(&cmd.name, &cmd.version).await?;

    println!("deleted {}:{}", deleted.model_name, deleted.version_label);
    if deleted.model_removed {
        println!("model {} had no remaining versions and was removed", deleted.model_name);
    }
    Ok(())
}
