//! DuckDB-backed metadata store.

use async_trait::async_trait;
use chrono::Utc;
use duckdb::{params, Connection};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{
    model_kind_of, DeletedVersion, MetadataStore, NewVersion, VersionRecord, VersionSummary,
};
use crate::error::{Error, Result};

/// Task types seeded at initialization when the `tasks` table is empty.
const DEFAULT_TASKS: [(&str, &str); 2] = [
    ("detect", "object detection"),
    ("classify", "image classification"),
];

const VERSION_JOIN: &str = "
    SELECT
        m.id, m.name, m.model_kind, m.description, m.created_at, m.updated_at,
        v.id, v.version_label, v.artifact_path, v.artifact_size, v.artifact_hash,
        v.load_parameters, v.created_at, v.updated_at,
        string_agg(t.name, ',')
    FROM models m
    JOIN versions v ON m.id = v.model_id
    LEFT JOIN version_tasks vt ON v.id = vt.version_id
    LEFT JOIN tasks t ON vt.task_id = t.id";

pub struct DuckDbMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbMetadataStore {
    /// Open (or create) a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, used by tests and throwaway tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_record(row: &duckdb::Row<'_>) -> duckdb::Result<VersionRecord> {
        let load_parameters: Option<String> = row.get(11)?;
        let task_types: Option<String> = row.get(14)?;
        Ok(VersionRecord {
            model_id: row.get(0)?,
            name: row.get(1)?,
            model_kind: row.get(2)?,
            description: row.get(3)?,
            version_id: row.get(6)?,
            version_label: row.get(7)?,
            artifact_path: PathBuf::from(row.get::<_, String>(8)?),
            artifact_size: row.get::<_, i64>(9)? as u64,
            artifact_hash: row.get(10)?,
            load_parameters: parse_parameters(load_parameters.as_deref()),
            task_types: split_task_types(task_types.as_deref()),
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn query_one_version(
        conn: &Connection,
        where_clause: &str,
        bind: &[&dyn duckdb::ToSql],
    ) -> Result<Option<VersionRecord>> {
        let sql = format!("{VERSION_JOIN} {where_clause} GROUP BY ALL");
        let mut stmt = conn.prepare(&sql)?;
        match stmt.query_row(bind, Self::row_to_record) {
            Ok(record) => Ok(Some(record)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl MetadataStore for DuckDbMetadataStore {
    async fn init(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            "CREATE SEQUENCE IF NOT EXISTS models_id_seq;
             CREATE SEQUENCE IF NOT EXISTS versions_id_seq;
             CREATE SEQUENCE IF NOT EXISTS tasks_id_seq;
             CREATE TABLE IF NOT EXISTS models (
                 id BIGINT PRIMARY KEY DEFAULT nextval('models_id_seq'),
                 name TEXT NOT NULL UNIQUE,
                 model_kind TEXT NOT NULL,
                 description TEXT,
                 created_at BIGINT NOT NULL,
                 updated_at BIGINT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS versions (
                 id BIGINT PRIMARY KEY DEFAULT nextval('versions_id_seq'),
                 model_id BIGINT NOT NULL,
                 version_label TEXT NOT NULL,
                 artifact_path TEXT NOT NULL,
                 artifact_size BIGINT NOT NULL,
                 artifact_hash TEXT NOT NULL UNIQUE,
                 load_parameters TEXT,
                 created_at BIGINT NOT NULL,
                 updated_at BIGINT NOT NULL,
                 UNIQUE (model_id, version_label)
             );
             CREATE TABLE IF NOT EXISTS tasks (
                 id BIGINT PRIMARY KEY DEFAULT nextval('tasks_id_seq'),
                 name TEXT NOT NULL UNIQUE,
                 description TEXT,
                 created_at BIGINT NOT NULL,
                 updated_at BIGINT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS version_tasks (
                 version_id BIGINT NOT NULL,
                 task_id BIGINT NOT NULL,
                 created_at BIGINT NOT NULL,
                 PRIMARY KEY (version_id, task_id)
             );",
        )?;

        let seeded: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))?;
        if seeded == 0 {
            let now = Utc::now().timestamp_millis();
            for (name, description) in DEFAULT_TASKS {
                conn.execute(
                    "INSERT INTO tasks (name, description, created_at, updated_at)
                     VALUES (?, ?, ?, ?)",
                    params![name, description, now, now],
                )?;
            }
        }

        info!("metadata store initialized");
        Ok(())
    }

    async fn add_version(&self, version: NewVersion) -> Result<VersionRecord> {
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            let now = Utc::now().timestamp_millis();

            // 1. Upsert the model row.
            tx.execute(
                "INSERT OR IGNORE INTO models (name, model_kind, description, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    version.name,
                    model_kind_of(&version.name),
                    version.description,
                    now,
                    now
                ],
            )?;
            let model_id: i64 = tx.query_row(
                "SELECT id FROM models WHERE name = ?",
                [&version.name],
                |r| r.get(0),
            )?;

            // 2. Insert or replace the version row. An in-place update keeps
            //    the version id stable so existing task associations survive.
            let parameters = serde_json::to_string(&version.load_parameters)?;
            let existing: Option<i64> = match tx.query_row(
                "SELECT id FROM versions WHERE model_id = ? AND version_label = ?",
                params![model_id, version.version_label],
                |r| r.get(0),
            ) {
                Ok(id) => Some(id),
                Err(duckdb::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(log_store_error("add_version", e.into())),
            };
            let version_id: i64 = match existing {
                Some(id) => {
                    tx.execute(
                        "UPDATE versions
                         SET artifact_path = ?, artifact_size = ?, artifact_hash = ?,
                             load_parameters = ?, updated_at = ?
                         WHERE id = ?",
                        params![
                            version.artifact_path.to_string_lossy().into_owned(),
                            version.artifact_size as i64,
                            version.artifact_hash,
                            parameters,
                            now,
                            id
                        ],
                    )?;
                    id
                }
                None => {
                    tx.execute(
                        "INSERT INTO versions
                         (model_id, version_label, artifact_path, artifact_size,
                          artifact_hash, load_parameters, created_at, updated_at)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                        params![
                            model_id,
                            version.version_label,
                            version.artifact_path.to_string_lossy().into_owned(),
                            version.artifact_size as i64,
                            version.artifact_hash,
                            parameters,
                            now,
                            now
                        ],
                    )?;
                    tx.query_row(
                        "SELECT id FROM versions WHERE model_id = ? AND version_label = ?",
                        params![model_id, version.version_label],
                        |r| r.get(0),
                    )?
                }
            };

            // 3. Look up or create the task row.
            let task_id: i64 = match tx.query_row(
                "SELECT id FROM tasks WHERE name = ?",
                [&version.task_name],
                |r| r.get(0),
            ) {
                Ok(id) => id,
                Err(duckdb::Error::QueryReturnedNoRows) => {
                    tx.execute(
                        "INSERT INTO tasks (name, description, created_at, updated_at)
                         VALUES (?, NULL, ?, ?)",
                        params![version.task_name, now, now],
                    )?;
                    tx.query_row("SELECT id FROM tasks WHERE name = ?", [&version.task_name], |r| {
                        r.get(0)
                    })?
                }
                Err(e) => return Err(log_store_error("add_version", e.into())),
            };

            // 4. Associate version and task.
            tx.execute(
                "INSERT OR IGNORE INTO version_tasks (version_id, task_id, created_at)
                 VALUES (?, ?, ?)",
                params![version_id, task_id, now],
            )?;

            tx.commit()
                .map_err(|e| log_store_error("add_version", e.into()))?;
        }

        info!(
            model = %version.name,
            version = %version.version_label,
            task = %version.task_name,
            "registered model version"
        );
        self.get_version(&version.name, &version.version_label).await
    }

    async fn get_version(&self, name: &str, version_label: &str) -> Result<VersionRecord> {
        let conn = self.conn.lock().await;
        Self::query_one_version(
            &conn,
            "WHERE m.name = ? AND v.version_label = ?",
            &[&name, &version_label],
        )?
        .ok_or_else(|| Error::NotFound(format!("model {name}:{version_label}")))
    }

    async fn get_version_by_hash(&self, artifact_hash: &str) -> Result<Option<VersionRecord>> {
        let conn = self.conn.lock().await;
        Self::query_one_version(&conn, "WHERE v.artifact_hash = ?", &[&artifact_hash])
    }

    async fn list_versions(&self) -> Result<BTreeMap<String, Vec<VersionSummary>>> {
        let conn = self.conn.lock().await;
        let run = || -> Result<BTreeMap<String, Vec<VersionSummary>>> {
            let mut stmt = conn.prepare(
                "SELECT m.name, v.id, v.version_label, v.artifact_size, v.created_at,
                        string_agg(t.name, ',')
                 FROM models m
                 JOIN versions v ON m.id = v.model_id
                 LEFT JOIN version_tasks vt ON v.id = vt.version_id
                 LEFT JOIN tasks t ON vt.task_id = t.id
                 GROUP BY ALL
                 ORDER BY m.name, v.version_label",
            )?;
            let rows = stmt.query_map([], |row| {
                let task_types: Option<String> = row.get(5)?;
                Ok((
                    row.get::<_, String>(0)?,
                    VersionSummary {
                        version_id: row.get(1)?,
                        version_label: row.get(2)?,
                        artifact_size: row.get::<_, i64>(3)? as u64,
                        task_types: split_task_types(task_types.as_deref()),
                        created_at: row.get(4)?,
                    },
                ))
            })?;

            let mut catalog: BTreeMap<String, Vec<VersionSummary>> = BTreeMap::new();
            for row in rows {
                let (name, summary) = row?;
                catalog.entry(name).or_default().push(summary);
            }
            Ok(catalog)
        };

        // A failed listing degrades to an empty catalog rather than an error.
        match run() {
            Ok(catalog) => Ok(catalog),
            Err(e) => {
                error!("listing versions failed: {e}");
                Ok(BTreeMap::new())
            }
        }
    }

    async fn delete_version(&self, version_id: i64) -> Result<DeletedVersion> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let (model_id, model_name, version_label, artifact_path): (i64, String, String, String) =
            match tx.query_row(
                "SELECT v.model_id, m.name, v.version_label, v.artifact_path
                 FROM versions v
                 JOIN models m ON m.id = v.model_id
                 WHERE v.id = ?",
                [version_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            ) {
                Ok(row) => row,
                Err(duckdb::Error::QueryReturnedNoRows) => {
                    return Err(Error::NotFound(format!("version id {version_id}")))
                }
                Err(e) => return Err(log_store_error("delete_version", e.into())),
            };

        tx.execute("DELETE FROM version_tasks WHERE version_id = ?", [version_id])?;
        tx.execute("DELETE FROM versions WHERE id = ?", [version_id])?;

        let remaining: i64 = tx.query_row(
            "SELECT COUNT(*) FROM versions WHERE model_id = ?",
            [model_id],
            |r| r.get(0),
        )?;
        let model_removed = remaining == 0;
        if model_removed {
            tx.execute("DELETE FROM models WHERE id = ?", [model_id])?;
        }

        tx.commit()
            .map_err(|e| log_store_error("delete_version", e.into()))?;

        info!(
            model = %model_name,
            version = %version_label,
            model_removed,
            "deleted model version"
        );
        Ok(DeletedVersion {
            model_name,
            version_label,
            artifact_path: PathBuf::from(artifact_path),
            model_removed,
        })
    }

    async fn update_load_parameters(
        &self,
        version_id: i64,
        load_parameters: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE versions SET load_parameters = ?, updated_at = ? WHERE id = ?",
            params![
                serde_json::to_string(load_parameters)?,
                Utc::now().timestamp_millis(),
                version_id
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("version id {version_id}")));
        }
        Ok(())
    }
}

fn log_store_error(operation: &str, err: Error) -> Error {
    error!("{operation} failed: {err}");
    err
}

fn parse_parameters(raw: Option<&str>) -> serde_json::Value {
    match raw {
        None | Some("") => serde_json::json!({}),
        Some(text) => serde_json::from_str(text).unwrap_or_else(|e| {
            warn!("discarding unparsable load parameters: {e}");
            serde_json::json!({})
        }),
    }
}

fn split_task_types(raw: Option<&str>) -> BTreeSet<String> {
    raw.map(|text| {
        text.split(',')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
