//! Persistence for siteindexer.
//!
//! - [`BlobStore`]: page text and baselines ([`FsBlobStore`], [`MemoryBlobStore`])
//! - [`TaskStore`]: the per-project sitemap baseline, stored as CSV
//! - [`HistoryStore`]: orchestration checkpoints; [`Storage`] keeps them in a
//!   local libSQL database, [`MemoryHistory`] in memory

pub mod baseline;
pub mod blob;
pub mod history;
mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use siteindexer_shared::{Result, SiteIndexerError};

pub use baseline::TaskStore;
pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use history::{HistoryEvent, HistoryStore, InstanceRecord, InstanceStatus, MemoryHistory};

/// History database handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

fn storage_err(e: impl std::fmt::Display) -> SiteIndexerError {
    SiteIndexerError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path`, applying pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SiteIndexerError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        SiteIndexerError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    async fn running_instance(&self, project: &str, except: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM workflow_instances
                 WHERE project = ?1 AND status = 'running' AND id != ?2",
                params![project, except],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// An instance of `project` created after `id`, if any.
    async fn newer_instance(&self, project: &str, id: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM workflow_instances
                 WHERE project = ?1
                   AND rowid > (SELECT rowid FROM workflow_instances WHERE id = ?2)
                 ORDER BY rowid LIMIT 1",
                params![project, id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn already_running(&self, project: &str, except: &str) -> Result<()> {
        match self.running_instance(project, except).await? {
            Some(instance_id) => Err(SiteIndexerError::AlreadyRunning {
                project: project.to_string(),
                instance_id,
            }),
            None => Ok(()),
        }
    }

    async fn require_instance(&self, id: &str) -> Result<InstanceRecord> {
        self.get_instance(id)
            .await?
            .ok_or_else(|| history::not_found(id))
    }
}

const INSTANCE_COLUMNS: &str = "id, project, state, status, created_at, updated_at, summary_json";

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SiteIndexerError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to an [`InstanceRecord`].
fn row_to_instance(row: &libsql::Row) -> Result<InstanceRecord> {
    let status: String = row.get(3).map_err(storage_err)?;
    let created_at: String = row.get(4).map_err(storage_err)?;
    let updated_at: String = row.get(5).map_err(storage_err)?;
    let summary = match row.get::<String>(6).ok() {
        Some(json) => Some(serde_json::from_str(&json).map_err(storage_err)?),
        None => None,
    };

    Ok(InstanceRecord {
        id: row.get::<String>(0).map_err(storage_err)?,
        project: row.get::<String>(1).map_err(storage_err)?,
        state: row.get::<String>(2).map_err(storage_err)?,
        status: status.parse()?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
        summary,
    })
}

#[async_trait]
impl HistoryStore for Storage {
    async fn begin_instance(&self, id: &str, project: &str) -> Result<InstanceRecord> {
        self.already_running(project, id).await?;

        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn
            .execute(
                "INSERT INTO workflow_instances (id, project, state, status, created_at, updated_at)
                 VALUES (?1, ?2, 'start', 'running', ?3, ?3)",
                params![id, project, now.as_str()],
            )
            .await;

        if let Err(e) = inserted {
            // Lost a race against another starter for the same project.
            self.already_running(project, id).await?;
            return Err(storage_err(e));
        }

        self.require_instance(id).await
    }

    async fn reopen_instance(&self, id: &str) -> Result<InstanceRecord> {
        let record = self.require_instance(id).await?;
        if matches!(
            record.status,
            InstanceStatus::Completed | InstanceStatus::Degraded
        ) {
            return Err(history::not_resumable(&record));
        }
        self.already_running(&record.project, id).await?;
        if let Some(newer) = self.newer_instance(&record.project, id).await? {
            return Err(history::superseded(&record, &newer));
        }

        let now = Utc::now().to_rfc3339();
        if let Err(e) = self
            .conn
            .execute(
                "UPDATE workflow_instances SET status = 'running', updated_at = ?1 WHERE id = ?2",
                params![now.as_str(), id],
            )
            .await
        {
            self.already_running(&record.project, id).await?;
            return Err(storage_err(e));
        }

        self.require_instance(id).await
    }

    async fn load_events(&self, id: &str) -> Result<Vec<HistoryEvent>> {
        let mut rows = self
            .conn
            .query(
                "SELECT seq, step_id, result_json, recorded_at
                 FROM workflow_events WHERE instance_id = ?1 ORDER BY seq",
                params![id],
            )
            .await
            .map_err(storage_err)?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let result: String = row.get(2).map_err(storage_err)?;
            let recorded_at: String = row.get(3).map_err(storage_err)?;
            events.push(HistoryEvent {
                seq: row.get::<i64>(0).map_err(storage_err)?,
                step_id: row.get::<String>(1).map_err(storage_err)?,
                result: serde_json::from_str(&result).map_err(storage_err)?,
                recorded_at: parse_time(&recorded_at)?,
            });
        }
        Ok(events)
    }

    async fn append_event(
        &self,
        id: &str,
        step_id: &str,
        result: &serde_json::Value,
    ) -> Result<bool> {
        let json = serde_json::to_string(result).map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn
            .execute(
                "INSERT INTO workflow_events (instance_id, step_id, result_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(instance_id, step_id) DO NOTHING",
                params![id, step_id, json.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        // Recording a step counts as progress for staleness checks.
        self.conn
            .execute(
                "UPDATE workflow_instances SET updated_at = ?1 WHERE id = ?2",
                params![now.as_str(), id],
            )
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }

    async fn set_state(&self, id: &str, state: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn
            .execute(
                "UPDATE workflow_instances SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![state, now.as_str(), id],
            )
            .await
            .map_err(storage_err)?;
        if affected == 0 {
            return Err(history::not_found(id));
        }
        Ok(())
    }

    async fn finish_instance(
        &self,
        id: &str,
        status: InstanceStatus,
        summary: &serde_json::Value,
    ) -> Result<()> {
        let json = serde_json::to_string(summary).map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn
            .execute(
                "UPDATE workflow_instances
                 SET status = ?1, summary_json = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![status.as_str(), json.as_str(), now.as_str(), id],
            )
            .await
            .map_err(storage_err)?;
        if affected == 0 {
            return Err(history::not_found(id));
        }
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_instance(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn list_instances(
        &self,
        project: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InstanceRecord>> {
        let limit = limit as i64;
        let mut rows = match project {
            Some(project) => self
                .conn
                .query(
                    &format!(
                        "SELECT {INSTANCE_COLUMNS} FROM workflow_instances
                         WHERE project = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2"
                    ),
                    params![project, limit],
                )
                .await,
            None => self
                .conn
                .query(
                    &format!(
                        "SELECT {INSTANCE_COLUMNS} FROM workflow_instances
                         ORDER BY created_at DESC, id DESC LIMIT ?1"
                    ),
                    params![limit],
                )
                .await,
        }
        .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_instance(&row)?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    async fn test_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("history.db"))
            .await
            .expect("open test db");
        (dir, storage)
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let (_dir, storage) = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let s1 = Storage::open(&path).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&path).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn instance_lifecycle() {
        let (_dir, storage) = test_storage().await;
        let id = Uuid::now_v7().to_string();

        let record = storage.begin_instance(&id, "contoso").await.unwrap();
        assert_eq!(record.status, InstanceStatus::Running);
        assert_eq!(record.state, "start");

        storage.set_state(&id, "crawling").await.unwrap();
        storage
            .finish_instance(&id, InstanceStatus::Degraded, &json!({"crawled": 2}))
            .await
            .unwrap();

        let record = storage.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(record.state, "crawling");
        assert_eq!(record.status, InstanceStatus::Degraded);
        assert_eq!(record.summary, Some(json!({"crawled": 2})));
    }

    #[tokio::test]
    async fn second_running_instance_is_rejected() {
        let (_dir, storage) = test_storage().await;
        let first = Uuid::now_v7().to_string();
        let second = Uuid::now_v7().to_string();

        storage.begin_instance(&first, "contoso").await.unwrap();
        let err = storage.begin_instance(&second, "contoso").await.unwrap_err();
        assert!(matches!(
            err,
            SiteIndexerError::AlreadyRunning { ref instance_id, .. } if *instance_id == first
        ));

        storage
            .finish_instance(&first, InstanceStatus::Failed, &json!(null))
            .await
            .unwrap();
        storage.begin_instance(&second, "contoso").await.unwrap();

        // The failed one cannot be reopened while the second is running.
        assert!(matches!(
            storage.reopen_instance(&first).await,
            Err(SiteIndexerError::AlreadyRunning { .. })
        ));
    }

    #[tokio::test]
    async fn events_are_recorded_once_in_order() {
        let (_dir, storage) = test_storage().await;
        let id = Uuid::now_v7().to_string();
        storage.begin_instance(&id, "p").await.unwrap();

        assert!(storage.append_event(&id, "baseline.read", &json!([])).await.unwrap());
        assert!(storage.append_event(&id, "sitemap.fetch", &json!(["a"])).await.unwrap());
        assert!(!storage.append_event(&id, "baseline.read", &json!(["x"])).await.unwrap());

        let events = storage.load_events(&id).await.unwrap();
        let steps: Vec<_> = events.iter().map(|e| e.step_id.as_str()).collect();
        assert_eq!(steps, ["baseline.read", "sitemap.fetch"]);
        assert_eq!(events[0].result, json!([]));
    }

    #[tokio::test]
    async fn reopen_failed_instance() {
        let (_dir, storage) = test_storage().await;
        let id = Uuid::now_v7().to_string();
        storage.begin_instance(&id, "p").await.unwrap();
        storage
            .finish_instance(&id, InstanceStatus::Failed, &json!({}))
            .await
            .unwrap();

        let record = storage.reopen_instance(&id).await.unwrap();
        assert_eq!(record.status, InstanceStatus::Running);

        storage
            .finish_instance(&id, InstanceStatus::Completed, &json!({}))
            .await
            .unwrap();
        assert!(storage.reopen_instance(&id).await.is_err());
    }

    #[tokio::test]
    async fn superseded_instance_cannot_reopen() {
        let (_dir, storage) = test_storage().await;
        let old = Uuid::now_v7().to_string();
        let new = Uuid::now_v7().to_string();

        storage.begin_instance(&old, "contoso").await.unwrap();
        storage
            .finish_instance(&old, InstanceStatus::Failed, &json!({}))
            .await
            .unwrap();
        storage.begin_instance(&new, "contoso").await.unwrap();
        storage
            .finish_instance(&new, InstanceStatus::Completed, &json!({}))
            .await
            .unwrap();

        let err = storage.reopen_instance(&old).await.unwrap_err();
        assert!(err.to_string().contains("superseded"));
        let record = storage.get_instance(&old).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn list_most_recent_first() {
        let (_dir, storage) = test_storage().await;
        let mut ids = Vec::new();
        for project in ["a", "b", "a"] {
            let id = Uuid::now_v7().to_string();
            storage.begin_instance(&id, project).await.unwrap();
            storage
                .finish_instance(&id, InstanceStatus::Completed, &json!({}))
                .await
                .unwrap();
            ids.push(id);
        }

        let all = storage.list_instances(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, ids[2]);

        let only_a = storage.list_instances(Some("a"), 1).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].id, ids[2]);
    }
}
