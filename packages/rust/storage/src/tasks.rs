//! Durable conversion-task state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kbforge_shared::{ConversionTask, KbError, Result, TaskState, write_atomic};
use libsql::params;
use tokio::sync::Mutex;

use crate::{Storage, db_err};

/// Identity -> task mapping, flushed on every state change.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ConversionTask>>;

    /// Insert or replace a task. Must be durable before returning.
    async fn put(&self, task: &ConversionTask) -> Result<()>;

    /// All tasks, ordered by id.
    async fn list(&self) -> Result<Vec<ConversionTask>>;

    /// Tasks waiting on the batch service (`Submitted` or `Polling`).
    async fn list_active(&self) -> Result<Vec<ConversionTask>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|t| t.state.is_active())
            .collect())
    }

    /// Task counts keyed by state name.
    async fn counts_by_state(&self) -> Result<BTreeMap<String, u64>> {
        let mut counts = BTreeMap::new();
        for task in self.list().await? {
            *counts.entry(task.state.name().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// libSQL implementation
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str =
    "id, file_name, source_path, relative_dir, status, batch_id, last_error, updated_at";

#[async_trait]
impl TaskStore for Storage {
    async fn get(&self, id: &str) -> Result<Option<ConversionTask>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM conversion_tasks WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn put(&self, task: &ConversionTask) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO conversion_tasks
                   (id, file_name, source_path, relative_dir, status, batch_id, last_error, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                   file_name = excluded.file_name,
                   source_path = excluded.source_path,
                   relative_dir = excluded.relative_dir,
                   status = excluded.status,
                   batch_id = excluded.batch_id,
                   last_error = excluded.last_error,
                   updated_at = excluded.updated_at",
                params![
                    task.id.as_str(),
                    task.file_name.as_str(),
                    task.source_path.to_string_lossy().into_owned(),
                    task.relative_dir.to_string_lossy().into_owned(),
                    task.state.name(),
                    task.state.batch_id(),
                    task.state.last_error(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConversionTask>> {
        self.query_tasks(&format!(
            "SELECT {TASK_COLUMNS} FROM conversion_tasks ORDER BY id"
        ))
        .await
    }

    async fn list_active(&self) -> Result<Vec<ConversionTask>> {
        self.query_tasks(&format!(
            "SELECT {TASK_COLUMNS} FROM conversion_tasks
             WHERE status IN ('submitted', 'polling') ORDER BY id"
        ))
        .await
    }

    async fn counts_by_state(&self) -> Result<BTreeMap<String, u64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM conversion_tasks GROUP BY status",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut counts = BTreeMap::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status: String = row.get(0).map_err(db_err)?;
            let count: i64 = row.get(1).map_err(db_err)?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }
}

impl Storage {
    async fn query_tasks(&self, sql: &str) -> Result<Vec<ConversionTask>> {
        let mut rows = self.conn.query(sql, params![]).await.map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_task(&row)?);
        }
        Ok(results)
    }
}

/// Convert a database row to a [`ConversionTask`].
fn row_to_task(row: &libsql::Row) -> Result<ConversionTask> {
    let id: String = row.get(0).map_err(db_err)?;
    let status: String = row.get(4).map_err(db_err)?;
    let batch_id: Option<String> = row.get::<String>(5).ok();
    let last_error: Option<String> = row.get::<String>(6).ok();
    let updated_at: String = row.get(7).map_err(db_err)?;

    Ok(ConversionTask {
        file_name: row.get(1).map_err(db_err)?,
        source_path: PathBuf::from(row.get::<String>(2).map_err(db_err)?),
        relative_dir: PathBuf::from(row.get::<String>(3).map_err(db_err)?),
        state: TaskState::from_parts(&status, batch_id, last_error)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| KbError::Storage(format!("invalid date for task {id}: {e}")))?,
        id,
    })
}

// ---------------------------------------------------------------------------
// JSON file implementation
// ---------------------------------------------------------------------------

/// Task store backed by a single pretty-printed JSON file.
///
/// The whole map is rewritten atomically on every `put`.
pub struct JsonTaskStore {
    path: PathBuf,
    tasks: Mutex<BTreeMap<String, ConversionTask>>,
}

impl JsonTaskStore {
    /// Load `path` if it exists, otherwise start empty.
    pub fn open(path: &Path) -> Result<Self> {
        let tasks = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| KbError::io(path, e))?;
            serde_json::from_str(&content).map_err(|e| {
                KbError::Storage(format!("corrupt task file {}: {e}", path.display()))
            })?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            tasks: Mutex::new(tasks),
        })
    }
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn get(&self, id: &str) -> Result<Option<ConversionTask>> {
        Ok(self.tasks.lock().await.get(id).cloned())
    }

    async fn put(&self, task: &ConversionTask) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        tasks.insert(task.id.clone(), task.clone());

        let json = serde_json::to_vec_pretty(&*tasks)
            .map_err(|e| KbError::Storage(format!("failed to encode tasks: {e}")))?;
        write_atomic(&self.path, &json)
    }

    async fn list(&self) -> Result<Vec<ConversionTask>> {
        Ok(self.tasks.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use kbforge_shared::{SourceEntry, TaskEvent};
    use uuid::Uuid;

    fn make_task(id: &str) -> ConversionTask {
        let entry = SourceEntry {
            file_name: format!("{id}.pdf"),
            absolute_path: PathBuf::from(format!("/kb/raw/sub/{id}.pdf")),
            relative_path: None,
        };
        ConversionTask::from_source(id, &entry, Path::new("/kb/raw"))
    }

    async fn exercise_store(store: &dyn TaskStore) {
        assert!(store.get("a").await.unwrap().is_none());

        let mut a = make_task("a");
        let b = make_task("b");
        store.put(&a).await.unwrap();
        store.put(&b).await.unwrap();

        a.apply(TaskEvent::Submitted { batch_id: "batch-1".into() }).unwrap();
        store.put(&a).await.unwrap();

        let loaded = store.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.state, TaskState::Submitted { batch_id: "batch-1".into() });
        assert_eq!(loaded.relative_dir, PathBuf::from("sub"));

        assert_eq!(store.list().await.unwrap().len(), 2);
        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");

        a.apply(TaskEvent::Queried).unwrap();
        a.apply(TaskEvent::RemoteFailed { error: "bad scan".into() }).unwrap();
        store.put(&a).await.unwrap();
        assert!(store.list_active().await.unwrap().is_empty());
        let failed = store.get("a").await.unwrap().unwrap();
        assert_eq!(failed.state.last_error(), Some("bad scan"));
        assert_eq!(failed.state.batch_id(), Some("batch-1"));
    }

    #[tokio::test]
    async fn sqlite_task_store() {
        let storage = test_storage().await;
        exercise_store(&storage).await;

        let counts = storage.counts_by_state().await.unwrap();
        assert_eq!(counts.get("failed"), Some(&1));
        assert_eq!(counts.get("pending"), Some(&1));
    }

    #[tokio::test]
    async fn sqlite_tasks_survive_reopen() {
        let path = temp_db_path();
        {
            let storage = Storage::open(&path).await.unwrap();
            let mut t = make_task("x");
            t.apply(TaskEvent::Submitted { batch_id: "b".into() }).unwrap();
            t.apply(TaskEvent::Queried).unwrap();
            storage.put(&t).await.unwrap();
        }
        let reopened = Storage::open(&path).await.unwrap();
        let active = reopened.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].state, TaskState::Polling { batch_id: "b".into() });
    }

    #[tokio::test]
    async fn readonly_rejects_task_writes() {
        let path = temp_db_path();
        let rw = Storage::open(&path).await.unwrap();
        rw.put(&make_task("a")).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&path).await.unwrap();
        assert_eq!(ro.list().await.unwrap().len(), 1);
        let result = ro.put(&make_task("b")).await;
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn json_task_store() {
        let path = std::env::temp_dir()
            .join(format!("kbf_test_{}", Uuid::now_v7()))
            .join("tasks.json");
        let store = JsonTaskStore::open(&path).unwrap();
        exercise_store(&store).await;

        let reopened = JsonTaskStore::open(&path).unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 2);
        let counts = reopened.counts_by_state().await.unwrap();
        assert_eq!(counts.get("failed"), Some(&1));
        assert_eq!(counts.get("pending"), Some(&1));
        assert!(reopened.list_active().await.unwrap().is_empty());
    }

    #[test]
    fn corrupt_json_store_is_rejected() {
        let dir = std::env::temp_dir().join(format!("kbf_test_{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tasks.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(JsonTaskStore::open(&path).is_err());
    }
}
