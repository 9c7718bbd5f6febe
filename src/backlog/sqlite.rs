//! SQLite-backed backlog store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{BacklogError, BacklogStore, Task, TaskFilter, TaskId, TaskStatus};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 0,
    depends_on TEXT NOT NULL DEFAULT '[]',
    labels TEXT NOT NULL DEFAULT '[]',
    acceptance_criteria TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    notes TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority DESC, created_at);
"#;

/// Backlog store persisted in a local SQLite database.
pub struct SqliteBacklog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBacklog {
    /// Open (or create) the backlog database at `path`.
    pub async fn open(path: PathBuf) -> Result<Self, BacklogError> {
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path).map_err(|e| BacklogError::Storage(e.to_string()))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| BacklogError::Storage(e.to_string()))?;
            Ok::<_, BacklogError>(conn)
        })
        .await
        .map_err(|e| BacklogError::Storage(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests and local experiments.
    pub async fn open_in_memory() -> Result<Self, BacklogError> {
        let conn = tokio::task::spawn_blocking(|| {
            let conn =
                Connection::open_in_memory().map_err(|e| BacklogError::Storage(e.to_string()))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| BacklogError::Storage(e.to_string()))?;
            Ok::<_, BacklogError>(conn)
        })
        .await
        .map_err(|e| BacklogError::Storage(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace a task record. Backlog authoring is external to the
    /// orchestrator; this exists for seeding tools and tests.
    pub async fn upsert_task(&self, task: Task) -> Result<(), BacklogError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO tasks
                     (id, title, description, status, priority, depends_on, labels,
                      acceptance_criteria, created_at, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                         COALESCE((SELECT notes FROM tasks WHERE id = ?1), ''))",
                params![
                    task.id.as_str(),
                    task.title,
                    task.description,
                    task.status.as_str(),
                    task.priority,
                    serde_json::to_string(&task.depends_on)
                        .map_err(|e| BacklogError::InvalidRecord(e.to_string()))?,
                    serde_json::to_string(&task.labels)
                        .map_err(|e| BacklogError::InvalidRecord(e.to_string()))?,
                    serde_json::to_string(&task.acceptance_criteria)
                        .map_err(|e| BacklogError::InvalidRecord(e.to_string()))?,
                    task.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| BacklogError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| BacklogError::Storage(e.to_string()))?
    }

    /// Read the accumulated note history for a task.
    pub async fn notes(&self, id: &TaskId) -> Result<String, BacklogError> {
        let conn = self.conn.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT notes FROM tasks WHERE id = ?1",
                params![id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| BacklogError::Storage(e.to_string()))?
            .ok_or(BacklogError::NotFound(id))
        })
        .await
        .map_err(|e| BacklogError::Storage(e.to_string()))?
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let status_raw: String = row.get(3)?;
    let depends_raw: String = row.get(5)?;
    let labels_raw: String = row.get(6)?;
    let criteria_raw: String = row.get(7)?;
    let created_raw: String = row.get(8)?;

    let invalid = |idx: usize, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e)
    };

    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| invalid(3, format!("unknown status '{}'", status_raw).into()))?;
    let depends_on: Vec<TaskId> =
        serde_json::from_str(&depends_raw).map_err(|e| invalid(5, Box::new(e)))?;
    let labels: Vec<String> =
        serde_json::from_str(&labels_raw).map_err(|e| invalid(6, Box::new(e)))?;
    let acceptance_criteria: Vec<String> =
        serde_json::from_str(&criteria_raw).map_err(|e| invalid(7, Box::new(e)))?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map_err(|e| invalid(8, Box::new(e)))?
        .with_timezone(&Utc);

    Ok(Task {
        id: TaskId::new(id),
        title: row.get(1)?,
        description: row.get(2)?,
        status,
        priority: row.get(4)?,
        depends_on,
        labels,
        acceptance_criteria,
        created_at,
    })
}

const TASK_COLUMNS: &str = "id, title, description, status, priority, depends_on, labels, \
                            acceptance_criteria, created_at";

#[async_trait]
impl BacklogStore for SqliteBacklog {
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, BacklogError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut tasks = Vec::new();
            match filter.status {
                Some(status) => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT {} FROM tasks WHERE status = ?1",
                            TASK_COLUMNS
                        ))
                        .map_err(|e| BacklogError::Storage(e.to_string()))?;
                    let rows = stmt
                        .query_map(params![status.as_str()], row_to_task)
                        .map_err(|e| BacklogError::Storage(e.to_string()))?;
                    for row in rows {
                        tasks.push(row.map_err(|e| BacklogError::InvalidRecord(e.to_string()))?);
                    }
                }
                None => {
                    let mut stmt = conn
                        .prepare(&format!("SELECT {} FROM tasks", TASK_COLUMNS))
                        .map_err(|e| BacklogError::Storage(e.to_string()))?;
                    let rows = stmt
                        .query_map([], row_to_task)
                        .map_err(|e| BacklogError::Storage(e.to_string()))?;
                    for row in rows {
                        tasks.push(row.map_err(|e| BacklogError::InvalidRecord(e.to_string()))?);
                    }
                }
            }
            Ok(tasks)
        })
        .await
        .map_err(|e| BacklogError::Storage(e.to_string()))?
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, BacklogError> {
        let conn = self.conn.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id.as_str()],
                row_to_task,
            )
            .optional()
            .map_err(|e| BacklogError::Storage(e.to_string()))
        })
        .await
        .map_err(|e| BacklogError::Storage(e.to_string()))?
    }

    async fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        notes: &str,
    ) -> Result<(), BacklogError> {
        let conn = self.conn.clone();
        let id = id.clone();
        let note_line = if notes.is_empty() {
            String::new()
        } else {
            format!("[{}] {}\n", Utc::now().to_rfc3339(), notes)
        };
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let updated = conn
                .execute(
                    "UPDATE tasks SET status = ?2, notes = notes || ?3 WHERE id = ?1",
                    params![id.as_str(), status.as_str(), note_line],
                )
                .map_err(|e| BacklogError::Storage(e.to_string()))?;
            if updated == 0 {
                return Err(BacklogError::NotFound(id));
            }
            Ok(())
        })
        .await
        .map_err(|e| BacklogError::Storage(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, status: TaskStatus) -> Task {
        Task {
            id: TaskId::from(id),
            title: format!("task {}", id),
            description: "do the thing".to_string(),
            status,
            priority: 5,
            depends_on: vec![TaskId::from("dep-1")],
            labels: vec!["backend".to_string()],
            acceptance_criteria: vec!["tests pass".to_string()],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn round_trips_tasks() {
        let store = SqliteBacklog::open_in_memory().await.unwrap();
        store.upsert_task(sample("t-1", TaskStatus::Pending)).await.unwrap();

        let fetched = store.get_task(&TaskId::from("t-1")).await.unwrap().unwrap();
        assert_eq!(fetched.title, "task t-1");
        assert_eq!(fetched.depends_on, vec![TaskId::from("dep-1")]);
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn filters_by_status() {
        let store = SqliteBacklog::open_in_memory().await.unwrap();
        store.upsert_task(sample("t-1", TaskStatus::Pending)).await.unwrap();
        store.upsert_task(sample("t-2", TaskStatus::Done)).await.unwrap();

        let pending = store
            .list_tasks(TaskFilter::with_status(TaskStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, TaskId::from("t-1"));

        let all = store.list_tasks(TaskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn status_updates_append_notes() {
        let store = SqliteBacklog::open_in_memory().await.unwrap();
        store.upsert_task(sample("t-1", TaskStatus::Pending)).await.unwrap();

        store
            .update_status(&TaskId::from("t-1"), TaskStatus::Blocked, "missing docs")
            .await
            .unwrap();
        store
            .update_status(&TaskId::from("t-1"), TaskStatus::Done, "merged")
            .await
            .unwrap();

        let task = store.get_task(&TaskId::from("t-1")).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);

        let notes = store.notes(&TaskId::from("t-1")).await.unwrap();
        assert!(notes.contains("missing docs"));
        assert!(notes.contains("merged"));
    }

    #[tokio::test]
    async fn missing_task_update_is_an_error() {
        let store = SqliteBacklog::open_in_memory().await.unwrap();
        let err = store
            .update_status(&TaskId::from("nope"), TaskStatus::Done, "")
            .await
            .unwrap_err();
        assert!(matches!(err, BacklogError::NotFound(_)));
    }
}
