//! Backlog store interface and implementations.
//!
//! The backlog is an external system of record. The orchestrator never caches
//! task status across polling cycles; each status write is a single
//! idempotent update keyed by task identifier.

mod memory;
mod sqlite;
mod task;

pub use memory::InMemoryBacklog;
pub use sqlite::SqliteBacklog;
pub use task::{Task, TaskId, TaskStatus};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("backlog storage error: {0}")]
    Storage(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("invalid task record: {0}")]
    InvalidRecord(String),
}

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
        }
    }
}

/// External backlog store.
///
/// Assumed eventually-consistent; callers tolerate stale reads by
/// re-validating dependency status immediately before acting on a task.
#[async_trait]
pub trait BacklogStore: Send + Sync {
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, BacklogError>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, BacklogError>;

    /// Idempotent status update with a human-readable note appended to the
    /// task's history.
    async fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        notes: &str,
    ) -> Result<(), BacklogError>;
}
