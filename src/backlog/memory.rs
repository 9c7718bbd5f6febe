//! In-memory backlog store for tests and local experiments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BacklogError, BacklogStore, Task, TaskFilter, TaskId, TaskStatus};

struct Record {
    task: Task,
    notes: Vec<String>,
}

/// Backlog store held entirely in process memory.
#[derive(Default)]
pub struct InMemoryBacklog {
    records: RwLock<HashMap<TaskId, Record>>,
}

impl InMemoryBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, task: Task) {
        let mut records = self.records.write().await;
        records.insert(
            task.id.clone(),
            Record {
                task,
                notes: Vec::new(),
            },
        );
    }

    /// Note history for a task, oldest first.
    pub async fn notes(&self, id: &TaskId) -> Vec<String> {
        let records = self.records.read().await;
        records
            .get(id)
            .map(|r| r.notes.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BacklogStore for InMemoryBacklog {
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, BacklogError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| filter.status.map_or(true, |s| r.task.status == s))
            .map(|r| r.task.clone())
            .collect())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, BacklogError> {
        let records = self.records.read().await;
        Ok(records.get(id).map(|r| r.task.clone()))
    }

    async fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        notes: &str,
    ) -> Result<(), BacklogError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| BacklogError::NotFound(id.clone()))?;
        record.task.status = status;
        if !notes.is_empty() {
            record.notes.push(notes.to_string());
        }
        Ok(())
    }
}
