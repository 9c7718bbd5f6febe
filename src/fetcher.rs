//! Task fetcher: eligibility filtering and deterministic ordering.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::backlog::{BacklogError, BacklogStore, Task, TaskFilter, TaskId, TaskStatus};
use crate::util::retry_with_backoff;

/// Queries the backlog for work the orchestrator may pick up.
///
/// Read-only: fetching never mutates task status.
pub struct TaskFetcher {
    store: Arc<dyn BacklogStore>,
}

impl TaskFetcher {
    pub fn new(store: Arc<dyn BacklogStore>) -> Self {
        Self { store }
    }

    /// All eligible tasks, priority-ordered.
    ///
    /// A task is eligible iff its status is `pending` and every dependency is
    /// `done`. Ordering is descending priority, ties broken by oldest
    /// creation time, then by task id, so repeated runs over the same backlog
    /// produce the same queue.
    ///
    /// # Errors
    /// Backlog IO failures are retried with backoff here; the final error is
    /// surfaced to the caller.
    pub async fn fetch_eligible(&self) -> Result<Vec<Task>, BacklogError> {
        let tasks = retry_with_backoff(3, Duration::from_millis(200), "list_tasks", || {
            self.store.list_tasks(TaskFilter::default())
        })
        .await?;

        let done: HashSet<TaskId> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .map(|t| t.id.clone())
            .collect();

        let mut eligible: Vec<Task> = tasks
            .into_iter()
            .filter(|t| t.is_eligible(&done))
            .collect();

        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(eligible)
    }

    /// Re-validate a task immediately before allocation.
    ///
    /// The backlog is eventually consistent, so a task that looked eligible
    /// at fetch time may have changed underneath us.
    pub async fn revalidate(&self, id: &TaskId) -> Result<bool, BacklogError> {
        let task = match self.store.get_task(id).await? {
            Some(task) => task,
            None => return Ok(false),
        };
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        for dep in &task.depends_on {
            match self.store.get_task(dep).await? {
                Some(dep_task) if dep_task.status == TaskStatus::Done => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}
