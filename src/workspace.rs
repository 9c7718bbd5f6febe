//! Workspace allocation for sessions.
//!
//! Each session owns exactly one isolated, branch-scoped workspace for its
//! whole Processing→Cleanup span. The allocator is the only writer of
//! workspace lifecycle status, enforces the concurrency ceiling through the
//! safety monitor, and serializes retries of the same task via deterministic
//! branch naming plus an in-flight registry.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::backlog::{Task, TaskId};
use crate::safety::{SafetyMonitor, SessionSlot};
use crate::session::{SessionId, SessionOutcome};
use crate::vcs::{VcsError, VcsHost};

/// Lifecycle status of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    Released,
}

/// An isolated, branch-scoped filesystem checkout owned by one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
    pub status: WorkspaceStatus,
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("workspace io error: {0}")]
    Io(String),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error("task {0} already has an active workspace")]
    TaskInFlight(TaskId),
}

/// Deterministic branch name for a task.
///
/// Determinism is what serializes retries: a second session for the same
/// task lands on the same branch, and branch collision means reuse, not
/// error.
pub fn branch_for_task(id: &TaskId) -> String {
    let sanitized: String = id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("auto/{}", sanitized)
}

/// A claim on a task plus a held concurrency slot.
///
/// Dropping the reservation releases both, so the slot and the same-task
/// exclusion can never outlive the session driver that holds them.
#[derive(Debug)]
pub struct TaskReservation {
    task_id: TaskId,
    in_flight: Arc<Mutex<HashSet<TaskId>>>,
    _slot: SessionSlot,
}

impl Drop for TaskReservation {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.task_id);
        }
    }
}

/// Creates and destroys session workspaces.
pub struct WorkspaceAllocator {
    root: PathBuf,
    vcs: Arc<dyn VcsHost>,
    monitor: Arc<SafetyMonitor>,
    in_flight: Arc<Mutex<HashSet<TaskId>>>,
}

impl WorkspaceAllocator {
    pub fn new(root: PathBuf, vcs: Arc<dyn VcsHost>, monitor: Arc<SafetyMonitor>) -> Self {
        Self {
            root,
            vcs,
            monitor,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claim the task and wait for a concurrency slot.
    ///
    /// This is the queue point: when all slots are busy the caller suspends
    /// here (back-pressure, not failure).
    ///
    /// # Errors
    /// `AllocationError::TaskInFlight` when another session already holds a
    /// workspace for this task.
    pub async fn reserve(&self, task_id: &TaskId) -> Result<TaskReservation, AllocationError> {
        let slot = self.monitor.acquire_slot().await;
        self.reserve_with_slot(task_id, slot)
    }

    /// Claim the task using an already-acquired slot.
    ///
    /// On error the slot is dropped, i.e. released back to the monitor.
    pub fn reserve_with_slot(
        &self,
        task_id: &TaskId,
        slot: SessionSlot,
    ) -> Result<TaskReservation, AllocationError> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|e| AllocationError::Io(e.to_string()))?;
        if !set.insert(task_id.clone()) {
            return Err(AllocationError::TaskInFlight(task_id.clone()));
        }
        Ok(TaskReservation {
            task_id: task_id.clone(),
            in_flight: Arc::clone(&self.in_flight),
            _slot: slot,
        })
    }

    /// Materialize the workspace: branch plus filesystem directory.
    ///
    /// Requires a [`TaskReservation`] obtained from [`reserve`](Self::reserve).
    pub async fn provision(
        &self,
        session_id: SessionId,
        task: &Task,
        _reservation: &TaskReservation,
    ) -> Result<Workspace, AllocationError> {
        let branch = branch_for_task(&task.id);
        self.vcs.create_branch(&branch).await?;

        let dir_name = branch.replace('/', "-");
        let path = self.root.join(dir_name);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| AllocationError::Io(e.to_string()))?;

        info!(session = %session_id, task = %task.id, branch = %branch, "workspace provisioned");
        Ok(Workspace {
            path,
            branch,
            status: WorkspaceStatus::Active,
            session_id,
            task_id: task.id.clone(),
            created_at: Utc::now(),
        })
    }

    /// Reserve and provision in one call.
    pub async fn allocate(
        &self,
        session_id: SessionId,
        task: &Task,
    ) -> Result<(Workspace, TaskReservation), AllocationError> {
        let reservation = self.reserve(&task.id).await?;
        let workspace = self.provision(session_id, task, &reservation).await?;
        Ok((workspace, reservation))
    }

    /// Release a workspace according to the session outcome.
    ///
    /// - `merged` / `abandoned`: the filesystem checkout and the branch are
    ///   both removed.
    /// - `failed`: the checkout is removed; the branch stays so a later
    ///   session for the same task resumes from it.
    /// - `blocked` / `aborted`: everything is preserved for human inspection.
    ///
    /// Idempotent: releasing an already-released workspace is a no-op.
    pub async fn release(
        &self,
        workspace: &mut Workspace,
        outcome: SessionOutcome,
    ) -> Result<(), AllocationError> {
        if workspace.status == WorkspaceStatus::Released {
            return Ok(());
        }
        workspace.status = WorkspaceStatus::Released;

        let remove_files = matches!(
            outcome,
            SessionOutcome::Merged | SessionOutcome::Abandoned | SessionOutcome::Failed
        );
        let remove_branch = matches!(outcome, SessionOutcome::Merged | SessionOutcome::Abandoned);

        if remove_files {
            match tokio::fs::remove_dir_all(&workspace.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(AllocationError::Io(e.to_string())),
            }
        } else {
            debug!(
                path = %workspace.path.display(),
                outcome = outcome.as_str(),
                "preserving workspace for inspection"
            );
        }

        if remove_branch {
            self.vcs.delete_branch(&workspace.branch).await?;
        }

        info!(
            session = %workspace.session_id,
            branch = %workspace.branch,
            outcome = outcome.as_str(),
            "workspace released"
        );
        Ok(())
    }
}
