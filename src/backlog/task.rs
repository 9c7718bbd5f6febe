//! Backlog task model.
//!
//! Tasks are authored externally; the orchestrator only ever writes status
//! (plus outcome notes). Tasks are never deleted, only marked `done` or
//! `blocked`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backlog-owned task identifier.
///
/// Identifiers are opaque strings minted by the backlog store, not by this
/// process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Status of a backlog task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be picked up
    Pending,
    /// Owned by an active session
    InProgress,
    /// Completed and merged
    Done,
    /// Needs human attention before it can proceed
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

/// A unit of backlog work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Short human-readable title
    pub title: String,

    /// Free-text description of what to accomplish
    pub description: String,

    /// Current status
    pub status: TaskStatus,

    /// Priority score; higher runs first
    pub priority: i64,

    /// Tasks that must be `done` before this one is eligible
    #[serde(default)]
    pub depends_on: Vec<TaskId>,

    /// Labels driving handler routing
    #[serde(default)]
    pub labels: Vec<String>,

    /// Pass/fail checks forwarded to the agent and test runner
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Eligibility given the set of completed task ids.
    ///
    /// A task is eligible iff it is `pending` and every dependency is `done`.
    pub fn is_eligible(&self, done: &HashSet<TaskId>) -> bool {
        self.status == TaskStatus::Pending && self.depends_on.iter().all(|dep| done.contains(dep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        Task {
            id: TaskId::from(id),
            title: format!("task {}", id),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: 0,
            depends_on: vec![],
            labels: vec![],
            acceptance_criteria: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn eligibility_requires_pending_and_satisfied_deps() {
        let mut t = task("a");
        t.depends_on = vec![TaskId::from("b"), TaskId::from("c")];

        let mut done = HashSet::new();
        assert!(!t.is_eligible(&done));

        done.insert(TaskId::from("b"));
        assert!(!t.is_eligible(&done));

        done.insert(TaskId::from("c"));
        assert!(t.is_eligible(&done));

        t.status = TaskStatus::InProgress;
        assert!(!t.is_eligible(&done));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Blocked,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }
}
